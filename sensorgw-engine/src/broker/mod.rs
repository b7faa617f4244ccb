//! ## sensorgw-engine::broker
//! **Broker client seam**
//!
//! The reactor drives the upstream pub/sub link only through
//! [`BrokerClient`]: it polls the client's socket, pumps reads and writes
//! when the socket is ready, and calls housekeeping from a heartbeat timer.
//! The client never blocks after its initial connect.

mod mqtt_client;

pub use mqtt_client::{MqttClient, MqttOptions};

use std::io;
use std::os::fd::RawFd;

use mio::event::Source;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket buffer full or empty; try again on the next readiness edge.
    #[error("Operation would block")]
    WouldBlock,

    #[error("Connection to broker lost")]
    ConnectionLost,

    #[error("Not connected to broker")]
    NoConnection,

    #[error("Broker refused connection (return code {0})")]
    Refused(u8),

    #[error("Broker protocol error: {0}")]
    Protocol(String),

    #[error("Broker I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BrokerError {
    /// Errors that tear the link down and call for a reconnect.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost | BrokerError::NoConnection)
    }
}

/// Outcome of one read pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Bytes were processed; more may be pending.
    Again,
    /// The socket is drained.
    Idle,
}

pub trait BrokerClient {
    /// Socket to register with the reactor, if one exists.
    fn source(&mut self) -> Option<&mut dyn Source>;

    fn raw_fd(&self) -> Option<RawFd>;

    fn connect(&mut self) -> Result<(), BrokerError>;

    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), BrokerError>;

    /// Queues a message. Delivery happens in `pump_write`.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, retain: bool)
        -> Result<(), BrokerError>;

    fn pump_read(&mut self) -> Result<Pump, BrokerError>;

    /// Writes as much queued data as the socket accepts in one call.
    fn pump_write(&mut self) -> Result<(), BrokerError>;

    /// Keep-alive and liveness checks; called from the heartbeat timer.
    fn housekeeping(&mut self) -> Result<(), BrokerError>;

    /// Whether outbound bytes are queued.
    fn wants_write(&self) -> bool;

    /// Drops the current socket and starts a non-blocking connect.
    fn reconnect_async(&mut self) -> Result<(), BrokerError>;
}
