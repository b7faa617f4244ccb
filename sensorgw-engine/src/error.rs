use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::broker::BrokerError;

/// Startup failures. Anything after the reactor starts is handled in place.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] sensorgw_config::ConfigError),

    #[error("Block pool error: {0}")]
    Pool(#[from] sensorgw_core::PoolError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] sensorgw_telemetry::TelemetryError),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Broker startup failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Event poll error: {0}")]
    Poll(#[from] io::Error),
}
