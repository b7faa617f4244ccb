//! # sensorgw-engine
//!
//! Event reactor, connection handlers and the MQTT broker link of the
//! sensor gateway.
//!
//! ### Key Submodules:
//! - `reactor/`: Readiness loop, handler table and timer dispatch
//! - `broker/`: Broker client seam and the non-blocking MQTT client
//! - `document`: Pool-backed JSON documents for published readings
//! - `runtime`: Bootstrap from a validated configuration

pub mod broker;
pub mod document;
pub mod error;
pub mod reactor;
pub mod runtime;

pub use error::GatewayError;
pub use runtime::{bind_listener, connect_broker, run_gateway};
