//! # Sensor Gateway Telemetry
//!
//! Subscriber setup for `tracing` and the gateway's prometheus counters.

pub mod logging;
pub mod metrics;

pub use logging::GatewayLogger;
pub use metrics::GatewayMetrics;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Metrics exposition is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}
