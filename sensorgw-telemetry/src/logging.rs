//! ## sensorgw-telemetry::logging
//! **Human-readable structured logging**
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to every
//! target.

use tracing::info_span;
use tracing_subscriber::{fmt, EnvFilter};

use crate::TelemetryError;

#[derive(Clone, Copy, Debug)]
pub struct GatewayLogger;

impl GatewayLogger {
    /// Installs the global subscriber. Fails if one is already installed.
    pub fn init(default_level: &str) -> Result<(), TelemetryError> {
        fmt()
            .with_env_filter(Self::filter(default_level))
            .with_target(true)
            .with_thread_names(true)
            .try_init()
            .map_err(|e| TelemetryError::Subscriber(e.to_string()))
    }

    fn filter(default_level: &str) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    }

    /// Records a process lifecycle milestone (startup, bind, broker link).
    pub fn lifecycle(event: &str, detail: &str) {
        let span = info_span!("lifecycle", event = event);
        let _entered = span.enter();
        tracing::info!(detail = detail, "Gateway {}", event);
    }
}
