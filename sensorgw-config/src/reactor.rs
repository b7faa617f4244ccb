//! Event loop sizing and timer cadence.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    /// Readiness events drained per poll.
    #[validate(range(min = 1, max = 65536))]
    pub max_events: usize,

    /// Poll timeout while timers are pending.
    #[validate(range(min = 1, max = 1000))]
    pub tick_ms: u64,

    /// Broker housekeeping interval.
    #[validate(range(min = 1, max = 4294967295u64))]
    pub heartbeat_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_events: 1024,
            tick_ms: 100,
            heartbeat_ms: 60_000,
        }
    }
}
