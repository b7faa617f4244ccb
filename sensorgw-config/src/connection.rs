//! Per-connection buffering limits and framing mode.

use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// What a sensor connection does with its inbound frames.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    /// Decode sensor frames and publish readings.
    #[default]
    Sensor,
    /// Return each length-prefixed payload to the peer.
    Echo,
    /// Drop each length-prefixed frame and publish the descriptor number.
    Discard,
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolMode::Sensor => "sensor",
            ProtocolMode::Echo => "echo",
            ProtocolMode::Discard => "discard",
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bytes requested per `read` call.
    #[validate(range(min = 64, max = 65536))]
    pub read_chunk: usize,

    /// Unparsed inbound bytes tolerated before the peer is cut off.
    #[validate(range(min = 16, max = 16777216))]
    pub flood_limit: usize,

    /// Largest payload accepted in echo mode.
    #[validate(range(min = 1, max = 65535))]
    pub max_echo_frame: usize,

    pub mode: ProtocolMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk: 4096,
            flood_limit: 10240,
            max_echo_frame: 1024,
            mode: ProtocolMode::Sensor,
        }
    }
}
