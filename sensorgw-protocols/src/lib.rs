//! # Sensor Gateway Wire Codecs
//!
//! Byte-exact codecs for everything the gateway puts on or takes off a socket:
//! the fixed sensor frame, the generic length-prefixed echo frame and the MQTT
//! 3.1.1 packets spoken to the broker.

pub mod echo;
pub mod mqtt;
pub mod sensor;

pub use echo::EchoFrameError;
pub use mqtt::{MqttPacket, MqttParseError};
pub use sensor::{SensorFrame, SensorReading, SensorStep};
