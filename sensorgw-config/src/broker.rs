//! Upstream MQTT broker link.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// MQTT 3.1.1 servers only have to accept identifiers up to 23 bytes.
    #[validate(length(min = 1, max = 23))]
    pub client_id: String,

    #[validate(range(min = 1))]
    pub keepalive_secs: u16,

    /// Bound on the initial blocking connect at startup.
    #[validate(range(min = 1, max = 60000))]
    pub connect_timeout_ms: u64,

    #[validate(length(min = 1))]
    pub subscribe_topic: String,

    /// Destination of decoded sensor readings.
    #[validate(custom(function = validation::validate_publish_topic))]
    pub data_topic: String,

    /// Destination of descriptor numbers from discard-mode connections.
    #[validate(custom(function = validation::validate_publish_topic))]
    pub diagnostic_topic: String,

    /// Only QoS 0 and 1 are supported.
    #[validate(range(max = 1))]
    pub qos: u8,
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "gateway_client".into(),
            keepalive_secs: 60,
            connect_timeout_ms: 5000,
            subscribe_topic: "opi/sensor".into(),
            data_topic: "sensor/data".into(),
            diagnostic_topic: "sensor".into(),
            qos: 0,
        }
    }
}
