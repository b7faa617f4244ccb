//! TCP listening endpoint for sensor connections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,

    #[validate(range(min = 1))]
    pub port: u16,

    /// Pending-connection queue length handed to `listen(2)`.
    #[validate(range(min = 1, max = 65535))]
    pub backlog: i32,
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 2048,
            backlog: 128,
        }
    }
}
