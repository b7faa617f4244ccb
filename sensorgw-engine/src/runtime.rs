// sensorgw-engine/src/runtime.rs

/*!
# Gateway bootstrap

Builds everything the reactor needs from a validated [`GatewayConfig`]: the
shared block pool, metrics, the listening socket and the broker link. Any
failure here is fatal; once the reactor runs, errors are handled per
connection.
*/

use std::sync::Arc;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, instrument};

use sensorgw_config::{GatewayConfig, ListenerConfig};
use sensorgw_core::alloc::BlockPool;
use sensorgw_core::time::MonotonicClock;
use sensorgw_telemetry::{logging::GatewayLogger, metrics::GatewayMetrics};

use crate::broker::{BrokerClient, MqttClient, MqttOptions};
use crate::error::GatewayError;
use crate::reactor::{Reactor, ReactorSettings};

/// Non-blocking listener with `SO_REUSEADDR` and the configured backlog.
pub fn bind_listener(config: &ListenerConfig) -> Result<TcpListener, GatewayError> {
    let addr = config.socket_addr();
    let bind = |source| GatewayError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind)?;
    socket.set_reuse_address(true).map_err(bind)?;
    socket.bind(&addr.into()).map_err(bind)?;
    socket.listen(config.backlog).map_err(bind)?;
    socket.set_nonblocking(true).map_err(bind)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Connects the broker client and subscribes to the command topic.
pub fn connect_broker(config: &GatewayConfig) -> Result<MqttClient, GatewayError> {
    let mut client = MqttClient::new(MqttOptions::from(&config.broker));
    client.connect()?;
    client.subscribe(&config.broker.subscribe_topic, config.broker.qos)?;
    Ok(client)
}

/// Builds the reactor and runs it until a fatal poll error.
#[instrument(level = "info", name = "gateway", skip_all, fields(gateway_id = config.gateway.id))]
pub fn run_gateway(config: GatewayConfig) -> Result<(), GatewayError> {
    let pool = Arc::new(BlockPool::new(
        config.pool.page_size,
        config.pool.block_size,
        config.pool.alignment,
    )?);
    let metrics = GatewayMetrics::new()?;
    info!(
        block_size = pool.block_size(),
        blocks_per_page = pool.blocks_per_page(),
        "Block pool ready"
    );

    let listener = bind_listener(&config.listener)?;
    GatewayLogger::lifecycle("listening", &config.listener.socket_addr().to_string());

    let client = connect_broker(&config)?;
    GatewayLogger::lifecycle("broker connected", &config.broker.address());

    let settings = ReactorSettings::from_config(&config);
    let mut reactor = Reactor::new(settings, pool, metrics, Box::new(MonotonicClock::new()))?;
    reactor.add_listener(listener)?;
    reactor.add_broker(Box::new(client) as Box<dyn BrokerClient>)?;

    GatewayLogger::lifecycle("started", &config.connection.mode.to_string());
    reactor.run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    fn loopback(port: u16) -> ListenerConfig {
        ListenerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            ..ListenerConfig::default()
        }
    }

    #[test]
    fn test_bind_listener_accepts_connections() {
        let listener = bind_listener(&loopback(0)).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
        TcpStream::connect(addr).unwrap();
    }

    #[test]
    fn test_bind_conflict_is_reported_with_address() {
        let first = bind_listener(&loopback(0)).unwrap();
        let port = first.local_addr().unwrap().port();

        match bind_listener(&loopback(port)) {
            Err(GatewayError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second bind on a listening port succeeded"),
        }
    }

    #[test]
    fn test_unreachable_broker_fails_startup() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let mut config = GatewayConfig::default();
        config.broker.port = port;
        config.broker.connect_timeout_ms = 500;
        assert!(matches!(connect_broker(&config), Err(GatewayError::Broker(_))));
    }
}
