//! Minimal non-blocking MQTT 3.1.1 client.
//!
//! Clean sessions only, QoS 0 and 1, no will and no credentials. Outbound
//! packets are queued in a byte buffer and flushed by the reactor through
//! `pump_write`; inbound bytes are decoded in `pump_read`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use sensorgw_config::BrokerConfig;
use sensorgw_protocols::mqtt::{self, MqttPacket};

use super::{BrokerClient, BrokerError, Pump};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct MqttOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

impl From<&BrokerConfig> for MqttOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            keepalive: Duration::from_secs(u64::from(config.keepalive_secs)),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    /// CONNECT queued or sent, CONNACK not yet received.
    Connecting,
    Connected,
    /// Socket failed; waiting for `reconnect_async`.
    Lost,
}

pub struct MqttClient {
    options: MqttOptions,
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    state: LinkState,
    inbound: BytesMut,
    outbound: BytesMut,
    next_packet_id: u16,
    subscriptions: Vec<(String, u8)>,
    last_outbound: Instant,
    ping_sent: Option<Instant>,
}

impl MqttClient {
    pub fn new(options: MqttOptions) -> Self {
        Self {
            options,
            addr: None,
            stream: None,
            state: LinkState::Disconnected,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::with_capacity(READ_CHUNK),
            next_packet_id: 1,
            subscriptions: Vec::new(),
            last_outbound: Instant::now(),
            ping_sent: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    fn resolve(&mut self) -> Result<SocketAddr, BrokerError> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let addr = (self.options.host.as_str(), self.options.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                BrokerError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.options.host),
                ))
            })?;
        self.addr = Some(addr);
        Ok(addr)
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Resets buffers and queues CONNECT followed by every known subscription.
    fn start_session(&mut self, stream: TcpStream) -> Result<(), BrokerError> {
        self.stream = Some(stream);
        self.state = LinkState::Connecting;
        self.inbound.clear();
        self.outbound.clear();
        self.ping_sent = None;
        self.last_outbound = Instant::now();

        let keepalive = u16::try_from(self.options.keepalive.as_secs()).unwrap_or(u16::MAX);
        mqtt::encode_connect(&self.options.client_id, keepalive, &mut self.outbound);

        let subscriptions = std::mem::take(&mut self.subscriptions);
        for (topic, qos) in &subscriptions {
            let id = self.packet_id();
            mqtt::encode_subscribe(id, topic, *qos, &mut self.outbound).map_err(protocol)?;
        }
        self.subscriptions = subscriptions;
        Ok(())
    }

    fn process_inbound(&mut self) -> Result<(), BrokerError> {
        loop {
            let Some((packet, used)) = mqtt::decode(&self.inbound).map_err(protocol)? else {
                return Ok(());
            };

            let mut ack = None;
            match packet {
                MqttPacket::ConnAck { return_code: 0, .. } => {
                    info!(client_id = %self.options.client_id, "Broker session established");
                    self.state = LinkState::Connected;
                }
                MqttPacket::ConnAck { return_code, .. } => {
                    self.state = LinkState::Lost;
                    return Err(BrokerError::Refused(return_code));
                }
                MqttPacket::Publish {
                    topic,
                    payload,
                    packet_id,
                    ..
                } => {
                    info!(
                        topic = topic,
                        payload = %String::from_utf8_lossy(payload),
                        "Broker message received"
                    );
                    ack = packet_id;
                }
                MqttPacket::PubAck { packet_id } => trace!(packet_id, "PUBACK"),
                MqttPacket::SubAck { packet_id, granted } => {
                    if granted.contains(&0x80) {
                        warn!(packet_id, "Broker rejected subscription");
                    } else {
                        debug!(packet_id, "Subscription acknowledged");
                    }
                }
                MqttPacket::PingResp => {
                    trace!("PINGRESP");
                    self.ping_sent = None;
                }
                MqttPacket::Other { header, .. } => {
                    return Err(BrokerError::Protocol(format!(
                        "unexpected packet type 0x{:02x}",
                        header
                    )));
                }
            }

            self.inbound.advance(used);
            if let Some(id) = ack {
                mqtt::encode_puback(id, &mut self.outbound);
            }
        }
    }

    fn mark_lost(&mut self) -> BrokerError {
        self.state = LinkState::Lost;
        BrokerError::ConnectionLost
    }
}

fn protocol(error: mqtt::MqttParseError) -> BrokerError {
    BrokerError::Protocol(error.to_string())
}

impl BrokerClient for MqttClient {
    fn source(&mut self) -> Option<&mut dyn Source> {
        self.stream.as_mut().map(|stream| stream as &mut dyn Source)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|stream| stream.as_raw_fd())
    }

    /// Blocking connect bounded by the configured timeout. CONNECT itself
    /// is queued and goes out through `pump_write`.
    fn connect(&mut self) -> Result<(), BrokerError> {
        let addr = self.resolve()?;
        let stream = std::net::TcpStream::connect_timeout(&addr, self.options.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        info!(%addr, "Connected to broker");
        self.start_session(TcpStream::from_std(stream))
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), BrokerError> {
        if self.stream.is_none() {
            return Err(BrokerError::NoConnection);
        }
        let id = self.packet_id();
        mqtt::encode_subscribe(id, topic, qos, &mut self.outbound).map_err(protocol)?;
        self.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if self.stream.is_none() || self.state == LinkState::Lost {
            return Err(BrokerError::NoConnection);
        }
        let id = if qos > 0 { self.packet_id() } else { 0 };
        mqtt::encode_publish(topic, payload, qos, retain, id, &mut self.outbound)
            .map_err(protocol)
    }

    fn pump_read(&mut self) -> Result<Pump, BrokerError> {
        let stream = self.stream.as_mut().ok_or(BrokerError::NoConnection)?;
        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => Err(self.mark_lost()),
            Ok(n) => {
                self.inbound.extend_from_slice(&chunk[..n]);
                self.process_inbound()?;
                Ok(Pump::Again)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Pump::Idle),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Pump::Again),
            Err(e) => {
                debug!(error = %e, "Broker read failed");
                Err(self.mark_lost())
            }
        }
    }

    fn pump_write(&mut self) -> Result<(), BrokerError> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let stream = self.stream.as_mut().ok_or(BrokerError::NoConnection)?;
        match stream.write(&self.outbound) {
            Ok(0) => Err(self.mark_lost()),
            Ok(n) => {
                self.outbound.advance(n);
                self.last_outbound = Instant::now();
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected
                ) =>
            {
                Err(BrokerError::WouldBlock)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => {
                debug!(error = %e, "Broker write failed");
                Err(self.mark_lost())
            }
        }
    }

    fn housekeeping(&mut self) -> Result<(), BrokerError> {
        if self.stream.is_none() || self.state == LinkState::Lost {
            return Err(BrokerError::NoConnection);
        }

        let keepalive = self.options.keepalive;
        if let Some(sent) = self.ping_sent {
            if sent.elapsed() >= keepalive {
                warn!("Broker did not answer keep-alive ping");
                self.state = LinkState::Lost;
                return Err(BrokerError::NoConnection);
            }
            return Ok(());
        }

        if !keepalive.is_zero() && self.last_outbound.elapsed() >= keepalive / 2 {
            mqtt::encode_pingreq(&mut self.outbound);
            self.ping_sent = Some(Instant::now());
            trace!("PINGREQ queued");
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        self.stream.is_some() && !self.outbound.is_empty()
    }

    fn reconnect_async(&mut self) -> Result<(), BrokerError> {
        self.stream = None;
        self.state = LinkState::Disconnected;

        let addr = self.resolve()?;
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed on reconnect");
        }
        info!(%addr, "Reconnecting to broker");
        self.start_session(stream)
    }
}

/// Best-effort DISCONNECT; the socket is non-blocking so this never stalls.
impl Drop for MqttClient {
    fn drop(&mut self) {
        if self.state != LinkState::Connected {
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            let mut packet = BytesMut::with_capacity(2);
            mqtt::encode_disconnect(&mut packet);
            if let Err(e) = stream.write_all(&packet) {
                trace!(error = %e, "DISCONNECT not sent");
            }
        }
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.options.client_id)
            .field("state", &self.state)
            .field("queued", &self.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn options(port: u16) -> MqttOptions {
        MqttOptions {
            host: "127.0.0.1".into(),
            port,
            client_id: "gateway_client".into(),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Flushes the client completely; loopback buffers are large enough.
    fn flush(client: &mut MqttClient) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while client.wants_write() && Instant::now() < deadline {
            match client.pump_write() {
                Ok(()) | Err(BrokerError::WouldBlock) => {}
                Err(e) => panic!("write failed: {}", e),
            }
        }
    }

    fn read_exact(peer: &mut std::net::TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).unwrap();
        buf
    }

    fn pump_until_idle(client: &mut MqttClient) -> Result<(), BrokerError> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if client.pump_read()? == Pump::Idle && client.is_connected() {
                return Ok(());
            }
        }
        Ok(())
    }

    #[test]
    fn test_operations_require_a_socket() {
        let mut client = MqttClient::new(options(1));
        assert!(matches!(
            client.publish("t", b"x", 0, false),
            Err(BrokerError::NoConnection)
        ));
        assert!(matches!(client.pump_read(), Err(BrokerError::NoConnection)));
        assert!(matches!(client.housekeeping(), Err(BrokerError::NoConnection)));
        assert!(!client.wants_write());
        assert!(client.source().is_none());
    }

    #[test]
    fn test_session_against_loopback_broker() {
        let broker = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = broker.local_addr().unwrap().port();

        let mut client = MqttClient::new(options(port));
        client.connect().unwrap();
        let (mut peer, _) = broker.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        client.subscribe("opi/sensor", 0).unwrap();
        client.publish("sensor/data", b"{}", 0, false).unwrap();
        assert!(client.wants_write());
        flush(&mut client);

        let mut expected = BytesMut::new();
        mqtt::encode_connect("gateway_client", 60, &mut expected);
        mqtt::encode_subscribe(1, "opi/sensor", 0, &mut expected).unwrap();
        mqtt::encode_publish("sensor/data", b"{}", 0, false, 0, &mut expected).unwrap();
        assert_eq!(read_exact(&mut peer, expected.len()), &expected[..]);

        let mut reply = BytesMut::new();
        reply.extend_from_slice(&[0x20, 0x02, 0x00, 0x00]);
        mqtt::encode_publish("opi/sensor", b"on", 1, false, 5, &mut reply).unwrap();
        peer.write_all(&reply).unwrap();

        pump_until_idle(&mut client).unwrap();
        assert!(client.is_connected());

        // QoS 1 delivery is acknowledged.
        assert!(client.wants_write());
        flush(&mut client);
        assert_eq!(read_exact(&mut peer, 4), [0x40, 0x02, 0x00, 0x05]);

        drop(client);
        assert_eq!(read_exact(&mut peer, 2), [0xE0, 0x00]);
    }

    #[test]
    fn test_refused_connack() {
        let broker = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = broker.local_addr().unwrap().port();

        let mut client = MqttClient::new(options(port));
        client.connect().unwrap();
        let (mut peer, _) = broker.accept().unwrap();
        peer.write_all(&[0x20, 0x02, 0x00, 0x05]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let outcome = loop {
            match client.pump_read() {
                Ok(_) if Instant::now() < deadline => continue,
                other => break other,
            }
        };
        assert!(matches!(outcome, Err(BrokerError::Refused(5))));
    }

    #[test]
    fn test_peer_close_is_link_loss_and_reconnect_resubscribes() {
        let broker = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = broker.local_addr().unwrap().port();

        let mut client = MqttClient::new(options(port));
        client.connect().unwrap();
        client.subscribe("opi/sensor", 1).unwrap();
        let (peer, _) = broker.accept().unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = loop {
            match client.pump_read() {
                Err(e) => break e,
                Ok(_) if Instant::now() < deadline => continue,
                Ok(_) => panic!("peer close not observed"),
            }
        };
        assert!(err.is_link_loss());
        assert!(matches!(client.housekeeping(), Err(BrokerError::NoConnection)));

        client.reconnect_async().unwrap();
        let (mut peer, _) = broker.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        flush(&mut client);

        let mut expected = BytesMut::new();
        mqtt::encode_connect("gateway_client", 60, &mut expected);
        mqtt::encode_subscribe(2, "opi/sensor", 1, &mut expected).unwrap();
        assert_eq!(read_exact(&mut peer, expected.len()), &expected[..]);
    }
}
