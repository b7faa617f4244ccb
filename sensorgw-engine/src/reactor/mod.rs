//! ## sensorgw-engine::reactor
//! **Single-threaded readiness loop**
//!
//! One `mio::Poll`, a table of handlers keyed by descriptor token, and a
//! timing wheel ticked after every batch of readiness events.
//!
//! ### Dispatch rules
//! - A handler is taken out of the table while it runs and receives a
//!   [`Context`] instead of a pointer back to the reactor.
//! - The handler's [`Verdict`] decides whether it goes back under the same
//!   token, is torn down, or moves to a new token (broker reconnect).
//! - Within one event, read runs before write and write before hangup; each
//!   later step is skipped once the handler has left the table.

mod accept;
mod broker_link;
mod connection;

pub use accept::Acceptor;
pub use broker_link::BrokerLink;
pub use connection::Connection;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, instrument, trace, warn};

use sensorgw_config::{GatewayConfig, ProtocolMode};
use sensorgw_core::alloc::BlockPool;
use sensorgw_core::time::{Clock, Scheduled, TimerId, Wheel};
use sensorgw_telemetry::metrics::GatewayMetrics;

use crate::broker::BrokerClient;

/// Holds the broker link while it has no socket to poll.
pub const DETACHED_BROKER: Token = Token(usize::MAX);

pub(crate) type TimerWheel = Wheel<TimerEvent, Box<dyn Clock>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    BrokerHeartbeat(Token),
    StatsReport,
}

/// What the reactor does with a handler after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Close,
    /// Re-insert under another token. The handler has already moved its
    /// registration.
    Rebind(Token),
}

/// Runtime knobs resolved once from [`GatewayConfig`].
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    pub max_events: usize,
    pub tick_ms: u64,
    pub heartbeat_ms: u64,
    pub report_interval_ms: u64,
    pub read_chunk: usize,
    pub flood_limit: usize,
    pub max_echo_frame: usize,
    pub mode: ProtocolMode,
    pub gateway_id: u32,
    pub data_topic: String,
    pub diagnostic_topic: String,
    pub qos: u8,
}

impl ReactorSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_events: config.reactor.max_events,
            tick_ms: config.reactor.tick_ms,
            heartbeat_ms: config.reactor.heartbeat_ms,
            report_interval_ms: config.telemetry.report_interval_ms,
            read_chunk: config.connection.read_chunk,
            flood_limit: config.connection.flood_limit,
            max_echo_frame: config.connection.max_echo_frame,
            mode: config.connection.mode,
            gateway_id: config.gateway.id,
            data_topic: config.broker.data_topic.clone(),
            diagnostic_topic: config.broker.diagnostic_topic.clone(),
            qos: config.broker.qos,
        }
    }
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

pub enum Handler {
    Accept(Acceptor),
    Connection(Connection),
    BrokerLink(BrokerLink),
}

impl Handler {
    fn source(&mut self) -> Option<&mut dyn Source> {
        match self {
            Handler::Accept(acceptor) => Some(acceptor.source()),
            Handler::Connection(connection) => Some(connection.source()),
            Handler::BrokerLink(link) => link.source(),
        }
    }

    /// Moves the registration to `interest`, keeping the handler's own
    /// record of it current.
    fn reregister(
        &mut self,
        token: Token,
        interest: Interest,
        registry: &Registry,
    ) -> io::Result<()> {
        match self {
            Handler::Accept(acceptor) => acceptor.reregister(token, interest, registry),
            Handler::Connection(connection) => connection.reregister(token, interest, registry),
            Handler::BrokerLink(link) => link.reregister(token, interest, registry),
        }
    }

    fn on_read(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        match self {
            Handler::Accept(acceptor) => acceptor.on_read(ctx),
            Handler::Connection(connection) => connection.on_read(token, ctx),
            Handler::BrokerLink(link) => link.on_read(token, ctx),
        }
    }

    fn on_write(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        match self {
            Handler::Accept(_) => Verdict::Keep,
            Handler::Connection(connection) => connection.on_write(token, ctx),
            Handler::BrokerLink(link) => link.on_write(token, ctx),
        }
    }

    fn on_hangup(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        match self {
            Handler::BrokerLink(link) => link.reconnect(token, ctx),
            _ => Verdict::Close,
        }
    }

    fn on_heartbeat(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        match self {
            Handler::BrokerLink(link) => link.on_heartbeat(token, ctx),
            _ => Verdict::Keep,
        }
    }

    /// Releases the registration and any timer the handler owns.
    fn teardown(&mut self, registry: &Registry, timers: &mut TimerWheel) {
        if let Handler::BrokerLink(link) = self {
            link.cancel_heartbeat(timers);
        }
        if let Some(source) = self.source() {
            if let Err(e) = registry.deregister(source) {
                trace!(error = %e, "Deregister failed");
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Handler::Accept(_) => "accept",
            Handler::Connection(_) => "connection",
            Handler::BrokerLink(_) => "broker",
        }
    }
}

/// Everything a handler may touch while it runs.
pub struct Context<'r> {
    pub(crate) registry: &'r Registry,
    handlers: &'r mut HashMap<Token, Handler>,
    timers: &'r mut TimerWheel,
    immediate: &'r mut Vec<TimerEvent>,
    pub(crate) pool: &'r BlockPool,
    pub(crate) metrics: &'r GatewayMetrics,
    pub(crate) settings: &'r ReactorSettings,
    broker: Option<Token>,
}

impl Context<'_> {
    /// Registers `handler`'s source under `token` and adds it to the table.
    pub(crate) fn register(
        &mut self,
        token: Token,
        interest: Interest,
        mut handler: Handler,
    ) -> io::Result<()> {
        if let Some(source) = handler.source() {
            self.registry.register(source, token, interest)?;
        }
        self.handlers.insert(token, handler);
        Ok(())
    }

    /// Arms a timer. A zero delay queues the event for this turn.
    pub(crate) fn schedule(&mut self, delay_ms: u64, event: TimerEvent) -> Option<TimerId> {
        match self.timers.add_timer(delay_ms, event) {
            Ok(Scheduled::Pending(id)) => Some(id),
            Ok(Scheduled::Now(event)) => {
                self.immediate.push(event);
                None
            }
            Err(e) => {
                warn!(error = %e, ?event, "Timer rejected");
                None
            }
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Hands a message to the broker client. Queued bytes arm write
    /// interest on the broker link.
    pub(crate) fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let qos = self.settings.qos;
        let link = match self.broker {
            Some(token) => match self.handlers.get_mut(&token) {
                Some(Handler::BrokerLink(link)) => Some((token, link)),
                _ => None,
            },
            None => None,
        };

        let Some((token, link)) = link else {
            warn!(topic, "No broker link; message dropped");
            self.metrics.publish_failures.inc();
            return false;
        };

        let accepted = match link.client_mut().publish(topic, payload, qos, false) {
            Ok(()) => {
                self.metrics.publishes.inc();
                true
            }
            Err(e) => {
                warn!(topic, error = %e, "Publish failed");
                self.metrics.publish_failures.inc();
                false
            }
        };
        link.sync_interest(token, self.registry);
        accepted
    }
}

/// Readiness summary of one event.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    read: bool,
    write: bool,
    hangup: bool,
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            read: event.is_readable() || event.is_read_closed() || event.is_priority(),
            write: event.is_writable(),
            hangup: event.is_error() || (event.is_read_closed() && event.is_write_closed()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
    Hangup,
    Heartbeat,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    handlers: HashMap<Token, Handler>,
    timers: TimerWheel,
    pool: Arc<BlockPool>,
    metrics: GatewayMetrics,
    settings: ReactorSettings,
    broker: Option<Token>,
    immediate: Vec<TimerEvent>,
    due: Vec<TimerEvent>,
    ready: Vec<Ready>,
}

impl Reactor {
    pub fn new(
        settings: ReactorSettings,
        pool: Arc<BlockPool>,
        metrics: GatewayMetrics,
        clock: Box<dyn Clock>,
    ) -> io::Result<Self> {
        let mut reactor = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(settings.max_events),
            handlers: HashMap::new(),
            timers: Wheel::new(clock),
            pool,
            metrics,
            settings,
            broker: None,
            immediate: Vec::new(),
            due: Vec::new(),
            ready: Vec::new(),
        };

        let interval = reactor.settings.report_interval_ms;
        if interval > 0 {
            reactor.context().schedule(interval, TimerEvent::StatsReport);
        }
        Ok(reactor)
    }

    fn context(&mut self) -> Context<'_> {
        Context {
            registry: self.poll.registry(),
            handlers: &mut self.handlers,
            timers: &mut self.timers,
            immediate: &mut self.immediate,
            pool: &self.pool,
            metrics: &self.metrics,
            settings: &self.settings,
            broker: self.broker,
        }
    }

    pub fn register(&mut self, token: Token, interest: Interest, handler: Handler) -> io::Result<()> {
        self.context().register(token, interest, handler)
    }

    /// Replaces the interest set of a registered handler.
    pub fn update(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        match self.handlers.get_mut(&token) {
            Some(handler) => handler.reregister(token, interest, registry),
            None => Ok(()),
        }
    }

    /// Tears down and drops the handler under `token`, if any.
    pub fn remove(&mut self, token: Token) {
        if let Some(handler) = self.handlers.remove(&token) {
            self.close(token, handler);
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.handlers.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn broker_token(&self) -> Option<Token> {
        self.broker
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn add_listener(&mut self, listener: TcpListener) -> io::Result<Token> {
        let acceptor = Acceptor::new(listener);
        let token = acceptor.token();
        self.register(token, Interest::READABLE, Handler::Accept(acceptor))?;
        Ok(token)
    }

    /// Installs the broker link and arms its heartbeat.
    pub fn add_broker(&mut self, client: Box<dyn BrokerClient>) -> io::Result<Token> {
        let mut link = BrokerLink::new(client);
        let token = link.token();
        let interest = link.interest();

        let mut ctx = self.context();
        link.arm_heartbeat(token, &mut ctx);
        ctx.register(token, interest, Handler::BrokerLink(link))?;
        self.broker = Some(token);
        Ok(token)
    }

    #[instrument(skip(self), name = "reactor")]
    pub fn run(&mut self) -> io::Result<()> {
        debug!(handlers = self.handlers.len(), "Reactor running");
        loop {
            self.turn()?;
        }
    }

    /// Waits for readiness once, dispatches it, then ticks the wheel.
    pub fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.timers.is_empty() && self.immediate.is_empty() {
            None
        } else {
            Some(Duration::from_millis(self.settings.tick_ms))
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.extend(self.events.iter().map(Ready::from));
        for event in ready.drain(..) {
            self.handle(event);
        }
        self.ready = ready;

        self.fire_timers();
        Ok(())
    }

    fn handle(&mut self, event: Ready) {
        let token = event.token;
        if event.read && self.contains(token) && self.dispatch(token, Op::Read) != Verdict::Keep {
            return;
        }
        if event.write && self.contains(token) && self.dispatch(token, Op::Write) != Verdict::Keep
        {
            return;
        }
        if event.hangup && self.contains(token) {
            self.dispatch(token, Op::Hangup);
        }
    }

    fn dispatch(&mut self, token: Token, op: Op) -> Verdict {
        let Some(mut handler) = self.handlers.remove(&token) else {
            return Verdict::Close;
        };

        let verdict = {
            let mut ctx = self.context();
            match op {
                Op::Read => handler.on_read(token, &mut ctx),
                Op::Write => handler.on_write(token, &mut ctx),
                Op::Hangup => handler.on_hangup(token, &mut ctx),
                Op::Heartbeat => handler.on_heartbeat(token, &mut ctx),
            }
        };

        match verdict {
            Verdict::Keep => {
                self.handlers.insert(token, handler);
            }
            Verdict::Close => self.close(token, handler),
            Verdict::Rebind(to) => {
                trace!(from = token.0, to = to.0, kind = handler.kind(), "Handler rebound");
                if self.broker == Some(token) {
                    self.broker = Some(to);
                }
                self.handlers.insert(to, handler);
            }
        }
        verdict
    }

    fn close(&mut self, token: Token, mut handler: Handler) {
        handler.teardown(self.poll.registry(), &mut self.timers);
        match handler {
            Handler::Connection(_) => self.metrics.connections_closed.inc(),
            Handler::BrokerLink(_) => {
                warn!(token = token.0, "Broker link closed");
                if self.broker == Some(token) {
                    self.broker = None;
                }
            }
            Handler::Accept(_) => warn!(token = token.0, "Listener closed"),
        }
        debug!(token = token.0, kind = handler.kind(), "Handler removed");
    }

    fn fire_timers(&mut self) {
        let mut due = std::mem::take(&mut self.due);
        self.timers.tick(|event| due.push(event));
        due.append(&mut self.immediate);

        while !due.is_empty() {
            for event in due.drain(..) {
                self.on_timer(event);
            }
            std::mem::swap(&mut due, &mut self.immediate);
        }
        self.due = due;
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::BrokerHeartbeat(token) => {
                if matches!(self.handlers.get(&token), Some(Handler::BrokerLink(_))) {
                    self.dispatch(token, Op::Heartbeat);
                }
            }
            TimerEvent::StatsReport => {
                let stats = self.pool.stats();
                match self.metrics.gather() {
                    Ok(exposition) => debug!(pool = %stats, metrics = %exposition, "Stats report"),
                    Err(e) => debug!(pool = %stats, error = %e, "Stats report"),
                }
                let interval = self.settings.report_interval_ms;
                self.context().schedule(interval, TimerEvent::StatsReport);
            }
        }
    }
}
