//! Reactor side of the upstream broker connection.
//!
//! Owns the [`BrokerClient`], keeps its poll interest in step with queued
//! output and drives keep-alive from a heartbeat timer. A link loss turns
//! into a non-blocking reconnect that moves the link to the new socket's
//! token, or to [`DETACHED_BROKER`] until the next heartbeat retries.

use std::io;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, info, trace, warn};

use sensorgw_core::time::TimerId;

use super::{Context, TimerEvent, TimerWheel, Verdict, DETACHED_BROKER};
use crate::broker::{BrokerClient, BrokerError, Pump};

pub struct BrokerLink {
    client: Box<dyn BrokerClient>,
    heartbeat: Option<TimerId>,
    interest: Interest,
    /// An immediate reconnect was already tried since the last heartbeat.
    retried: bool,
}

impl BrokerLink {
    pub fn new(client: Box<dyn BrokerClient>) -> Self {
        let interest = Self::wanted(client.as_ref());
        Self {
            client,
            heartbeat: None,
            interest,
            retried: false,
        }
    }

    fn wanted(client: &dyn BrokerClient) -> Interest {
        if client.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Token derived from the client's socket, or the detached slot.
    pub fn token(&self) -> Token {
        self.client
            .raw_fd()
            .map_or(DETACHED_BROKER, |fd| Token(fd as usize))
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn client_mut(&mut self) -> &mut dyn BrokerClient {
        self.client.as_mut()
    }

    pub(super) fn source(&mut self) -> Option<&mut dyn Source> {
        self.client.source()
    }

    pub(super) fn reregister(
        &mut self,
        token: Token,
        interest: Interest,
        registry: &Registry,
    ) -> io::Result<()> {
        if token == DETACHED_BROKER {
            return Ok(());
        }
        if let Some(source) = self.client.source() {
            registry.reregister(source, token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    /// Re-registers when queued output changes what the link waits for.
    pub(super) fn sync_interest(&mut self, token: Token, registry: &Registry) {
        let wanted = Self::wanted(self.client.as_ref());
        if wanted == self.interest || token == DETACHED_BROKER {
            return;
        }
        if let Err(e) = self.reregister(token, wanted, registry) {
            debug!(error = %e, "Broker reregister failed");
        }
    }

    pub(super) fn arm_heartbeat(&mut self, token: Token, ctx: &mut Context<'_>) {
        if let Some(id) = self.heartbeat.take() {
            ctx.cancel(id);
        }
        let delay = ctx.settings.heartbeat_ms;
        self.heartbeat = ctx.schedule(delay, TimerEvent::BrokerHeartbeat(token));
    }

    pub(super) fn cancel_heartbeat(&mut self, timers: &mut TimerWheel) {
        if let Some(id) = self.heartbeat.take() {
            timers.cancel(id);
        }
    }

    pub(super) fn on_read(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        loop {
            match self.client.pump_read() {
                Ok(Pump::Again) => {}
                Ok(Pump::Idle) | Err(BrokerError::WouldBlock) => break,
                Err(e) => return self.on_error(e, token, ctx),
            }
        }
        self.sync_interest(token, ctx.registry);
        Verdict::Keep
    }

    pub(super) fn on_write(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        while self.client.wants_write() {
            match self.client.pump_write() {
                Ok(()) => {}
                Err(BrokerError::WouldBlock) => break,
                Err(e) => return self.on_error(e, token, ctx),
            }
        }
        self.sync_interest(token, ctx.registry);
        Verdict::Keep
    }

    pub(super) fn on_heartbeat(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        self.heartbeat = None;
        self.retried = false;
        match self.client.housekeeping() {
            Ok(()) => {}
            Err(e) if e.is_link_loss() => {
                debug!(error = %e, "Heartbeat found broker link down");
                return self.reconnect(token, ctx);
            }
            Err(e) => warn!(error = %e, "Broker housekeeping failed"),
        }
        self.arm_heartbeat(token, ctx);
        self.sync_interest(token, ctx.registry);
        Verdict::Keep
    }

    fn on_error(&mut self, e: BrokerError, token: Token, ctx: &mut Context<'_>) -> Verdict {
        match e {
            BrokerError::Refused(code) => {
                error!(code, "Broker refused the session");
                Verdict::Close
            }
            e => {
                warn!(error = %e, "Broker link failed");
                self.reconnect(token, ctx)
            }
        }
    }

    /// Swaps in a fresh socket and moves the link to its token.
    /// At most one attempt runs per heartbeat interval; after that the link
    /// waits detached for the next heartbeat.
    pub(super) fn reconnect(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        if token != DETACHED_BROKER {
            if let Some(source) = self.client.source() {
                if let Err(e) = ctx.registry.deregister(source) {
                    trace!(error = %e, "Broker deregister failed");
                }
            }
        }

        if self.retried {
            warn!("Broker link down again; next attempt on heartbeat");
            self.arm_heartbeat(DETACHED_BROKER, ctx);
            return Verdict::Rebind(DETACHED_BROKER);
        }
        self.retried = true;
        ctx.metrics.broker_reconnects.inc();

        let target = match self.client.reconnect_async() {
            Ok(()) => self.attach(ctx.registry),
            Err(e) => {
                warn!(error = %e, "Broker reconnect failed; retrying on next heartbeat");
                DETACHED_BROKER
            }
        };
        if target != DETACHED_BROKER {
            info!(token = target.0, "Broker link re-established");
        }

        self.arm_heartbeat(target, ctx);
        Verdict::Rebind(target)
    }

    fn attach(&mut self, registry: &Registry) -> Token {
        let token = self.token();
        let interest = Interest::READABLE | Interest::WRITABLE;
        let Some(source) = self.client.source() else {
            return DETACHED_BROKER;
        };
        match registry.register(source, token, interest) {
            Ok(()) => {
                self.interest = interest;
                token
            }
            Err(e) => {
                warn!(error = %e, "Failed to register broker socket");
                DETACHED_BROKER
            }
        }
    }
}
