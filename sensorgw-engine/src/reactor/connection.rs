//! Sensor-side TCP connection.
//!
//! Reads drain the socket into `inbound` before any frame is looked at, so
//! the flood guard sees everything a peer managed to send in one burst.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use sensorgw_config::ProtocolMode;
use sensorgw_protocols::{echo, sensor, SensorStep};

use super::{Context, ReactorSettings, Verdict};
use crate::document::Document;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    mode: ProtocolMode,
    inbound: BytesMut,
    outbound: BytesMut,
    interest: Interest,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, settings: &ReactorSettings) -> Self {
        Self {
            stream,
            peer,
            mode: settings.mode,
            inbound: BytesMut::with_capacity(settings.read_chunk),
            outbound: BytesMut::new(),
            interest: Interest::READABLE,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub(super) fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    pub(super) fn reregister(
        &mut self,
        token: Token,
        interest: Interest,
        registry: &Registry,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)?;
        self.interest = interest;
        Ok(())
    }

    pub(super) fn on_read(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        let chunk = ctx.settings.read_chunk;
        loop {
            let start = self.inbound.len();
            self.inbound.resize(start + chunk, 0);
            match self.stream.read(&mut self.inbound[start..]) {
                Ok(0) => {
                    self.inbound.truncate(start);
                    debug!(peer = %self.peer, "Peer closed connection");
                    return Verdict::Close;
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    if start > ctx.settings.flood_limit {
                        warn!(
                            peer = %self.peer,
                            buffered = start,
                            limit = ctx.settings.flood_limit,
                            "Flood protection: inbound limit exceeded, closing"
                        );
                        ctx.metrics.flood_closures.inc();
                        return Verdict::Close;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inbound.truncate(start);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.inbound.truncate(start);
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Read failed");
                    return Verdict::Close;
                }
            }
        }

        match self.mode {
            ProtocolMode::Sensor => {
                self.process_sensor(ctx);
                Verdict::Keep
            }
            ProtocolMode::Echo => self.process_echo(token, ctx),
            ProtocolMode::Discard => {
                self.process_discard(token, ctx);
                Verdict::Keep
            }
        }
    }

    pub(super) fn on_write(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        self.flush(token, ctx)
    }

    fn process_sensor(&mut self, ctx: &mut Context<'_>) {
        loop {
            match sensor::next_step(&mut self.inbound) {
                SensorStep::NeedMore => return,
                SensorStep::Resync { declared } => {
                    warn!(peer = %self.peer, declared, "Bad frame length, sliding one byte");
                    ctx.metrics.frame_resyncs.inc();
                }
                SensorStep::Corrupt { computed, received } => {
                    warn!(
                        peer = %self.peer,
                        computed,
                        received,
                        "Checksum mismatch, frame discarded"
                    );
                    ctx.metrics.checksum_failures.inc();
                }
                SensorStep::Frame(frame) => {
                    ctx.metrics.frames_decoded.inc();
                    let reading = frame.reading();
                    trace!(?reading, "Sensor frame");

                    let gateway_id = ctx.settings.gateway_id;
                    let document = match Document::reading(ctx.pool, &reading, gateway_id) {
                        Ok(document) => document,
                        Err(e) => {
                            warn!(error = %e, "Failed to build reading document");
                            continue;
                        }
                    };
                    ctx.metrics.document_bytes.observe(document.len() as f64);

                    let settings = ctx.settings;
                    ctx.publish(&settings.data_topic, &document);
                }
            }
        }
    }

    fn process_echo(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        loop {
            match echo::next_frame(&mut self.inbound, ctx.settings.max_echo_frame) {
                Ok(Some(payload)) => {
                    ctx.metrics.echo_frames.inc();
                    echo::encode_frame(&payload, &mut self.outbound);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Invalid echo frame, closing");
                    return Verdict::Close;
                }
            }
        }

        if self.outbound.is_empty() {
            Verdict::Keep
        } else {
            self.flush(token, ctx)
        }
    }

    fn process_discard(&mut self, token: Token, ctx: &mut Context<'_>) {
        while let Some(len) = echo::skip_frame(&mut self.inbound) {
            ctx.metrics.frames_discarded.inc();
            trace!(peer = %self.peer, len, "Frame discarded");

            let settings = ctx.settings;
            ctx.publish(&settings.diagnostic_topic, token.0.to_string().as_bytes());
        }
    }

    fn flush(&mut self, token: Token, ctx: &mut Context<'_>) -> Verdict {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Verdict::Close,
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.set_interest(token, Interest::READABLE | Interest::WRITABLE, ctx);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Write failed");
                    return Verdict::Close;
                }
            }
        }
        self.set_interest(token, Interest::READABLE, ctx)
    }

    fn set_interest(&mut self, token: Token, interest: Interest, ctx: &Context<'_>) -> Verdict {
        if self.interest == interest {
            return Verdict::Keep;
        }
        match self.reregister(token, interest, ctx.registry) {
            Ok(()) => Verdict::Keep,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Reregister failed");
                Verdict::Close
            }
        }
    }
}
