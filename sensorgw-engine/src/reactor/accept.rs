use std::io;
use std::os::fd::AsRawFd;

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use super::{Connection, Context, Handler, Verdict};

/// Listening socket. Drains the accept queue on every readiness edge.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn token(&self) -> Token {
        Token(self.listener.as_raw_fd() as usize)
    }

    pub(super) fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    pub(super) fn reregister(
        &mut self,
        token: Token,
        interest: Interest,
        registry: &Registry,
    ) -> io::Result<()> {
        registry.reregister(&mut self.listener, token, interest)
    }

    pub(super) fn on_read(&mut self, ctx: &mut Context<'_>) -> Verdict {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let token = Token(stream.as_raw_fd() as usize);
                    let connection = Connection::new(stream, peer, ctx.settings);
                    if let Err(e) =
                        ctx.register(token, Interest::READABLE, Handler::Connection(connection))
                    {
                        warn!(%peer, error = %e, "Failed to register connection");
                        continue;
                    }
                    ctx.metrics.connections_accepted.inc();
                    debug!(%peer, fd = token.0, "Accepted connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return Verdict::Keep;
                }
            }
        }
    }
}
