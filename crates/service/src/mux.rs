//! Multiplex transport: a yamux-compatible multiplexer over one mTLS
//! connection. Roles are inverted from the usual client/server convention —
//! the agent runs the multiplex *server* role (it accepts streams), the
//! central server runs the *client* role (it opens streams into the agent).
//! Each new stream is a fresh request/response conversation; envelope
//! framing (`ligolo_codec`) restarts on every stream. Closing the multiplex
//! signals "session lost" to upper layers.

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yamux::{Config, Connection, ConnectionError, Control, Mode};

pub use yamux::Stream;

/// Which multiplex role this peer plays on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens streams into the peer. Played by the central server.
    Opener,
    /// Accepts streams from the peer. Played by the agent.
    Acceptor,
}

/// A live multiplex session. Cheap to clone the outbound half (`Control` is
/// internally reference-counted); inbound streams are drained by a single
/// background task and handed out one at a time through `accept`.
pub struct Multiplex {
    control: Control,
    driver: JoinHandle<()>,
    inbound: mpsc::Receiver<Stream>,
}

impl Multiplex {
    pub fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mode = match role {
            Role::Opener => Mode::Client,
            Role::Acceptor => Mode::Server,
        };

        let mut connection = Connection::new(io, Config::default(), mode);
        let control = connection.control();
        let (tx, rx) = mpsc::channel(32);

        let driver = tokio::spawn(async move {
            while let Some(result) = connection.next().await {
                match result {
                    Ok(stream) => {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::debug!("multiplex driver stopped: {err}");
                        break;
                    }
                }
            }
        });

        Self { control, driver, inbound: rx }
    }

    /// Open a new outbound stream.
    pub async fn open(&mut self) -> Result<Stream, ConnectionError> {
        self.control.open_stream().await
    }

    /// Accept the next inbound stream the peer opened. `None` once the
    /// multiplex is closed.
    pub async fn accept(&mut self) -> Option<Stream> {
        self.inbound.recv().await
    }

    /// True while the background driver task is still running.
    pub fn is_alive(&self) -> bool {
        !self.driver.is_finished()
    }

    pub async fn close(mut self) {
        let _ = self.control.close().await;
        self.driver.abort();
    }

    /// A cheap-to-clone handle that can open outbound streams independently
    /// of the `Multiplex` itself, for tasks (e.g. a redirector's accept
    /// loop) that need to open streams concurrently with the main dispatch
    /// loop still draining `accept()`.
    pub fn opener(&self) -> Opener {
        Opener(self.control.clone())
    }
}

/// A cloneable handle for opening outbound multiplex streams, independent
/// of whichever task owns the `Multiplex` itself and its inbound queue.
#[derive(Clone)]
pub struct Opener(Control);

impl Opener {
    pub async fn open(&mut self) -> Result<Stream, ConnectionError> {
        self.0.open_stream().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A connected opener/acceptor pair sharing one in-memory duplex pipe,
    /// for tests that need a real yamux stream without a TLS connection.
    pub(crate) fn connected_pair() -> (Multiplex, Multiplex) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        (Multiplex::new(client_io, Role::Opener), Multiplex::new(server_io, Role::Acceptor))
    }

    #[tokio::test]
    async fn opened_stream_is_observed_by_the_acceptor() {
        let (mut opener, mut acceptor) = connected_pair();

        let mut opened = opener.open().await.unwrap();
        let mut accepted = acceptor.accept().await.unwrap();

        opened.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn closing_the_multiplex_ends_the_accept_loop() {
        let (opener, mut acceptor) = connected_pair();
        opener.close().await;
        assert!(acceptor.accept().await.is_none());
    }
}
