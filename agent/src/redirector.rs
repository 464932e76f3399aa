//! Agent-side half of the redirector subsystem (§4.8, §11): bind `from` on
//! this host, and for every accepted connection open a fresh stream back to
//! the server carrying a `RedirectorBindRequest` marker, then splice the
//! accepted socket against that stream. The server's own dispatcher is the
//! one that dials `to` and answers with `RedirectorBindResponse`; the agent
//! never sees `to` used directly — it only relays the tuple in the initial
//! `RedirectorRequest` for bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use codec::io::{read_envelope, write_envelope};
use codec::{Envelope, Payload, Transport};
use service::mux::Opener;
use service::splice::splice;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Bound {
    listener: JoinHandle<()>,
}

/// Live redirectors on this agent, keyed by id, so `RedirectorCloseRequest`
/// can find and tear one down without disturbing the others.
#[derive(Clone, Default)]
pub struct Redirectors {
    bound: Arc<Mutex<HashMap<String, Bound>>>,
}

impl Redirectors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `from` and start accepting. Idempotent: re-requesting an id
    /// already bound is a no-op, matching the idempotence the operator RPC
    /// surface expects of every add-redirector call.
    pub async fn start(&self, id: String, proto: Transport, from: String, to: String, opener: Opener) -> anyhow::Result<()> {
        if self.bound.lock().await.contains_key(&id) {
            return Ok(());
        }

        if !matches!(proto, Transport::Tcp) {
            anyhow::bail!("unsupported transport {proto:?}");
        }

        let listener = TcpListener::bind(&from)
            .await
            .map_err(|err| anyhow::anyhow!("failed to bind {from}: {err}"))?;

        log::info!("agent: redirector {id} listening on {from}, forwarding to {to}");

        let task_id = id.clone();
        let mut opener = opener;
        let handle = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("agent: redirector {task_id} accept failed: {err}");
                        break;
                    }
                };

                let mut stream = match opener.open().await {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::warn!("agent: redirector {task_id} failed to open callback stream: {err}");
                        continue;
                    }
                };

                log::debug!("agent: redirector {task_id} accepted {peer}");

                tokio::spawn(async move {
                    if write_envelope(&mut stream, &Envelope::new(Payload::RedirectorBindRequest)).await.is_err() {
                        return;
                    }
                    if read_envelope(&mut stream).await.is_err() {
                        return;
                    }
                    splice(socket, stream).await;
                });
            }
        });

        self.bound.lock().await.insert(id, Bound { listener: handle });
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> anyhow::Result<()> {
        match self.bound.lock().await.remove(id) {
            Some(bound) => {
                bound.listener.abort();
                Ok(())
            }
            None => anyhow::bail!("no redirector bound for id {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::mux::{Multiplex, Role};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn connected_pair() -> (Multiplex, Multiplex) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        (Multiplex::new(client_io, Role::Opener), Multiplex::new(server_io, Role::Acceptor))
    }

    #[tokio::test]
    async fn stop_unknown_id_errors() {
        let redirectors = Redirectors::new();
        assert!(redirectors.stop("missing").await.is_err());
    }

    #[tokio::test]
    async fn start_rejects_unsupported_transport() {
        let redirectors = Redirectors::new();
        let (opener_mux, _acceptor) = connected_pair();
        let result = redirectors
            .start("r1".into(), Transport::Udp, "127.0.0.1:0".into(), "127.0.0.1:1".into(), opener_mux.opener())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let redirectors = Redirectors::new();
        let (opener_mux, _acceptor) = connected_pair();

        redirectors
            .start("r1".into(), Transport::Tcp, "127.0.0.1:0".into(), "127.0.0.1:1".into(), opener_mux.opener())
            .await
            .unwrap();

        // Re-requesting the same id is a no-op, not a rebind error.
        redirectors
            .start("r1".into(), Transport::Tcp, "127.0.0.1:0".into(), "127.0.0.1:1".into(), opener_mux.opener())
            .await
            .unwrap();

        redirectors.stop("r1").await.unwrap();
        assert!(redirectors.stop("r1").await.is_err());
    }

    /// End-to-end: a client connecting to the bound address causes the agent
    /// to open a callback stream carrying `RedirectorBindRequest`, wait for
    /// `RedirectorBindResponse`, then splice bytes between the accepted
    /// socket and that stream.
    #[tokio::test]
    async fn accepted_connection_opens_a_callback_stream_and_splices_bytes() {
        let redirectors = Redirectors::new();
        let (opener_mux, mut acceptor_mux) = connected_pair();

        // Probe an address first so the redirector can bind the same port;
        // `TcpListener::bind("127.0.0.1:0")` inside `start` picks its own
        // ephemeral port, so this test claims one up front instead.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        redirectors
            .start("r1".into(), Transport::Tcp, addr.to_string(), "127.0.0.1:9".into(), opener_mux.opener())
            .await
            .unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut callback = acceptor_mux.accept().await.expect("redirector opens a callback stream");
        let request = {
            let mut header = [0u8; 5];
            callback.read_exact(&mut header).await.unwrap();
            header
        };
        assert_eq!(request[0], Payload::RedirectorBindRequest.opcode() as u8);

        callback.write_all(&[Payload::RedirectorBindResponse.opcode() as u8, 0, 0, 0, 0]).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        callback.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        callback.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
