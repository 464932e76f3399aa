//! Agent-facing listener (§4.2, §4.3, §4.6): accepts an mTLS connection from
//! an agent, plays the multiplex *opener* role over it (role inversion, per
//! §4.2), exchanges `InfoRequest`/`InfoReply` to establish identity, and
//! then owns that agent's connection for its lifetime — dispatching every
//! inbound stream the agent opens (redirector accept-callbacks, §4.8) and
//! restoring a relay if the reconnecting session was relaying before.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use codec::io::{read_envelope, write_envelope};
use codec::{Envelope, Payload};
use service::mux::{Multiplex, Opener, Role, Stream};
use service::netstack::NetStack;
use service::redirector::Redirector as ServiceRedirector;
use service::session::registry::UpsertOutcome;
use service::session::{self, Session};
use service::splice::splice;
use service::Error as ServiceError;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::events::{self, Event};
use crate::state::State;
use crate::tls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind `state.config.agent_addr` and accept agent connections until the
/// process is killed. Every connection gets its own task; one agent's
/// failure never affects another's.
pub async fn run(state: Arc<State>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.agent_addr).await?;
    let acceptor = tls::acceptor(&state.ca, &state.identity)?;
    log::info!("agent listener bound on {}", state.config.agent_addr);

    loop {
        let (tcp, peer) = listener.accept().await?;
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(state, tcp, peer, acceptor).await {
                log::warn!("agent {peer}: session ended: {err}");
            }
        });
    }
}

async fn handle_connection(
    state: Arc<State>,
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
) -> anyhow::Result<()> {
    tcp.set_nodelay(true)?;
    let tls_stream = acceptor.accept(tcp).await?;

    {
        let (_, connection) = tls_stream.get_ref();
        let crl = state.crl.read();
        tls::check_not_revoked(connection, &crl)?;
    }

    // The server plays the multiplex opener role; the agent is the acceptor
    // (§4.2's inverted roles).
    let mut multiplex = Multiplex::new(tls_stream, Role::Opener);
    let opener = multiplex.opener();

    let mut info_stream = multiplex.open().await.map_err(|err| anyhow::anyhow!("open info stream: {err}"))?;
    write_envelope(&mut info_stream, &Envelope::new(Payload::InfoRequest)).await?;
    let reply = read_envelope(&mut info_stream).await?;
    drop(info_stream);

    let Payload::InfoReply { name, hostname, interfaces, redirectors: remote_redirectors } = reply.payload else {
        anyhow::bail!("agent {peer} sent {:?} instead of InfoReply", reply.opcode);
    };

    let macs = session::non_loopback_macs(&interfaces);
    let id = session::session_id(&macs);

    log::info!("agent {peer}: identified as {id} ({name}, {hostname})");

    let mut session = Session::new(id.clone(), name, hostname, interfaces);
    session.attach(opener.clone());

    let outcome = match state.registry.upsert(session) {
        Ok(outcome) => outcome,
        Err(_rejected) => {
            log::warn!("agent {peer}: duplicate of already-connected session {id}, rejecting");
            return Ok(());
        }
    };

    events::publish(Event::new("session.connected", &id, &peer.to_string()));

    reconcile_redirectors(&state, &opener, &id, &remote_redirectors).await;

    if let UpsertOutcome::Restored { was_relaying: true } = outcome {
        log::info!("agent {peer}: restoring relay for session {id}");
        if let Err(err) = start_relay(&state, &id, state.config.max_connection, state.config.max_inflight).await {
            log::warn!("agent {peer}: failed to restore relay: {err}");
        }
    }

    let _ = state.persist_session(&id).await;

    // Dispatch every inbound stream the agent opens for the rest of this
    // connection's life. The only kind the agent ever opens unprompted is a
    // redirector accept-callback (§4.8); anything else is a protocol
    // violation.
    while let Some(stream) = multiplex.accept().await {
        let state = state.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_inbound_stream(&state, &id, stream).await {
                log::warn!("session {id}: inbound stream error: {err}");
            }
        });
    }

    log::info!("session {id}: multiplex closed, disconnecting");
    disconnect(&state, &id).await;
    Ok(())
}

/// Handle one stream the agent opened on its own initiative: always a
/// redirector accept-callback. The callback carries no redirector id (§6,
/// §11) — the agent relays no more than the bare marker — so when a session
/// has more than one bound redirector this falls back to the first and logs
/// the ambiguity rather than guessing wrong silently.
async fn handle_inbound_stream(state: &State, id: &str, mut stream: Stream) -> anyhow::Result<()> {
    let envelope = read_envelope(&mut stream).await?;
    if !matches!(envelope.payload, Payload::RedirectorBindRequest) {
        anyhow::bail!("unexpected unsolicited opcode {:?}", envelope.opcode);
    }

    let to = state
        .registry
        .with(id, |session| {
            if session.redirectors.len() > 1 {
                log::warn!(
                    "session {id}: redirector accept-callback is ambiguous across {} redirectors, using the first",
                    session.redirectors.len()
                );
            }
            session.redirectors.first().map(|r| r.to.clone())
        })
        .flatten();

    let Some(to) = to else {
        anyhow::bail!("redirector accept-callback with no redirector bound on session {id}");
    };

    let dialed = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&to)).await??;
    write_envelope(&mut stream, &Envelope::new(Payload::RedirectorBindResponse)).await?;
    splice(dialed, stream).await;
    Ok(())
}

/// Reconcile a reconnecting/new session's saved redirector set against what
/// the agent itself reports (§4.6): the saved set is authoritative. Anything
/// saved that the agent doesn't have is recreated; anything the agent
/// reports that isn't saved locally is closed.
async fn reconcile_redirectors(state: &State, opener: &Opener, id: &str, remote: &[codec::RedirectorInfo]) {
    let saved = state.registry.with(id, |session| session.redirectors.clone()).unwrap_or_default();

    for redirector in &saved {
        if !remote.iter().any(|r| r.id == redirector.id) {
            let mut opener = opener.clone();
            if let Err(err) = add_redirector_remote(&mut opener, redirector).await {
                log::warn!("session {id}: failed to recreate redirector {}: {err}", redirector.id);
            }
        }
    }

    for stray in remote {
        if !saved.iter().any(|r| r.id == stray.id) {
            let mut opener = opener.clone();
            if let Err(err) = remove_redirector_remote(&mut opener, &stray.id).await {
                log::warn!("session {id}: failed to close stray redirector {}: {err}", stray.id);
            }
        }
    }
}

/// Start relaying for `id`: build a fresh tun + netstack, hand it to the
/// session, and spawn the packet-pipeline drain loop. Idempotent: a second
/// call while already relaying is a no-op (`Session::start_relay`'s own
/// idempotence).
pub async fn start_relay(state: &State, id: &str, max_connection: usize, max_inflight: usize) -> anyhow::Result<()> {
    if state.registry.with(id, |s| s.is_relaying()).unwrap_or(false) {
        return Ok(());
    }

    let tun_name = format!("lg{}", &id[..8.min(id.len())]);
    let netstack = Arc::new(NetStack::new(&tun_name, max_connection, max_inflight).await?);

    let opener = state
        .registry
        .with_mut(id, |session| {
            session.start_relay(netstack.clone());
            session.opener()
        })
        .flatten();

    let Some(opener) = opener else {
        netstack.destroy();
        anyhow::bail!("session {id} not connected, cannot relay");
    };

    let registry = state.registry.clone();
    let drain_id = id.to_string();
    let routes = move || registry.with(&drain_id, |s| s.routes.clone()).unwrap_or_default();

    tokio::spawn(service::pipeline::drain(netstack, opener, routes));
    Ok(())
}

/// Stop relaying for `id`. Idempotent.
pub async fn stop_relay(state: &State, id: &str) -> anyhow::Result<()> {
    let relay = state.registry.with_mut(id, |session| session.stop_relay()).flatten();
    if let Some(relay) = relay {
        relay.netstack.destroy();
    }
    let _ = state.persist_session(id).await;
    Ok(())
}

/// Send a fresh `RedirectorRequest` to `id`'s agent, used both by the
/// reconnect reconciliation above and the `AddRedirector` RPC.
pub async fn add_redirector_remote(opener: &mut Opener, redirector: &ServiceRedirector) -> Result<(), ServiceError> {
    let mut stream = opener.open().await.map_err(|err| ServiceError::Transport(err.to_string()))?;
    write_envelope(
        &mut stream,
        &Envelope::new(Payload::RedirectorRequest {
            id: redirector.id.clone(),
            proto: redirector.proto,
            from: redirector.from.clone(),
            to: redirector.to.clone(),
        }),
    )
    .await
    .map_err(|err| ServiceError::Transport(err.to_string()))?;

    let reply = read_envelope(&mut stream).await.map_err(|err| ServiceError::Protocol(err.to_string()))?;
    match reply.payload {
        Payload::RedirectorResponse { err: false, .. } => Ok(()),
        Payload::RedirectorResponse { err: true, err_string, .. } => Err(ServiceError::Transport(err_string)),
        _ => Err(ServiceError::Protocol("unexpected reply to RedirectorRequest".into())),
    }
}

/// Send a `RedirectorCloseRequest` to `id`'s agent, for `RemoveRedirector`.
pub async fn remove_redirector_remote(opener: &mut Opener, redirector_id: &str) -> Result<(), ServiceError> {
    let mut stream = opener.open().await.map_err(|err| ServiceError::Transport(err.to_string()))?;
    write_envelope(&mut stream, &Envelope::new(Payload::RedirectorCloseRequest { id: redirector_id.to_string() }))
        .await
        .map_err(|err| ServiceError::Transport(err.to_string()))?;

    let reply = read_envelope(&mut stream).await.map_err(|err| ServiceError::Protocol(err.to_string()))?;
    match reply.payload {
        Payload::RedirectorCloseResponse { err: false, .. } => Ok(()),
        Payload::RedirectorCloseResponse { err: true, err_string, .. } => Err(ServiceError::Transport(err_string)),
        _ => Err(ServiceError::Protocol("unexpected reply to RedirectorCloseRequest".into())),
    }
}

/// Best-effort `DisconnectRequest` followed by local teardown (§4.6). Used
/// both when the multiplex closes on its own and for `KillSession`.
pub async fn disconnect(state: &State, id: &str) {
    let mut opener = state.registry.with(id, |s| s.opener()).flatten();
    if let Some(opener) = opener.as_mut() {
        if let Ok(mut stream) = opener.open().await {
            let _ = write_envelope(&mut stream, &Envelope::new(Payload::DisconnectRequest)).await;
        }
    }

    let relay = state.registry.with_mut(id, |session| session.detach()).flatten();
    if let Some(relay) = relay {
        relay.netstack.destroy();
    }

    events::publish(Event::new("session.disconnected", id, ""));
    let _ = state.persist_session(id).await;
}
