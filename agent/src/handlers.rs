//! Per-stream protocol handlers (§4.3). Every inbound multiplex stream opens
//! with exactly one request envelope; which variant it carries decides which
//! handler below processes it, mirroring the reference implementation's
//! `protocol.Handle` dispatch-by-opcode switch.

use std::net::ToSocketAddrs;
use std::time::Duration;

use codec::io::{read_envelope, write_envelope};
use codec::{Envelope, Net, Payload, Transport};
use service::mux::{Opener, Stream};
use service::splice::splice;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::interfaces;
use crate::proxy::Dialer;
use crate::redirector::Redirectors;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Consume one stream end-to-end: read its opening request, act on it, reply
/// (if the opcode expects a reply), and for `ConnectRequest`/redirector
/// accept-callbacks keep the stream alive afterwards to splice traffic.
pub async fn handle(mut stream: Stream, alias: &str, dialer: Dialer, redirectors: Redirectors, opener: Opener) {
    let request = match read_envelope(&mut stream).await {
        Ok(envelope) => envelope,
        Err(err) => {
            log::debug!("agent: failed to read opening envelope: {err}");
            return;
        }
    };

    let result = match request.payload {
        Payload::InfoRequest => handle_info(&mut stream, alias).await,
        Payload::ConnectRequest { net, transport, address, port } => {
            handle_connect(stream, net, transport, address, port, dialer).await
        }
        Payload::HostPingRequest { address } => handle_ping(&mut stream, address).await,
        Payload::RedirectorRequest { id, proto, from, to } => {
            handle_redirector_request(&mut stream, id, proto, from, to, redirectors, opener).await
        }
        Payload::RedirectorCloseRequest { id } => handle_redirector_close(&mut stream, id, redirectors).await,
        Payload::DisconnectRequest => {
            let _ = write_envelope(&mut stream, &Envelope::new(Payload::DisconnectResponse)).await;
            Ok(())
        }
        other => {
            log::debug!("agent: unexpected opening payload: {other:?}");
            Ok(())
        }
    };

    if let Err(err) = result {
        log::debug!("agent: stream handler failed: {err}");
    }
}

async fn handle_info(stream: &mut Stream, alias: &str) -> anyhow::Result<()> {
    let interfaces = interfaces::enumerate()?;
    let hostname = hostname();

    write_envelope(
        stream,
        &Envelope::new(Payload::InfoReply { name: alias.to_string(), hostname, interfaces, redirectors: Vec::new() }),
    )
    .await?;

    Ok(())
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

async fn handle_connect(
    mut stream: Stream,
    net: Net,
    transport: Transport,
    address: String,
    port: u16,
    dialer: Dialer,
) -> anyhow::Result<()> {
    let target = format!("{address}:{port}");
    let _ = net; // address family is implied by `address` itself once parsed.

    match transport {
        Transport::Tcp => match timeout(CONNECT_TIMEOUT, dialer.dial_tcp(&target)).await {
            Ok(Ok(socket)) => {
                write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: true, reset: false }))
                    .await?;
                splice(socket, stream).await;
                Ok(())
            }
            // Only the errno values that mean "a host on the path actively
            // refused or unreachable-ed us" translate into a TCP reset back
            // to the originating client (§4.3); a bare timeout means nothing
            // answered at all, which is a silent drop, not a refusal.
            Ok(Err(err)) if is_refusal(&err) => {
                write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: false, reset: true }))
                    .await?;
                Ok(())
            }
            _ => {
                write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: false, reset: false }))
                    .await?;
                Ok(())
            }
        },
        Transport::Udp => match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) if socket.connect(&target).await.is_ok() => {
                write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: true, reset: false }))
                    .await?;
                crate::udp::splice_udp(socket, stream).await;
                Ok(())
            }
            _ => {
                write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: false, reset: false }))
                    .await?;
                Ok(())
            }
        },
    }
}

/// True for the errno family that means a host on the path actively
/// rejected the connection rather than the dial simply timing out (§4.3).
fn is_refusal(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(err.kind(), ErrorKind::ConnectionRefused | ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable)
}

async fn handle_ping(stream: &mut Stream, address: String) -> anyhow::Result<()> {
    let alive = timeout(PING_TIMEOUT, probe(address)).await.unwrap_or(false);
    write_envelope(stream, &Envelope::new(Payload::HostPingResponse { alive })).await?;
    Ok(())
}

/// Best-effort reachability probe. A raw ICMP echo needs `CAP_NET_RAW`; a TCP
/// connect to the highest ephemeral port is a reasonable host-is-up signal
/// when that privilege is unavailable, mirroring the reference
/// implementation's fallback (§4.4, §11).
async fn probe(address: String) -> bool {
    let Some(addr) = format!("{address}:0")
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
    else {
        return false;
    };

    TcpStream::connect((addr.ip(), 1)).await.is_ok()
        || TcpStream::connect((addr.ip(), 80)).await.is_ok()
}

async fn handle_redirector_request(
    stream: &mut Stream,
    id: String,
    proto: Transport,
    from: String,
    to: String,
    redirectors: Redirectors,
    opener: Opener,
) -> anyhow::Result<()> {
    let response_id = id.clone();
    let (err, err_string) = match redirectors.start(id, proto, from, to, opener).await {
        Ok(()) => (false, String::new()),
        Err(err) => (true, err.to_string()),
    };

    write_envelope(stream, &Envelope::new(Payload::RedirectorResponse { id: response_id, err, err_string })).await?;
    Ok(())
}

async fn handle_redirector_close(stream: &mut Stream, id: String, redirectors: Redirectors) -> anyhow::Result<()> {
    let (err, err_string) = match redirectors.stop(&id).await {
        Ok(()) => (false, String::new()),
        Err(err) => (true, err.to_string()),
    };

    write_envelope(stream, &Envelope::new(Payload::RedirectorCloseResponse { err, err_string })).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn refusal_errors_translate_to_a_reset() {
        assert!(is_refusal(&Error::new(ErrorKind::ConnectionRefused, "refused")));
        assert!(is_refusal(&Error::new(ErrorKind::HostUnreachable, "unreachable")));
        assert!(is_refusal(&Error::new(ErrorKind::NetworkUnreachable, "unreachable")));
    }

    #[test]
    fn timeout_like_errors_are_not_a_refusal() {
        assert!(!is_refusal(&Error::new(ErrorKind::TimedOut, "timed out")));
        assert!(!is_refusal(&Error::new(ErrorKind::Other, "other")));
    }
}
