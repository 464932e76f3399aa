//! Packet-to-stream pipeline (§4.4 steps 2-4): for each flow dequeued from a
//! relaying session's `ConnPool`, rewrite the local address if a loopback
//! route claims it, open a fresh multiplex stream and negotiate a remote
//! connect, then splice the dialed-or-refused outcome back onto the local
//! netstack endpoint. Mirrors the reference implementation's per-connection
//! goroutine in `internal/network/pipe.go`, one task per flow instead of one
//! goroutine per flow.

use std::net::IpAddr;
use std::sync::Arc;

use codec::io::{read_envelope, write_envelope};
use codec::{Envelope, Net, Payload, Transport as WireTransport};

use crate::mux::Opener;
use crate::netstack::{ConnPool, FourTuple, NetStack, TunConn};
use crate::route::Route;
use crate::splice::splice;
use crate::Error;

/// Rewrite `addr` to the loopback address of its own family if any of
/// `routes` is a loopback route containing it (§4.4 step 2, §11). Pure and
/// independent of the netstack so it can be unit-tested without a tun device.
pub fn rewrite_loopback(addr: IpAddr, routes: &[Route]) -> IpAddr {
    let claimed = routes.iter().any(|route| route.is_loopback && route.cidr.contains(&addr));

    if !claimed {
        return addr;
    }

    match addr {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
    }
}

/// Outcome of a `ConnectRequest`/`ConnectResponse` round-trip (§4.4 step 3).
pub enum Negotiated {
    /// The agent dialed successfully; `stream` now carries the byte stream.
    Established(yamux::Stream),
    /// The agent's dial failed and it asked for the local side to see a
    /// reset (typically the agent couldn't connect a TCP flow at all).
    Reset,
    /// The agent declined silently (used for UDP, which has no handshake to
    /// fail visibly).
    Dropped,
}

/// Open a fresh multiplex stream and negotiate a `ConnectRequest` for
/// `tuple`, after rewriting its local address against `routes`.
pub async fn negotiate_connect(
    opener: &mut Opener,
    tuple: FourTuple,
    transport: WireTransport,
    routes: &[Route],
) -> Result<Negotiated, Error> {
    let local = rewrite_loopback(tuple.local_addr, routes);
    let net = if local.is_ipv4() { Net::V4 } else { Net::V6 };

    let mut stream = opener.open().await.map_err(|err| Error::Transport(err.to_string()))?;

    write_envelope(
        &mut stream,
        &Envelope::new(Payload::ConnectRequest { net, transport, address: local.to_string(), port: tuple.local_port }),
    )
    .await
    .map_err(|err| Error::Transport(err.to_string()))?;

    let reply = read_envelope(&mut stream).await.map_err(|err| Error::Protocol(err.to_string()))?;

    match reply.payload {
        Payload::ConnectResponse { established: true, .. } => Ok(Negotiated::Established(stream)),
        Payload::ConnectResponse { established: false, reset: true } => Ok(Negotiated::Reset),
        Payload::ConnectResponse { established: false, reset: false } => Ok(Negotiated::Dropped),
        _ => Err(Error::Protocol("unexpected reply to ConnectRequest".into())),
    }
}

/// Ask the agent whether `address` answers to an ICMP echo (§4.3's
/// `HostPingRequest`/`HostPingResponse` pair), opening a fresh multiplex
/// stream for the single round-trip.
async fn ping_host(opener: &mut Opener, address: IpAddr) -> Result<bool, Error> {
    let mut stream = opener.open().await.map_err(|err| Error::Transport(err.to_string()))?;

    write_envelope(&mut stream, &Envelope::new(Payload::HostPingRequest { address: address.to_string() }))
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;

    let reply = read_envelope(&mut stream).await.map_err(|err| Error::Protocol(err.to_string()))?;

    match reply.payload {
        Payload::HostPingResponse { alive } => Ok(alive),
        _ => Err(Error::Protocol("unexpected reply to HostPingRequest".into())),
    }
}

/// Drain `netstack`'s conn-pool for the lifetime of one relay, negotiating
/// and splicing every flow. Returns once the pool is closed by
/// `Session::stop_relay` (or the relay's multiplex dying, which stops
/// feeding the pool).
///
/// Takes an [`Opener`] rather than the session's [`Multiplex`] itself: the
/// per-session task still needs the `Multiplex` to `accept()` inbound
/// redirector-bind streams (§4.8) concurrently with this drain loop opening
/// outbound connect streams, so the two must not fight over one `&mut
/// Multiplex`.
///
/// ICMP echo requests are not flows in the TCP/UDP sense — there is no
/// local endpoint to splice — but still require a round-trip to the agent
/// (the pinged address is on the agent's side of the tunnel, not this
/// process's) before a reply can be synthesized and injected locally.
pub async fn drain(netstack: Arc<NetStack>, mut opener: Opener, mut routes: impl FnMut() -> Vec<Route>) {
    let pool: Arc<ConnPool> = netstack.pool.clone();
    let Some(mut receiver) = pool.take_receiver() else {
        log::warn!("packet pipeline: conn-pool receiver already taken, refusing to drain twice");
        return;
    };

    while let Some(conn) = receiver.recv().await {
        match conn {
            TunConn::Icmp { address, packet } => match ping_host(&mut opener, address).await {
                Ok(true) => netstack.reply_icmp_echo(&packet),
                Ok(false) => {}
                Err(err) => log::warn!("packet pipeline: icmp ping for {address} failed: {err}"),
            },
            TunConn::Tcp { tuple, syn } => {
                let snapshot = routes();
                match negotiate_connect(&mut opener, tuple, WireTransport::Tcp, &snapshot).await {
                    Ok(Negotiated::Established(stream)) => {
                        let endpoint = netstack.complete_tcp(tuple);
                        tokio::spawn(splice(endpoint, stream));
                    }
                    Ok(Negotiated::Reset) => netstack.reset_tcp(tuple, &syn),
                    Ok(Negotiated::Dropped) => {}
                    Err(err) => log::warn!("packet pipeline: tcp connect for {tuple:?} failed: {err}"),
                }
            }
            TunConn::Udp { tuple, .. } => {
                let snapshot = routes();
                match negotiate_connect(&mut opener, tuple, WireTransport::Udp, &snapshot).await {
                    Ok(Negotiated::Established(stream)) => {
                        let endpoint = netstack.complete_udp(tuple);
                        tokio::spawn(splice(endpoint, stream));
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("packet pipeline: udp connect for {tuple:?} failed: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn loopback_route_rewrites_to_family_loopback() {
        let routes = vec![Route::new("10.0.0.0/8".parse().unwrap(), true)];
        let rewritten = rewrite_loopback(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), &routes);
        assert_eq!(rewritten, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn non_loopback_route_leaves_address_untouched() {
        let routes = vec![Route::new("10.0.0.0/8".parse().unwrap(), false)];
        let addr = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(rewrite_loopback(addr, &routes), addr);
    }

    #[test]
    fn address_outside_every_route_is_untouched() {
        let routes = vec![Route::new("10.0.0.0/8".parse().unwrap(), true)];
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(rewrite_loopback(addr, &routes), addr);
    }
}
