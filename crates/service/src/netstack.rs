//! Tunnel device + user-space netstack. Ported from the reference
//! implementation's gVisor-backed `internal/network/netstack.go` onto a
//! pure-Rust stack: `tun-rs` supplies the OS-level L3 device, `smoltcp`
//! supplies the IPv4/IPv6/TCP/UDP/ICMP processing.
//!
//! The forwarder semantics are preserved even though the underlying stack
//! is different: a new flow is first observed on a raw IP socket (which
//! sees every packet the interface carries without consuming it), enqueued
//! on the `ConnPool` as a pending four-tuple, and only actually handed a
//! real `smoltcp` socket once the agent's `ConnectResponse` comes back —
//! mirroring gVisor's `tcp.ForwarderRequest`/`CreateEndpoint` deferred-accept
//! design without requiring every destination port to be pre-registered.
//! One raw socket per observed protocol (TCP, UDP, ICMPv4) runs this way;
//! `smoltcp`'s raw sockets hand back the whole IP datagram (header
//! included), which is what lets the observer recover real source/
//! destination addresses instead of only the transport header.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{raw, tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, Icmpv4Packet, Icmpv4Repr, IpAddress, IpCidr, IpListenEndpoint, IpProtocol,
    IpVersion, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tun_rs::AsyncDevice;

use crate::route::Route;

/// Transport-level identity of one flow, as seen at the tunnel device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

/// A flow (or ICMP echo) dequeued from a relay's `ConnPool`, tagged by
/// transport. Rather than open polymorphism, each variant carries exactly
/// the data its handler needs.
#[derive(Debug, Clone)]
pub enum TunConn {
    Tcp { tuple: FourTuple, syn: BytesMut },
    Udp { tuple: FourTuple, first_datagram: BytesMut },
    /// `address` is the pinged destination (the IP the echo request was
    /// sent to); `packet` is the original IP datagram, kept around so a
    /// reply can be synthesized without re-deriving the ident/sequence
    /// number the client will match its reply against.
    Icmp { address: IpAddr, packet: BytesMut },
}

/// Bounded FIFO of pending flows awaiting the packet pipeline (§4.4/§4.5).
/// `add` fails fast once closed; `close` is idempotent-in-effect.
pub struct ConnPool {
    sender: mpsc::Sender<TunConn>,
    receiver: Mutex<Option<mpsc::Receiver<TunConn>>>,
    closed: Arc<tokio::sync::Notify>,
    is_closed: Arc<std::sync::atomic::AtomicBool>,
}

impl ConnPool {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            closed: Arc::new(tokio::sync::Notify::new()),
            is_closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn add(&self, conn: TunConn) -> Result<(), TunConn> {
        if self.is_closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(conn);
        }

        self.sender.try_send(conn).map_err(|err| match err {
            mpsc::error::TrySendError::Full(conn) => conn,
            mpsc::error::TrySendError::Closed(conn) => conn,
        })
    }

    pub fn closed(&self) -> bool {
        self.is_closed.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.is_closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            self.closed.notify_waiters();
        }
    }

    /// Take ownership of the receiving half. Only one drain worker may hold
    /// it at a time; a second call returns `None`.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<TunConn>> {
        self.receiver.lock().take()
    }
}

/// An `smoltcp` [`Device`] backed by an async OS tun file descriptor. Reads
/// and writes whole IP packets; smoltcp drives framing/checksums above this.
pub struct TunDevice {
    inner: Arc<AsyncDevice>,
    mtu: usize,
    rx_buf: Option<Vec<u8>>,
}

impl TunDevice {
    pub fn new(inner: Arc<AsyncDevice>, mtu: usize) -> Self {
        Self { inner, mtu, rx_buf: None }
    }

    /// Pull one packet from the OS device into `rx_buf`, non-blocking.
    /// Called once per poll iteration by the driver task before invoking
    /// `Interface::poll`, so `receive()` below only ever hands back data
    /// that is already resident.
    fn pull(&mut self) {
        let mut buf = vec![0u8; self.mtu];
        if let Ok(n) = self.inner.try_recv(&mut buf) {
            buf.truncate(n);
            self.rx_buf = Some(buf);
        }
    }
}

impl Device for TunDevice {
    type RxToken<'a> = TunRxToken;
    type TxToken<'a> = TunTxToken;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.pull();
        let buf = self.rx_buf.take()?;
        Some((TunRxToken { buf }, TunTxToken { device: self.inner.clone() }))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TunTxToken { device: self.inner.clone() })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

pub struct TunRxToken {
    buf: Vec<u8>,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buf)
    }
}

pub struct TunTxToken {
    device: Arc<AsyncDevice>,
}

impl TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        let _ = self.device.try_send(&buf);
        result
    }
}

/// Default TCP in-flight cap: bounds SYN-flood amplification (§4.4).
pub const DEFAULT_MAX_INFLIGHT: usize = 4096;
/// Default bound on the conn-pool itself.
pub const DEFAULT_MAX_CONNECTION: usize = 1024;

const TCP_RX_BUFFER: usize = 64 * 1024;
const TCP_TX_BUFFER: usize = 64 * 1024;
const UDP_RX_BUFFER: usize = 64 * 1024;
const UDP_TX_BUFFER: usize = 64 * 1024;

struct Shared {
    interface: Interface,
    sockets: SocketSet<'static>,
    device: TunDevice,
    /// Raw sockets used only to observe every packet the interface carries
    /// without consuming it, so new flows can be detected before a real
    /// socket exists for them (§4.4's forwarder semantics) and so ICMP
    /// echo requests can be answered without a bound listener.
    raw_tcp: SocketHandle,
    raw_udp: SocketHandle,
    raw_icmp: SocketHandle,
    /// Tuples already enqueued, so the raw-socket observer does not
    /// re-enqueue retransmitted SYNs/datagrams for the same flow. Not
    /// consulted for ICMP: every echo request is answered independently.
    seen: HashSet<FourTuple>,
    /// In-flight TCP flows awaiting `ConnectResponse`, capped at
    /// `max_inflight` to bound SYN-flood amplification.
    inflight: usize,
    max_inflight: usize,
    wakers: Vec<Waker>,
}

/// Per-relay tunnel device + netstack. One per active relay; owned
/// exclusively by its session (§9 cyclic-reference design note).
pub struct NetStack {
    pub pool: Arc<ConnPool>,
    device: Arc<AsyncDevice>,
    shared: Arc<Mutex<Shared>>,
    driver: tokio::task::JoinHandle<()>,
    tun_name: String,
}

impl NetStack {
    /// Create the tunnel device, attach the netstack with promiscuous mode,
    /// spoofing, disabled SACK/SYN-cookies, and a default route for both
    /// address families, per §4.4.
    pub async fn new(tun_name: &str, max_connection: usize, max_inflight: usize) -> std::io::Result<Self> {
        let builder = tun_rs::DeviceBuilder::new()
            .name(tun_name)
            .mtu(1500)
            .ipv4("100.64.0.1".parse::<Ipv4Addr>().unwrap(), 10, None);
        let dev = builder.build_async()?;
        let device = Arc::new(dev);

        let mut smol_device = TunDevice::new(device.clone(), 1500);
        let config = Config::new(HardwareAddress::Ip);
        let mut interface = Interface::new(config, &mut smol_device, SmolInstant::now());

        interface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(smoltcp::wire::Ipv4Address::new(100, 64, 0, 1).into(), 10));
        });

        // Promiscuous mode + spoofing: any destination routes to the stack.
        interface.set_any_ip(true);

        let mut sockets = SocketSet::new(vec![]);

        // Raw sockets, one per observed protocol, each capturing every
        // matching IP datagram (header included) so new flows and ICMP
        // echo requests can be seen without pre-registering every possible
        // destination.
        let raw_tcp = sockets.add(raw::Socket::new(
            IpVersion::Ipv4,
            IpProtocol::Tcp,
            raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; 256], vec![0u8; 65536]),
            raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; 1], vec![0u8; 1]),
        ));
        let raw_udp = sockets.add(raw::Socket::new(
            IpVersion::Ipv4,
            IpProtocol::Udp,
            raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; 256], vec![0u8; 65536]),
            raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; 1], vec![0u8; 1]),
        ));
        let raw_icmp = sockets.add(raw::Socket::new(
            IpVersion::Ipv4,
            IpProtocol::Icmp,
            raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; 64], vec![0u8; 16384]),
            raw::PacketBuffer::new(vec![raw::PacketMetadata::EMPTY; 1], vec![0u8; 1]),
        ));

        let pool = Arc::new(ConnPool::new(max_connection));

        let shared = Arc::new(Mutex::new(Shared {
            interface,
            sockets,
            device: smol_device,
            raw_tcp,
            raw_udp,
            raw_icmp,
            seen: HashSet::new(),
            inflight: 0,
            max_inflight: max_inflight.max(1),
            wakers: Vec::new(),
        }));

        let driver = tokio::spawn(Self::poll_loop(shared.clone(), pool.clone()));

        Ok(Self { pool, device, shared, driver, tun_name: tun_name.to_string() })
    }

    /// Background poll loop: drives the smoltcp interface, detects new
    /// flows (and ICMP echo requests) on the raw observer sockets, and
    /// enqueues them on the pool.
    async fn poll_loop(shared: Arc<Mutex<Shared>>, pool: Arc<ConnPool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(10));
        loop {
            ticker.tick().await;
            if pool.closed() {
                return;
            }

            let mut guard = shared.lock();
            let Shared {
                interface,
                sockets,
                device,
                raw_tcp,
                raw_udp,
                raw_icmp,
                seen,
                inflight,
                max_inflight,
                wakers,
            } = &mut *guard;

            interface.poll(SmolInstant::now(), device, sockets);

            let tcp_socket = sockets.get_mut::<raw::Socket>(*raw_tcp);
            while tcp_socket.can_recv() {
                let Ok(packet) = tcp_socket.recv() else { break };
                if let Some((tuple, conn)) = classify_tcp(packet, *inflight < *max_inflight) {
                    if seen.insert(tuple) {
                        *inflight += 1;
                        let _ = pool.add(conn);
                    }
                }
            }

            let udp_socket = sockets.get_mut::<raw::Socket>(*raw_udp);
            while udp_socket.can_recv() {
                let Ok(packet) = udp_socket.recv() else { break };
                if let Some((tuple, conn)) = classify_udp(packet) {
                    if seen.insert(tuple) {
                        let _ = pool.add(conn);
                    }
                }
            }

            let icmp_socket = sockets.get_mut::<raw::Socket>(*raw_icmp);
            while icmp_socket.can_recv() {
                let Ok(packet) = icmp_socket.recv() else { break };
                if let Some((address, packet)) = classify_icmp_echo(packet) {
                    let _ = pool.add(TunConn::Icmp { address, packet });
                }
            }

            for waker in wakers.drain(..) {
                waker.wake();
            }
        }
    }

    pub fn device(&self) -> Arc<AsyncDevice> {
        self.device.clone()
    }

    /// Apply the given routes as the OS routing table entries for this
    /// relay's tun device (§4.4's "default route for both address families
    /// pointing at the single NIC", generalized to one route per owned
    /// prefix). Flushes every route currently pointed at the device first,
    /// so a second call with a different route set behaves like a fresh
    /// apply rather than an accumulation. Called by `Session::start_relay`
    /// and on every route mutation while relaying; infrequent enough that
    /// shelling out to `ip route` synchronously is not a concern (never on
    /// the per-packet path). Best-effort: a route command failing (e.g. no
    /// `CAP_NET_ADMIN`) is logged, not fatal to the relay.
    pub fn apply_routes(&self, routes: &[Route]) {
        if let Err(err) = run_ip(&["route", "flush", "dev", &self.tun_name]) {
            log::warn!("netstack {}: failed to flush routes: {err}", self.tun_name);
        }

        for route in routes {
            if let Err(err) = run_ip(&["route", "add", &route.cidr.to_string(), "dev", &self.tun_name]) {
                log::warn!("netstack {}: failed to add route {}: {err}", self.tun_name, route.cidr);
            }
        }
    }

    /// Complete a pending TCP flow once the agent confirms establishment:
    /// create a real listening socket for this exact tuple so the next poll
    /// picks up the handshake, and return an async adapter over it (§4.4
    /// step 4, "accept the ForwarderRequest").
    pub fn complete_tcp(&self, tuple: FourTuple) -> TcpEndpoint {
        let mut shared = self.shared.lock();
        shared.inflight = shared.inflight.saturating_sub(1);

        let rx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUFFER]);
        let tx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUFFER]);
        let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);
        let _ = socket.listen(IpListenEndpoint {
            addr: Some(to_smol_addr(tuple.local_addr)),
            port: tuple.local_port,
        });

        let handle = shared.sockets.add(socket);
        TcpEndpoint { shared: self.shared.clone(), handle }
    }

    /// Abandon a pending TCP flow the agent refused with `reset=true`:
    /// inject a TCP RST toward the originator (§4.4 step 4), so the
    /// originating client observes the refusal immediately rather than
    /// hanging on a half-open flow. `syn_segment` is the original SYN's TCP
    /// header, needed to ack the correct sequence number (RFC 793 §3.4).
    pub fn reset_tcp(&self, tuple: FourTuple, syn_segment: &[u8]) {
        {
            let mut shared = self.shared.lock();
            shared.inflight = shared.inflight.saturating_sub(1);
        }

        match build_tcp_reset(tuple, syn_segment) {
            Some(packet) => {
                let _ = self.device.try_send(&packet);
            }
            None => log::debug!("netstack {}: could not build tcp reset for {tuple:?}", self.tun_name),
        }
    }

    /// Complete a pending UDP flow: create a bound datagram socket for this
    /// tuple and hand back an async adapter.
    pub fn complete_udp(&self, tuple: FourTuple) -> UdpEndpoint {
        let mut shared = self.shared.lock();

        let rx_buffer =
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 32], vec![0u8; UDP_RX_BUFFER]);
        let tx_buffer =
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 32], vec![0u8; UDP_TX_BUFFER]);
        let mut socket = udp::Socket::new(rx_buffer, tx_buffer);
        let _ = socket.bind(IpListenEndpoint {
            addr: Some(to_smol_addr(tuple.local_addr)),
            port: tuple.local_port,
        });

        let handle = shared.sockets.add(socket);
        UdpEndpoint { shared: self.shared.clone(), handle, peer: tuple }
    }

    /// Answer an ICMPv4 echo request with a synthesized reply, injected
    /// straight through the tun device (§4.4): this does not go through
    /// `smoltcp`'s own ICMP socket since the reply must appear to come
    /// from the exact address that was pinged, which is whatever the
    /// client dialed rather than an address this stack owns.
    pub fn reply_icmp_echo(&self, packet: &[u8]) {
        match build_icmp_echo_reply(packet) {
            Some(reply) => {
                let _ = self.device.try_send(&reply);
            }
            None => log::debug!("netstack {}: not a well-formed icmp echo request, dropping", self.tun_name),
        }
    }

    /// Tear down the background poll loop and close the conn-pool, waking
    /// the drain worker so it stops pulling flows. Takes `&self` (not
    /// `self`) because the netstack is held behind an `Arc` shared with the
    /// relay's drain task; ownership can't be moved out of a session's
    /// `Relay` once that task may also be holding a clone.
    pub fn destroy(&self) {
        if let Err(err) = run_ip(&["route", "flush", "dev", &self.tun_name]) {
            log::warn!("netstack {}: failed to flush routes on teardown: {err}", self.tun_name);
        }
        self.pool.close();
        self.driver.abort();
    }
}

/// Shell out to the platform `ip` command (iproute2). The routing table is
/// process-global kernel state no Rust crate models safely alongside
/// smoltcp's own, entirely userspace, view of the tun device; `ip route` is
/// the same tool the reference implementation's host integration shells out
/// to.
fn run_ip(args: &[&str]) -> std::io::Result<()> {
    let output = std::process::Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn to_smol_addr(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4.into()),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6.into()),
    }
}

/// Inspect a raw IPv4 datagram (header included, as `smoltcp`'s raw
/// sockets hand it back) and, if it carries a TCP SYN opening a new flow,
/// return its tuple and the pending `TunConn`. Returns `None` for anything
/// else, or when the in-flight cap is already saturated (the packet is
/// simply dropped, matching a real stack under SYN-flood back-pressure).
fn classify_tcp(payload: &[u8], inflight_has_room: bool) -> Option<(FourTuple, TunConn)> {
    let ipv4 = Ipv4Packet::new_checked(payload).ok()?;
    let tcp = TcpPacket::new_checked(ipv4.payload()).ok()?;
    if !(tcp.syn() && !tcp.ack()) {
        return None;
    }
    if !inflight_has_room {
        return None;
    }

    let tuple = FourTuple {
        local_addr: IpAddr::V4(ipv4.dst_addr().into()),
        local_port: tcp.dst_port(),
        remote_addr: IpAddr::V4(ipv4.src_addr().into()),
        remote_port: tcp.src_port(),
    };
    Some((tuple, TunConn::Tcp { tuple, syn: BytesMut::from(ipv4.payload()) }))
}

/// Inspect a raw IPv4 datagram and, if it carries a UDP payload, return its
/// tuple and the pending `TunConn`. UDP is flow-less (§4.4) so every
/// not-yet-seen tuple becomes a new flow; there is no in-flight cap.
fn classify_udp(payload: &[u8]) -> Option<(FourTuple, TunConn)> {
    let ipv4 = Ipv4Packet::new_checked(payload).ok()?;
    let udp = UdpPacket::new_checked(ipv4.payload()).ok()?;

    let tuple = FourTuple {
        local_addr: IpAddr::V4(ipv4.dst_addr().into()),
        local_port: udp.dst_port(),
        remote_addr: IpAddr::V4(ipv4.src_addr().into()),
        remote_port: udp.src_port(),
    };
    Some((tuple, TunConn::Udp { tuple, first_datagram: BytesMut::from(udp.payload()) }))
}

/// Inspect a raw IPv4 datagram and, if it is an ICMPv4 echo request,
/// return the pinged address and a copy of the whole datagram (kept so a
/// reply can reuse its ident/sequence number). Non-echo ICMP is dropped
/// per §4.4.
fn classify_icmp_echo(payload: &[u8]) -> Option<(IpAddr, BytesMut)> {
    let ipv4 = Ipv4Packet::new_checked(payload).ok()?;
    let icmp = Icmpv4Packet::new_checked(ipv4.payload()).ok()?;
    let repr = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::default()).ok()?;

    match repr {
        Icmpv4Repr::EchoRequest { .. } => Some((IpAddr::V4(ipv4.dst_addr().into()), BytesMut::from(payload))),
        _ => None,
    }
}

/// Build the IPv4+ICMPv4 echo-reply datagram for an observed echo request,
/// with source/destination swapped and the checksum recomputed the usual
/// way: ones-complement over the ICMP header+payload with the checksum
/// field zeroed (§4.4), delegated to `smoltcp`'s own repr/emit so the
/// arithmetic isn't hand-rolled a second time.
fn build_icmp_echo_reply(original: &[u8]) -> Option<Vec<u8>> {
    let ipv4_in = Ipv4Packet::new_checked(original).ok()?;
    let icmp_in = Icmpv4Packet::new_checked(ipv4_in.payload()).ok()?;
    let repr_in = Icmpv4Repr::parse(&icmp_in, &ChecksumCapabilities::default()).ok()?;

    let Icmpv4Repr::EchoRequest { ident, seq_no, data } = repr_in else {
        return None;
    };
    let reply_repr = Icmpv4Repr::EchoReply { ident, seq_no, data };

    let ipv4_repr = Ipv4Repr {
        src_addr: ipv4_in.dst_addr(),
        dst_addr: ipv4_in.src_addr(),
        next_header: IpProtocol::Icmp,
        payload_len: reply_repr.buffer_len(),
        hop_limit: 64,
    };

    let header_len = ipv4_repr.buffer_len();
    let mut buf = vec![0u8; header_len + reply_repr.buffer_len()];

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
    ipv4_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut buf[header_len..]);
    reply_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());

    Some(buf)
}

/// Build the IPv4+TCP RST segment answering a refused SYN. Per RFC 793
/// §3.4, resetting a connection for which no ACK has yet been seen means
/// the RST carries `seq=0` and acks the SYN's sequence number plus one (the
/// SYN itself occupies one sequence number).
fn build_tcp_reset(tuple: FourTuple, syn_segment: &[u8]) -> Option<Vec<u8>> {
    let (local, remote) = match (tuple.local_addr, tuple.remote_addr) {
        (IpAddr::V4(local), IpAddr::V4(remote)) => (local, remote),
        _ => return None,
    };

    let syn = TcpPacket::new_checked(syn_segment).ok()?;
    let ack_number = syn.seq_number() + 1;

    let tcp_repr = TcpRepr {
        src_port: tuple.local_port,
        dst_port: tuple.remote_port,
        control: TcpControl::Rst,
        seq_number: TcpSeqNumber(0),
        ack_number: Some(ack_number),
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        payload: &[],
    };

    let ipv4_repr = Ipv4Repr {
        src_addr: local.into(),
        dst_addr: remote.into(),
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.buffer_len(),
        hop_limit: 64,
    };

    let header_len = ipv4_repr.buffer_len();
    let mut buf = vec![0u8; header_len + tcp_repr.buffer_len()];

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
    ipv4_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let mut tcp_packet = TcpPacket::new_unchecked(&mut buf[header_len..]);
    tcp_repr.emit(
        &mut tcp_packet,
        &IpAddress::Ipv4(local.into()),
        &IpAddress::Ipv4(remote.into()),
        &ChecksumCapabilities::default(),
    );

    Some(buf)
}

/// Async adapter over a `smoltcp` TCP socket, driven by `NetStack`'s poll
/// loop. Implements the splice-compatible `AsyncRead + AsyncWrite` half of
/// an established flow.
pub struct TcpEndpoint {
    shared: Arc<Mutex<Shared>>,
    handle: SocketHandle,
}

impl AsyncRead for TcpEndpoint {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut shared = self.shared.lock();
        let socket = shared.sockets.get_mut::<tcp::Socket>(self.handle);

        if socket.can_recv() {
            let result = socket.recv(|data| {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                (n, n)
            });
            return match result {
                Ok(_) => Poll::Ready(Ok(())),
                Err(_) => Poll::Ready(Ok(())),
            };
        }

        if !socket.may_recv() {
            return Poll::Ready(Ok(()));
        }

        shared.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for TcpEndpoint {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut shared = self.shared.lock();
        let socket = shared.sockets.get_mut::<tcp::Socket>(self.handle);

        if socket.can_send() {
            return match socket.send_slice(buf) {
                Ok(n) => Poll::Ready(Ok(n)),
                Err(_) => Poll::Ready(Err(std::io::Error::other("tcp send failed"))),
            };
        }

        shared.wakers.push(cx.waker().clone());
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut shared = self.shared.lock();
        shared.sockets.get_mut::<tcp::Socket>(self.handle).close();
        Poll::Ready(Ok(()))
    }
}

/// Async adapter over a `smoltcp` UDP socket bound to one flow's tuple.
pub struct UdpEndpoint {
    shared: Arc<Mutex<Shared>>,
    handle: SocketHandle,
    peer: FourTuple,
}

impl AsyncRead for UdpEndpoint {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut shared = self.shared.lock();
        let socket = shared.sockets.get_mut::<udp::Socket>(self.handle);

        if socket.can_recv() {
            if let Ok((data, _meta)) = socket.recv() {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                return Poll::Ready(Ok(()));
            }
        }

        shared.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for UdpEndpoint {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut shared = self.shared.lock();
        let endpoint = smoltcp::wire::IpEndpoint {
            addr: to_smol_addr(self.peer.remote_addr),
            port: self.peer.remote_port,
        };
        let socket = shared.sockets.get_mut::<udp::Socket>(self.handle);

        match socket.send_slice(buf, endpoint) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(udp::SendError::BufferFull) => {
                shared.wakers.push(cx.waker().clone());
                Poll::Pending
            }
            Err(_) => Poll::Ready(Err(std::io::Error::other("udp send failed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::Ipv4Address;

    /// Build a minimal IPv4+ICMPv4 echo-request datagram for tests, the
    /// same way `smoltcp`'s own raw-socket `recv()` would hand one back.
    fn echo_request(ident: u16, seq_no: u16, data: &[u8]) -> Vec<u8> {
        let repr = Icmpv4Repr::EchoRequest { ident, seq_no, data };
        let ipv4_repr = Ipv4Repr {
            src_addr: Ipv4Address::new(10, 1, 2, 3),
            dst_addr: Ipv4Address::new(100, 64, 0, 5),
            next_header: IpProtocol::Icmp,
            payload_len: repr.buffer_len(),
            hop_limit: 64,
        };

        let header_len = ipv4_repr.buffer_len();
        let mut buf = vec![0u8; header_len + repr.buffer_len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ipv4_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
        let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut buf[header_len..]);
        repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());
        buf
    }

    #[test]
    fn classify_icmp_echo_extracts_the_pinged_destination() {
        let packet = echo_request(42, 1, b"payload");
        let (address, _) = classify_icmp_echo(&packet).unwrap();
        assert_eq!(address, IpAddr::V4(Ipv4Addr::new(100, 64, 0, 5)));
    }

    #[test]
    fn classify_icmp_ignores_non_echo_messages() {
        let repr = Icmpv4Repr::EchoReply { ident: 1, seq_no: 1, data: b"x" };
        let ipv4_repr = Ipv4Repr {
            src_addr: Ipv4Address::new(10, 1, 2, 3),
            dst_addr: Ipv4Address::new(100, 64, 0, 5),
            next_header: IpProtocol::Icmp,
            payload_len: repr.buffer_len(),
            hop_limit: 64,
        };
        let header_len = ipv4_repr.buffer_len();
        let mut buf = vec![0u8; header_len + repr.buffer_len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ipv4_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
        let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut buf[header_len..]);
        repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());

        assert!(classify_icmp_echo(&buf).is_none());
    }

    #[test]
    fn echo_reply_swaps_addresses_and_preserves_ident_and_data() {
        let request = echo_request(7, 3, b"ping-data");
        let reply = build_icmp_echo_reply(&request).unwrap();

        let ip_in = Ipv4Packet::new_checked(&request).unwrap();
        let ip_out = Ipv4Packet::new_checked(&reply).unwrap();
        assert_eq!(ip_out.src_addr(), ip_in.dst_addr());
        assert_eq!(ip_out.dst_addr(), ip_in.src_addr());

        let icmp_out = Icmpv4Packet::new_checked(ip_out.payload()).unwrap();
        let repr_out = Icmpv4Repr::parse(&icmp_out, &ChecksumCapabilities::default()).unwrap();
        match repr_out {
            Icmpv4Repr::EchoReply { ident, seq_no, data } => {
                assert_eq!(ident, 7);
                assert_eq!(seq_no, 3);
                assert_eq!(data, b"ping-data");
            }
            other => panic!("expected EchoReply, got {other:?}"),
        }
    }

    #[test]
    fn classify_tcp_extracts_real_addresses_and_ports() {
        use smoltcp::wire::{TcpRepr, TcpSeqNumber};

        let tcp_repr = TcpRepr {
            src_port: 54321,
            dst_port: 80,
            control: smoltcp::wire::TcpControl::Syn,
            seq_number: TcpSeqNumber(0),
            ack_number: None,
            window_len: 65535,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None, None, None],
            payload: &[],
        };

        let ipv4_repr = Ipv4Repr {
            src_addr: Ipv4Address::new(100, 64, 0, 2),
            dst_addr: Ipv4Address::new(10, 1, 2, 3),
            next_header: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            hop_limit: 64,
        };

        let header_len = ipv4_repr.buffer_len();
        let mut buf = vec![0u8; header_len + tcp_repr.buffer_len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ipv4_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
        let mut tcp_packet = TcpPacket::new_unchecked(&mut buf[header_len..]);
        tcp_repr.emit(
            &mut tcp_packet,
            &Ipv4Address::new(100, 64, 0, 2).into(),
            &Ipv4Address::new(10, 1, 2, 3).into(),
            &ChecksumCapabilities::default(),
        );

        let (tuple, _) = classify_tcp(&buf, true).unwrap();
        assert_eq!(tuple.local_addr, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(tuple.local_port, 80);
        assert_eq!(tuple.remote_addr, IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2)));
        assert_eq!(tuple.remote_port, 54321);
    }
}
