//! Session entity (§4.6): the server-side record of one connected agent —
//! its identity, routes, redirectors, and (while relaying) its tunnel
//! device and multiplex handle. Grounded on the reference implementation's
//! `internal/session/session.go` `Session` struct, with the interface-list
//! hashing it uses to derive a stable per-host identifier.

pub mod registry;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use codec::NetInterface;
use sha1::{Digest, Sha1};

use crate::mux::Opener;
use crate::netstack::NetStack;
use crate::redirector::Redirector;
use crate::route::{self, Route};

/// Stable per-host identity: SHA-1 over the descending-sorted, colon-joined
/// MAC addresses of the agent's network interfaces. Two connections from the
/// same physical host produce the same id, enabling reconnect/restore (§4.6
/// "reconnect and restore" rule) instead of creating a duplicate session.
///
/// # Test
///
/// ```
/// use ligolo_service::session::session_id;
///
/// let a = session_id(&["aa:bb:cc:dd:ee:01".into(), "11:22:33:44:55:66".into()]);
/// let b = session_id(&["11:22:33:44:55:66".into(), "aa:bb:cc:dd:ee:01".into()]);
/// assert_eq!(a, b, "id does not depend on interface enumeration order");
/// ```
pub fn session_id(mac_addresses: &[String]) -> String {
    let mut sorted: Vec<&str> = mac_addresses.iter().map(String::as_str).collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    let mut hasher = Sha1::new();
    hasher.update(sorted.concat().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hardware addresses of every non-loopback interface an agent reported in
/// its `InfoReply`, in the order `session_id` expects to hash them (§4.6).
/// The loopback flag bit mirrors the one the agent sets when enumerating its
/// own interfaces.
const FLAG_LOOPBACK: u32 = 1 << 1;

pub fn non_loopback_macs(interfaces: &[NetInterface]) -> Vec<String> {
    interfaces
        .iter()
        .filter(|iface| iface.flags & FLAG_LOOPBACK == 0 && !iface.hardware_addr.is_empty())
        .map(|iface| iface.hardware_addr.clone())
        .collect()
}

/// The in-progress relay state for a session. Absent when the session is
/// connected but not relaying (§4.6 at-most-one-active-relay). `netstack` is
/// shared (not owned outright) because the packet-drain task spawned by
/// `start_relay`'s caller holds its own clone of the same `Arc` for the
/// lifetime of the relay.
pub struct Relay {
    pub netstack: Arc<NetStack>,
}

/// One connected (or previously-connected, now-restorable) agent.
///
/// The session does not own its `Multiplex` directly: `accept()`ing inbound
/// streams requires a long-lived `&mut Multiplex` across awaits, which is
/// incompatible with the registry's synchronous per-session lock (§5 "the
/// multiplex object is safe for concurrent stream open"). Instead the
/// connection task that owns the `Multiplex` keeps it locally and hands the
/// session a cheaply-cloneable [`Opener`], which every other task (RPC
/// handlers issuing `RedirectorRequest`, the packet-pipeline drain loop)
/// uses to open outbound streams without contending for that lock.
pub struct Session {
    pub id: String,
    pub alias: String,
    pub hostname: String,
    pub interfaces: Vec<NetInterface>,
    pub is_connected: bool,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub routes: Vec<Route>,
    pub redirectors: Vec<Redirector>,
    opener: Option<Opener>,
    relay: Option<Relay>,
}

impl Session {
    pub fn new(id: String, alias: String, hostname: String, interfaces: Vec<NetInterface>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            alias,
            hostname,
            interfaces,
            is_connected: true,
            first_seen: now,
            last_seen: now,
            routes: Vec::new(),
            redirectors: Vec::new(),
            opener: None,
            relay: None,
        }
    }

    pub fn is_relaying(&self) -> bool {
        self.relay.is_some()
    }

    /// The active relay's netstack handle, if this session is currently
    /// relaying. Used by route mutation handlers to re-apply the OS routing
    /// table without needing their own copy of the `Relay` internals.
    pub fn relay_netstack(&self) -> Option<Arc<NetStack>> {
        self.relay.as_ref().map(|relay| relay.netstack.clone())
    }

    /// Attach a fresh stream-opener on (re)connect and mark the session
    /// live. Any previously stored handle (a stale one kept only because the
    /// session record survived a disconnect) is dropped.
    pub fn attach(&mut self, opener: Opener) {
        self.opener = Some(opener);
        self.is_connected = true;
        self.last_seen = SystemTime::now();
    }

    /// Mark the session disconnected. Routes and redirectors are preserved
    /// so a later reconnect from the same host restores them (§4.6); any
    /// active relay is torn down since its tunnel device cannot outlive the
    /// multiplex connection.
    pub fn detach(&mut self) -> Option<Relay> {
        self.opener = None;
        self.is_connected = false;
        self.relay.take()
    }

    /// A clone of this session's stream-opener, for a caller that needs to
    /// open an outbound multiplex stream (e.g. a `RedirectorRequest`).
    /// `None` while disconnected.
    pub fn opener(&self) -> Option<Opener> {
        self.opener.clone()
    }

    pub fn touch(&mut self) {
        self.last_seen = SystemTime::now();
    }

    /// Begin relaying: idempotent when already relaying. The caller
    /// constructs the `NetStack` (it requires an async context and I/O this
    /// module does not own) and hands it in.
    pub fn start_relay(&mut self, netstack: Arc<NetStack>) {
        if self.relay.is_some() {
            return;
        }
        netstack.apply_routes(&self.routes);
        self.relay = Some(Relay { netstack });
    }

    /// Stop relaying: idempotent when not relaying. Returns the torn-down
    /// relay so the caller can call `NetStack::destroy`.
    pub fn stop_relay(&mut self) -> Option<Relay> {
        self.relay.take()
    }

    /// Add a route, rejecting one that overlaps an existing route on this
    /// session unless `force` is set. Registry-wide overlap checking across
    /// sessions is a separate concern (`registry::Registry::add_route`).
    pub fn add_route(&mut self, new_route: Route, force: bool) -> Result<(), Route> {
        if !force {
            if let Some(existing) = self
                .routes
                .iter()
                .find(|existing| route::overlaps(existing.cidr, new_route.cidr))
            {
                return Err(*existing);
            }
        }
        if !self.routes.iter().any(|r| r.cidr == new_route.cidr) {
            self.routes.push(new_route);
        }
        Ok(())
    }

    pub fn remove_route(&mut self, cidr: ipnet::IpNet) {
        self.routes.retain(|r| r.cidr != cidr);
    }

    /// Add a redirector; idempotent by id (re-adding the same proto/from/to
    /// triple is a no-op, matching the idempotence property expected of
    /// every mutating session operation).
    pub fn add_redirector(&mut self, redirector: Redirector) {
        if !self.redirectors.iter().any(|r| r.id == redirector.id) {
            self.redirectors.push(redirector);
        }
    }

    pub fn remove_redirector(&mut self, id: &str) {
        self.redirectors.retain(|r| r.id != id);
    }

    pub fn idle_for(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_seen)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interfaces() -> Vec<NetInterface> {
        vec![]
    }

    #[test]
    fn stop_relay_without_ever_starting_is_a_noop() {
        let mut session = Session::new("id".into(), "alias".into(), "host".into(), interfaces());
        assert!(!session.is_relaying());
        assert!(session.stop_relay().is_none());
    }

    #[test]
    fn add_route_rejects_overlap_without_force() {
        let mut session = Session::new("id".into(), "alias".into(), "host".into(), interfaces());
        let a: ipnet::IpNet = "10.0.0.0/16".parse().unwrap();
        let b: ipnet::IpNet = "10.0.1.0/24".parse().unwrap();

        session.add_route(Route::new(a, false), false).unwrap();
        assert!(session.add_route(Route::new(b, false), false).is_err());
        session.add_route(Route::new(b, false), true).unwrap();
        assert_eq!(session.routes.len(), 2);
    }

    #[test]
    fn add_route_is_idempotent_on_identical_cidr() {
        let mut session = Session::new("id".into(), "alias".into(), "host".into(), interfaces());
        let a: ipnet::IpNet = "10.0.0.0/16".parse().unwrap();
        session.add_route(Route::new(a, false), false).unwrap();
        session.add_route(Route::new(a, false), false).unwrap();
        assert_eq!(session.routes.len(), 1);
    }

    #[test]
    fn add_redirector_is_idempotent() {
        let mut session = Session::new("id".into(), "alias".into(), "host".into(), interfaces());
        let r = Redirector::new(codec::Transport::Tcp, "0.0.0.0:80".into(), "10.0.0.1:80".into());
        session.add_redirector(r.clone());
        session.add_redirector(r);
        assert_eq!(session.redirectors.len(), 1);
    }

    #[test]
    fn session_id_ignores_interface_enumeration_order() {
        let a = session_id(&["aa:bb:cc:dd:ee:01".into(), "11:22:33:44:55:66".into()]);
        let b = session_id(&["11:22:33:44:55:66".into(), "aa:bb:cc:dd:ee:01".into()]);
        assert_eq!(a, b);
    }
}
