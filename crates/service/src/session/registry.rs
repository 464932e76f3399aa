//! Session Registry & Route-Overlap Index (§4.7): all currently-known
//! sessions, keyed by the stable per-host id from [`super::session_id`].
//! Existence checks are O(1); route-overlap checks scan the live session
//! set, which the reference implementation's `internal/session/manager.go`
//! does the same way (a plain map iteration) since the expected session
//! count is small (tens, not millions).

use ahash::{HashMap, HashMapExt};
use ipnet::IpNet;
use parking_lot::RwLock;

use crate::route::{self, Route};
use crate::session::Session;

/// A route that would collide with one already present on another session.
#[derive(Debug, Clone, Copy)]
pub struct RouteConflict<'a> {
    pub owner: &'a str,
    pub existing: Route,
}

#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Insert a freshly-connected session, or restore alias/routes/
    /// redirectors onto a matching pre-existing (now reconnecting) record if
    /// one exists for this id, per §4.6's reconnect rule. A saved record
    /// that is still marked connected means the new connection is a
    /// duplicate of a session that never actually disconnected (e.g. a
    /// stale multiplex the registry hasn't noticed dying yet) and is
    /// rejected outright, leaving the existing record untouched.
    pub fn upsert(&self, mut incoming: Session) -> Result<UpsertOutcome, Session> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&incoming.id) {
            Some(existing) if existing.is_connected => Err(incoming),
            Some(existing) => {
                incoming.alias = existing.alias.clone();
                incoming.routes = existing.routes.clone();
                incoming.redirectors = existing.redirectors.clone();
                incoming.first_seen = existing.first_seen;
                let was_relaying = existing.is_relaying();
                *existing = incoming;
                Ok(UpsertOutcome::Restored { was_relaying })
            }
            None => {
                sessions.insert(incoming.id.clone(), incoming);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.write().remove(id)
    }

    pub fn with<R>(&self, id: &str, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.sessions.read().get(id).map(f)
    }

    pub fn with_mut<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.write().get_mut(id).map(f)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check `cidr` against every route on every session other than `owner`.
    /// Returns the first conflicting (session id, route) pair found.
    pub fn find_overlap(&self, owner: &str, cidr: IpNet) -> Option<(String, Route)> {
        let sessions = self.sessions.read();
        for (id, session) in sessions.iter() {
            if id == owner {
                continue;
            }
            if let Some(existing) = session.routes.iter().find(|r| route::overlaps(r.cidr, cidr)) {
                return Some((id.clone(), *existing));
            }
        }
        None
    }

    /// Add a route to `owner`'s session, rejecting it if it overlaps a
    /// route on any other session, unless `force` is set (§4.7).
    pub fn add_route(&self, owner: &str, new_route: Route, force: bool) -> Result<(), RouteAddError> {
        if !force {
            if let Some((other, existing)) = self.find_overlap(owner, new_route.cidr) {
                return Err(RouteAddError::Overlap { owner: other, existing });
            }
        }

        self.sessions
            .write()
            .get_mut(owner)
            .ok_or(RouteAddError::NotFound)?
            .add_route(new_route, true)
            .expect("force=true never rejects");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum RouteAddError {
    NotFound,
    Overlap { owner: String, existing: Route },
}

/// What `Registry::upsert` did with the incoming session record.
#[derive(Debug, Clone, Copy)]
pub enum UpsertOutcome {
    Inserted,
    /// A disconnected record for this id existed and was replaced; its
    /// routes/redirectors were copied onto the new record. `was_relaying`
    /// is the saved desire the caller must honor by calling `start_relay`.
    Restored { was_relaying: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::NetInterface;

    fn session(id: &str) -> Session {
        Session::new(id.to_string(), id.to_string(), "host".into(), Vec::<NetInterface>::new())
    }

    #[test]
    fn upsert_restores_routes_on_reconnect() {
        let registry = Registry::new();
        registry.upsert(session("a")).unwrap();
        registry
            .add_route("a", Route::new("10.0.0.0/8".parse().unwrap(), false), false)
            .unwrap();
        // Simulate disconnect: a live record is never eligible for restore.
        registry.with_mut("a", |s| s.detach());

        let outcome = registry.upsert(session("a")).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Restored { .. }));
        registry.with("a", |s| assert_eq!(s.routes.len(), 1)).unwrap();
    }

    #[test]
    fn upsert_rejects_duplicate_of_a_still_connected_session() {
        let registry = Registry::new();
        registry.upsert(session("a")).unwrap();

        let result = registry.upsert(session("a"));
        assert!(result.is_err());
    }

    #[test]
    fn add_route_rejects_overlap_across_sessions() {
        let registry = Registry::new();
        registry.upsert(session("a")).unwrap();
        registry.upsert(session("b")).unwrap();

        registry
            .add_route("a", Route::new("10.0.0.0/16".parse().unwrap(), false), false)
            .unwrap();

        let result = registry.add_route("b", Route::new("10.0.1.0/24".parse().unwrap(), false), false);
        assert!(matches!(result, Err(RouteAddError::Overlap { .. })));
    }

    #[test]
    fn add_route_force_overrides_overlap() {
        let registry = Registry::new();
        registry.upsert(session("a")).unwrap();
        registry.upsert(session("b")).unwrap();

        registry
            .add_route("a", Route::new("10.0.0.0/16".parse().unwrap(), false), false)
            .unwrap();
        registry
            .add_route("b", Route::new("10.0.1.0/24".parse().unwrap(), false), true)
            .unwrap();
    }

    #[test]
    fn remove_then_contains_is_false() {
        let registry = Registry::new();
        registry.upsert(session("a")).unwrap();
        assert!(registry.contains("a"));
        registry.remove("a");
        assert!(!registry.contains("a"));
    }
}
