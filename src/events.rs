//! Lifecycle event bus (§9 design note: "single producer channel with
//! fan-out subscribers"). Adapted from the reference implementation's
//! `api::events` module, which does the same thing for an SSE endpoint;
//! here the sole subscriber-facing surface is the operator RPC's
//! `EventStream`, so the fan-out is a `tokio::sync::broadcast` channel of
//! our own `Event` type instead of an `axum::sse::Event`.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast::{self, Sender};
use tokio_stream::wrappers::BroadcastStream;

/// One lifecycle notification: a session connected/disconnected, a relay
/// started/stopped, a redirector was added/removed. `kind` is a short tag
/// ("session.connected", "relay.started", ...) rather than a closed enum so
/// new kinds can be added without touching the wire schema (§6's `Event`
/// message carries `kind` as a free-form string for the same reason).
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: i64,
    pub kind: String,
    pub session_id: String,
    pub detail: String,
}

impl Event {
    pub fn new(kind: impl Into<String>, session_id: impl Into<String>, detail: impl Into<String>) -> Self {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        Self { timestamp, kind: kind.into(), session_id: session_id.into(), detail: detail.into() }
    }
}

static CHANNEL: LazyLock<Sender<Event>> = LazyLock::new(|| broadcast::channel(256).0);

/// Publish an event to every current subscriber. Cheap no-op when nobody is
/// listening (`EventStream` has no active caller).
pub fn publish(event: Event) {
    let _ = CHANNEL.send(event);
}

/// Subscribe to the event bus, for the operator RPC's `EventStream` handler.
pub fn subscribe() -> BroadcastStream<Event> {
    BroadcastStream::new(CHANNEL.subscribe())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let mut stream = subscribe();
        publish(Event::new("session.connected", "abc123", "agent-1"));

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.kind, "session.connected");
        assert_eq!(received.session_id, "abc123");
    }
}
