//! Redirector subsystem (§4.8). A redirector binds a listener on the agent
//! and, for each accepted connection, dials `to` fresh and splices the two.
//! Ported from the reference implementation's `relay.Redirector`, which
//! binds at construction and exposes a blocking `ListenAndRelay` accept
//! loop; here the bind/accept loop is a spawned task owned by the session.

use sha1::{Digest, Sha1};

use codec::Transport;

/// Deterministic redirector identity: hex-encoded SHA-1 over
/// `"<proto>|<from>|<to>"`, matching the reference implementation's id
/// derivation so redirectors restore to the same id across reconnects.
pub fn redirector_id(proto: Transport, from: &str, to: &str) -> String {
    let proto_str = match proto {
        Transport::Tcp => "tcp",
        Transport::Udp => "udp",
    };

    let mut hasher = Sha1::new();
    hasher.update(proto_str.as_bytes());
    hasher.update(b"|");
    hasher.update(from.as_bytes());
    hasher.update(b"|");
    hasher.update(to.as_bytes());

    hex::encode(hasher.finalize())
}

/// A bound redirector: `from` is the agent-side listen address, `to` is the
/// address dialed fresh for every accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Redirector {
    pub id: String,
    pub proto: Transport,
    pub from: String,
    pub to: String,
}

impl Redirector {
    pub fn new(proto: Transport, from: String, to: String) -> Self {
        let id = redirector_id(proto, &from, &to);
        Self { id, proto, from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_pure_function_of_its_fields() {
        let a = Redirector::new(Transport::Tcp, "0.0.0.0:8080".into(), "127.0.0.1:80".into());
        let b = Redirector::new(Transport::Tcp, "0.0.0.0:8080".into(), "127.0.0.1:80".into());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn id_distinguishes_transport() {
        let tcp = redirector_id(Transport::Tcp, "0.0.0.0:53", "1.1.1.1:53");
        let udp = redirector_id(Transport::Udp, "0.0.0.0:53", "1.1.1.1:53");
        assert_ne!(tcp, udp);
    }

    #[test]
    fn id_distinguishes_endpoints() {
        let a = redirector_id(Transport::Tcp, "0.0.0.0:80", "10.0.0.1:80");
        let b = redirector_id(Transport::Tcp, "0.0.0.0:80", "10.0.0.2:80");
        assert_ne!(a, b);
    }
}
