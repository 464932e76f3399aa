//! Shared application state (§10): the session registry, the persisted
//! store, and the CA/CRL used to authenticate both listeners. One instance
//! is built once in `startup` and handed to both the agent-facing listener
//! (`server`) and the operator gRPC service (`rpc`).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use codec::NetInterface;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use service::redirector::Redirector;
use service::route::Route;
use service::session::registry::Registry;

use crate::config::Config;
use crate::pki::{Certificate, Crl};
use crate::storage::{Store, Table};

/// Persisted shape of a session record (§10): everything about a `Session`
/// except the live multiplex handle and relay, which cannot outlive one
/// connection. Reconstructed into a fresh disconnected `Session` on startup
/// so a reconnecting agent has something to restore onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub alias: String,
    pub hostname: String,
    pub interfaces: Vec<NetInterface>,
    pub routes: Vec<Route>,
    pub redirectors: Vec<Redirector>,
    pub is_relaying: bool,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Persisted shape of an operator identity (§10, §11): name, admin flag, and
/// the mTLS client certificate issued to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub name: String,
    pub is_admin: bool,
    pub certificate: Certificate,
}

pub fn unix_time(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Everything both listeners need: the live session registry, the persisted
/// tables, and the CA/CRL pair used to build every `TlsAcceptor`.
pub struct State {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub store: Store,
    pub sessions: Table<SessionRecord>,
    pub operators: Table<OperatorRecord>,
    pub ca: Certificate,
    /// This server's own mTLS identity, signed by `ca`, presented on both
    /// the agent-facing and operator-facing listeners.
    pub identity: Certificate,
    pub crl: RwLock<Crl>,
    crl_table: Table<Crl>,
}

impl State {
    pub async fn open(config: Arc<Config>) -> anyhow::Result<Self> {
        let store = Store::open(&config.database_path()).await?;
        let ca_table: Table<Certificate> = store.table("ca").await?;
        let sessions = store.table("sessions").await?;
        let operators = store.table("operators").await?;
        let crl_table: Table<Crl> = store.table("crl").await?;

        let ca = match ca_table.get("ca").await? {
            Some(ca) => ca,
            None => {
                let ca = crate::pki::generate_ca()?;
                ca_table.set("ca", &ca).await?;
                ca
            }
        };

        let identity_table: Table<Certificate> = store.table("identity").await?;
        let identity = match identity_table.get("server").await? {
            Some(identity) => identity,
            None => {
                let identity = crate::pki::issue(&ca, "server")?;
                identity_table.set("server", &identity).await?;
                identity
            }
        };

        let crl = crl_table.get("crl").await?.unwrap_or_default();
        let registry = Arc::new(Registry::new());

        let state = Self {
            config,
            registry,
            store,
            sessions,
            operators,
            ca,
            identity,
            crl: RwLock::new(crl),
            crl_table,
        };
        state.restore_sessions().await?;
        state.bootstrap_root_operator().await?;
        Ok(state)
    }

    /// First run has no operator that could ever call the admin-gated
    /// `AddOperator`/`RemoveOperator` RPCs, so if the operators table is
    /// still empty, issue one named "root" with `is_admin` set. Its
    /// certificate is printed to the log once, at the level an operator
    /// running this for the first time will actually see it; there is no
    /// other channel to hand it over since this server has no separate
    /// bootstrap/admin CLI (§11 Open Question, resolved in favor of
    /// self-provisioning over a manual out-of-band step).
    async fn bootstrap_root_operator(&self) -> anyhow::Result<()> {
        if !self.operators.get_all().await?.is_empty() {
            return Ok(());
        }

        let certificate = crate::pki::issue(&self.ca, "root")?;
        let record = OperatorRecord { name: "root".to_string(), is_admin: true, certificate: certificate.clone() };
        self.operators.set("root", &record).await?;

        log::info!(
            "bootstrapped initial admin operator \"root\" (thumbprint {}); its client certificate is issued below \
             and will not be printed again",
            certificate.thumbprint
        );
        log::info!("root operator certificate:\n{}", certificate.certificate_pem());
        log::info!("root operator key:\n{}", certificate.key_pem());

        Ok(())
    }

    /// Revoke `thumbprint` and persist the updated CRL immediately (§10,
    /// §11): every mTLS accept on both listeners consults this.
    pub async fn revoke(&self, thumbprint: String, reason: String) -> anyhow::Result<()> {
        let snapshot = {
            let mut crl = self.crl.write();
            crl.revoke(thumbprint, reason);
            crl.clone()
        };
        self.crl_table.set("crl", &snapshot).await?;
        Ok(())
    }

    /// Load every persisted session record as a disconnected session in the
    /// registry, so a reconnecting agent has a record to restore onto (§4.6)
    /// even across a server restart.
    async fn restore_sessions(&self) -> anyhow::Result<()> {
        for record in self.sessions.get_all().await? {
            let mut session =
                service::session::Session::new(record.id.clone(), record.alias, record.hostname, record.interfaces);
            session.routes = record.routes;
            session.redirectors = record.redirectors;
            // Session::new marks itself connected; a record loaded from
            // storage at startup never is until its agent reconnects.
            session.detach();
            let _ = self.registry.upsert(session);
        }
        Ok(())
    }

    /// Persist the current state of `id`, if it still exists. Called after
    /// every mutation so a restart (or the in-memory registry losing a
    /// disconnected session) never loses routes/redirectors/relay-desire.
    pub async fn persist_session(&self, id: &str) -> anyhow::Result<()> {
        let Some(record) = self.registry.with(id, |session| SessionRecord {
            id: session.id.clone(),
            alias: session.alias.clone(),
            hostname: session.hostname.clone(),
            interfaces: session.interfaces.clone(),
            routes: session.routes.clone(),
            redirectors: session.redirectors.clone(),
            is_relaying: session.is_relaying(),
            first_seen: unix_time(session.first_seen),
            last_seen: unix_time(session.last_seen),
        }) else {
            return Ok(());
        };
        self.sessions.set(id, &record).await?;
        Ok(())
    }
}
