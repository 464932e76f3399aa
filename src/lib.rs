pub mod config;
pub mod events;
pub mod pki;
#[cfg(feature = "rpc")]
pub mod rpc;
pub mod server;
pub mod state;
pub mod storage;
pub mod tls;

use std::sync::Arc;

use self::config::Config;
use self::state::State;

/// Open shared state and run the agent-facing and operator-facing listeners
/// concurrently for the lifetime of the process. Either listener dying ends
/// the other: a server that can no longer take new agents, or one whose
/// control plane has gone deaf, is not worth keeping half-alive.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let state = Arc::new(State::open(config).await?);

    #[cfg(feature = "rpc")]
    tokio::try_join!(server::run(state.clone()), rpc::run(state.clone()))?;

    #[cfg(not(feature = "rpc"))]
    server::run(state).await?;

    Ok(())
}
