#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use clap::Parser;
use ligolo_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::parse());
    simple_logger::init_with_level(config.level().to_level().unwrap_or(log::Level::Info))?;

    if config.unpack {
        log::error!("agent-binary generation is not available on this server build");
        return Ok(());
    }

    ligolo_server::startup(config).await
}
