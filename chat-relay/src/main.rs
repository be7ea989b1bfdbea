use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{Coordinator, cli::Cli};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config();
    let coordinator = Coordinator::bind(config).await?;
    let addr = coordinator
        .local_addr()
        .context("failed to read listening address")?;
    info!("relay listening on {}", addr);

    if let Err(err) = coordinator.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err.into());
    }

    Ok(())
}
