//! Process entrypoint: load configuration, assemble the core, run until
//! interrupted.

use anyhow::Result;
use orchestrator::{Config, Core};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::var("CHAINFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));
    let config = Config::load(Some(&config_path))?;
    info!(config = %serde_json::to_string(&config.redacted())?, "configuration loaded");

    let core = Core::new(config)?;
    core.start().await;
    info!("chainflow running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    core.stop().await;
    Ok(())
}
