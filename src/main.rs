use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use devlink::api;
use devlink::config::AppConfig;
use devlink::detector::{GrantedPermissions, StaticNetworkInfo};
use devlink::DeviceCore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_ansi(true)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config_content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path))?;
    let config: AppConfig = serde_json::from_str(&config_content)
        .with_context(|| "Failed to parse config")?;

    let core = Arc::new(DeviceCore::from_config(
        &config,
        Arc::new(StaticNetworkInfo::new(&config.network)),
        Arc::new(GrantedPermissions),
    )?);
    core.init();

    let core_for_api = Arc::clone(&core);
    let api_port = config.api_port;
    let dashboard_dir = config.dashboard_dir.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_server(api_port, &dashboard_dir, core_for_api).await {
            tracing::error!("API server failed: {:#}", e);
        }
    });

    signal::ctrl_c().await?;
    info!("Shutdown signal received. Tearing down device link...");
    core.teardown();

    Ok(())
}
