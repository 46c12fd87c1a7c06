//! `visage-server`: the HTTP API for the avatar session.
//!
//! Serves token issuance, avatar creation, image enhancement/generation, and
//! the state bag the voice-agent backend polls. Configuration comes from
//! `config.toml` in the app config directory (or a path given as the first
//! argument).

use std::sync::Arc;
use visage::api::ApiContext;
use visage::config::SessionConfig;
use visage::services::avatar_api::AvatarApiClient;
use visage::services::image_api::ImageApiClient;
use visage::state_store::FileStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(SessionConfig::default_config_path);
    let config = if config_path.is_file() {
        SessionConfig::from_file(&config_path)?
    } else {
        tracing::info!(path = %config_path.display(), "no config file, using defaults");
        SessionConfig::default()
    };

    let store = Arc::new(FileStateStore::at_default_path());
    let avatar = AvatarApiClient::from_config(&config.avatar)?;
    let images = ImageApiClient::from_config(&config.image)?;

    let bind_addr = config.api.bind_addr.clone();
    let context = Arc::new(ApiContext::new(config, store, avatar, images));

    let (addr, server) = visage::api::serve(context, &bind_addr).await?;
    tracing::info!(%addr, "visage-server ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.abort();
    Ok(())
}
