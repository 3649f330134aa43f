mod core;
mod features;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::core::config::ExecutorConfig;
use crate::features::images::ImagePreparer;
use crate::features::network::NetworkManager;
use crate::features::vms::lifecycle::VmmLifecycle;
use crate::features::vms::state::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ExecutorConfig>,
    pub images: Arc<ImagePreparer>,
    pub network: Arc<NetworkManager>,
    pub lifecycle: Arc<VmmLifecycle>,
    pub store: Arc<StateStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,executor=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(ExecutorConfig::from_env());
    crate::core::preflight::check(&config).log();
    if config.test_mode {
        tracing::warn!("test mode enabled, host network side effects are disabled");
    }
    for dir in [
        &config.state_dir,
        &config.cache_dir,
        &config.socket_dir,
        &config.log_dir,
    ] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let store = Arc::new(StateStore::open(&config.state_dir, &config.log_dir).await);
    let state = AppState {
        images: Arc::new(ImagePreparer::new(Arc::clone(&config))),
        network: Arc::new(NetworkManager::new(Arc::clone(&config))?),
        lifecycle: Arc::new(VmmLifecycle::new(Arc::clone(&config), Arc::clone(&store))),
        store,
        config: Arc::clone(&config),
    };

    state.lifecycle.recover().await;
    let _sweeper = features::images::spawn_sweeper(state.clone());

    let app = features::router(state);
    info!(bind = %config.bind, "executor listening");
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
