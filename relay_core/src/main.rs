use relay_core::config::RelayConfig;
use relay_core::llm::upstream::HyperUpstream;
use relay_core::web::{self, AppState};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(RelayConfig::load()?);
    info!(
        "relaying to {} with {} retries",
        config.upstream.url, config.max_retries
    );
    let transport = Arc::new(HyperUpstream::new(&config.upstream)?);

    web::serve(AppState::new(config, transport)).await
}
