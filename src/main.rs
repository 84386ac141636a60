use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use grafana_collector::config::CollectorConfig;
use grafana_collector::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("grafana_collector=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("COLLECTOR_CONFIG").unwrap_or_else(|_| "./collector.toml".to_string());
    let mut config = CollectorConfig::load(&config_path)?;
    if let Ok(url) = std::env::var("GRAFANA_URL") {
        config.grafana.base_url = url;
    }
    tracing::info!("using grafana at {}", config.grafana.base_url);

    let tmp_root = PathBuf::from(std::env::var("COLLECTOR_TMP_DIR").unwrap_or_else(|_| "./tmp".to_string()));
    tokio::fs::create_dir_all(&tmp_root).await?;

    let state = AppState {
        http: reqwest::Client::new(),
        config: Arc::new(config),
        tmp_root,
    };

    let addr: SocketAddr = std::env::var("COLLECTOR_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8686".to_string())
        .parse()?;
    tracing::info!("grafana-collector listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
