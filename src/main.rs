use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use droplink::broker::CodeBroker;
use droplink::config;
use droplink::http_share::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (for UPLOAD_DIR etc.)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let port = config::get_http_port();
    let upload_dir = config::get_upload_dir();
    tokio::fs::create_dir_all(&upload_dir).await?;
    tracing::info!(upload_dir = %upload_dir.display(), "upload directory ready");

    let state = Arc::new(AppState {
        broker: Arc::new(CodeBroker::new()),
        upload_dir,
        base_url: config::get_base_url(port),
    });

    let cancel_token = CancellationToken::new();
    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    http_share::start_http_server(addr, state, Some(cancel_token)).await
}
