//! Serve health, metrics and profiling endpoints for the running process.
use envconfig::Envconfig;
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use diag_server::config::Config;
use diag_server::shutdown::graceful_shutdown;
use diag_server::Server;

profiler::used_with_profiling!();

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env()?;
    let server = Server::from_config(&config);

    let root = CancellationToken::new();
    let signal_token = root.clone();
    tokio::spawn(async move {
        graceful_shutdown().await;
        signal_token.cancel();
    });

    server.start(root).await?;

    Ok(())
}
