use aggregator::{config::ServerConfig, server::serve};
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = ServerConfig::from_args(std::env::args().skip(1))?;
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match ctrl_c().await {
                Ok(()) => shutdown.cancel(),
                Err(err) => warn!("listen for ctrl-c: {err}"),
            }
        }
    });
    serve(config, shutdown).await
}
