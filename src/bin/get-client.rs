use aggregator::client::{parse_target, render, Client};
use axum::http::StatusCode;
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let target = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: get-client <target> [entity-id]"))?;
    let filter = std::env::args().nth(2);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if ctrl_c().await.is_ok() {
                cancel.cancel()
            }
        }
    });
    let client = Client::new(&parse_target(&target)?, "get-client")?.with_cancel(cancel);
    let response = client.get().await?;
    if response.status != StatusCode::OK {
        println!("HTTP {}", response.status);
        println!("{}", String::from_utf8_lossy(&response.body));
        return Ok(());
    }
    print!("{}", render(&response.body, filter.as_deref())?);
    Ok(())
}
