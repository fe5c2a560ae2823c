use aggregator::client::{parse_target, reading_from_file, Client};
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: content-server <target> <file> [source-id]";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let target = std::env::args().nth(1).ok_or_else(|| anyhow::anyhow!(USAGE))?;
    let path = std::env::args().nth(2).ok_or_else(|| anyhow::anyhow!(USAGE))?;
    let source_id = std::env::args()
        .nth(3)
        .unwrap_or_else(|| "content-server-1".into());

    let body = reading_from_file(&path).await?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if ctrl_c().await.is_ok() {
                cancel.cancel()
            }
        }
    });
    let client = Client::new(&parse_target(&target)?, source_id)?.with_cancel(cancel);
    let response = client.put(&body).await?;
    println!("HTTP {}", response.status);
    if !response.body.is_empty() {
        println!("{}", String::from_utf8_lossy(&response.body))
    }
    Ok(())
}
