use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("market_sync=info")),
        )
        .init();

    if let Err(error) = market_sync::run().await {
        tracing::error!(%error, "market sync exited with an error");
        std::process::exit(1);
    }
}
