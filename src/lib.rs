pub mod cache;
pub mod commands;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod market;
pub mod service;
pub mod state;

use cache::{CacheStore, SqliteDurableCache};
use commands::health::health;
use config::SyncArgs;
use connection::WsConnector;
use db::initialize_pool;
use error::AppError;
use market::rest::HttpRowFetcher;
use service::MarketSync;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REST_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the sync core until ctrl-c, logging every change of the view.
pub async fn run() -> Result<(), AppError> {
    let config = SyncArgs::from_env()?.normalize()?;
    let db_pool = initialize_pool().await?;

    let durable = SqliteDurableCache::new(db_pool.clone(), config.cache_namespace.clone());
    let row_cache = Arc::new(CacheStore::new(config.cache_options(), Some(durable)));

    let client = reqwest::Client::builder()
        .timeout(REST_REQUEST_TIMEOUT)
        .build()?;
    let fetcher = HttpRowFetcher::new(client, &config.rest_base_url, &config.rest_path);
    let market_sync = MarketSync::start(
        &config,
        WsConnector::new(),
        fetcher,
        Arc::clone(&row_cache),
    )
    .await;
    let state = AppState::new(db_pool, row_cache, market_sync);

    let mut view = state.market_sync.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                info!(
                    state = current.status.state.as_str(),
                    rows = current.rows.len(),
                    origin = ?current.origin,
                    error = current.error.as_deref().unwrap_or(""),
                    "view updated"
                );
            }
        }
    }

    let report = health(&state).await;
    info!(
        uptime_ms = report.uptime_ms as u64,
        hits = report.cache.hits,
        misses = report.cache.misses,
        "shutting down"
    );
    state.market_sync.shutdown().await;
    state.db_pool.close().await;
    Ok(())
}
