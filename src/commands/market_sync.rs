use crate::connection::Connector;
use crate::error::AppError;
use crate::market::rest::RowFetcher;
use crate::market::types::{ConnectionStatus, RefreshSummary, SyncView};
use crate::service::MarketSync;
use tracing::info;

pub fn market_sync_view<C: Connector, F: RowFetcher>(sync: &MarketSync<C, F>) -> SyncView {
    sync.view()
}

/// Drops the current push channel, resets the backoff and dials again. Also
/// the way out of the `failed` state.
pub async fn market_sync_reconnect<C: Connector, F: RowFetcher>(
    sync: &MarketSync<C, F>,
) -> ConnectionStatus {
    sync.reconnect().await;
    sync.status()
}

pub async fn market_sync_refresh<C: Connector, F: RowFetcher>(
    sync: &MarketSync<C, F>,
) -> Result<RefreshSummary, AppError> {
    let summary = sync.refresh().await?;
    info!(rows = summary.rows, origin = ?summary.origin, "manual refresh finished");
    Ok(summary)
}
