use crate::cache::CacheStore;
use crate::market::types::InstrumentRow;
use crate::service::LiveMarketSync;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub row_cache: Arc<CacheStore<Vec<InstrumentRow>>>,
    pub market_sync: LiveMarketSync,
}

impl AppState {
    pub fn new(
        db_pool: SqlitePool,
        row_cache: Arc<CacheStore<Vec<InstrumentRow>>>,
        market_sync: LiveMarketSync,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            row_cache,
            market_sync,
        }
    }
}
