use crate::cache::CacheStats;
use crate::market::types::ConnectionStatus;
use crate::state::AppState;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub connection: &'static str,
    pub connection_reason: Option<String>,
    pub cache: CacheStats,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    connection: &ConnectionStatus,
    cache: CacheStats,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };
    let status = if db_status == "ok" && !connection.state.is_faulted() {
        "ok"
    } else {
        "degraded"
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        connection: connection.state.as_str(),
        connection_reason: connection.reason.clone(),
        cache,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    build_health_response(
        state.started_at,
        &state.db_pool,
        &state.market_sync.status(),
        state.row_cache.stats(),
    )
    .await
}
