use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

const DEFAULT_DB_FILENAME: &str = "market-sync.db";
const DEFAULT_DATA_DIR: &str = ".market-sync";

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_db_filename() -> String {
    env_value("MARKET_SYNC_DB_FILENAME").unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

fn resolve_db_path() -> Result<PathBuf, AppError> {
    let mut base_dir = env_value("MARKET_SYNC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&base_dir)?;
    base_dir.push(resolve_db_filename());
    Ok(base_dir)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool() -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path()?;
    tracing::info!(path = %db_path.display(), "opening cache database");
    initialize_pool_from_path(&db_path).await
}


#[cfg(test)]
mod tests {
    use super::test_support::unique_db_path;
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db_path = unique_db_path();

        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        let metadata_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM app_metadata")
            .fetch_one(&pool)
            .await
            .expect("app_metadata table must exist and be queryable");
        assert_eq!(metadata_rows, 1);

        let cache_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&pool)
            .await
            .expect("cache_entries table must exist and be queryable");
        assert_eq!(cache_rows, 0);

        drop(pool);
        let _ = std::fs::remove_file(db_path);
    }
}
