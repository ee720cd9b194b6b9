use crate::cache::CacheStore;
use crate::error::AppError;
use crate::market::types::{now_unix_ms, DataOrigin, InstrumentRow, PatchKind, RowsWire};
use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const ROWS_CACHE_KEY: &str = "rest:rows";

/// Loads a full set of rows outside the push channel.
pub trait RowFetcher: Send + Sync + 'static {
    fn fetch_rows(&self) -> impl Future<Output = Result<Vec<InstrumentRow>, AppError>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestBodyWire {
    Envelope { data: RowsWire },
    Rows(RowsWire),
}

/// Parses a REST body into rows. Rows without any price are skipped.
pub fn parse_rows(payload: &mut [u8], received_at: i64) -> Result<Vec<InstrumentRow>, AppError> {
    let body: RestBodyWire = simd_json::serde::from_slice(payload)?;
    let rows = match body {
        RestBodyWire::Envelope { data } => data,
        RestBodyWire::Rows(rows) => rows,
    };

    let patches = rows.into_patches(PatchKind::FullReplace, received_at)?;
    Ok(patches.iter().filter_map(InstrumentRow::from_patch).collect())
}

#[derive(Debug, Clone)]
pub struct HttpRowFetcher {
    client: Client,
    endpoint: String,
}

impl HttpRowFetcher {
    pub fn new(client: Client, base_url: &str, path: &str) -> Self {
        Self {
            client,
            endpoint: join_endpoint(base_url, path),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn join_endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

impl RowFetcher for HttpRowFetcher {
    fn fetch_rows(&self) -> impl Future<Output = Result<Vec<InstrumentRow>, AppError>> + Send {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        async move {
            let response = client.get(&endpoint).send().await?.error_for_status()?;
            let mut owned_payload = response.bytes().await?.to_vec();
            parse_rows(owned_payload.as_mut_slice(), now_unix_ms())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub rows: Vec<InstrumentRow>,
    pub origin: DataOrigin,
}

/// REST rows behind the cache: fresh cache entries short-circuit the fetch,
/// and a failed fetch falls back to whatever the cache still holds.
pub struct CachedRowSource<F> {
    fetcher: F,
    cache: Arc<CacheStore<Vec<InstrumentRow>>>,
    ttl: Duration,
}

impl<F: RowFetcher> CachedRowSource<F> {
    pub fn new(fetcher: F, cache: Arc<CacheStore<Vec<InstrumentRow>>>, ttl: Duration) -> Self {
        Self {
            fetcher,
            cache,
            ttl,
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore<Vec<InstrumentRow>>> {
        &self.cache
    }

    pub async fn load(&self, force: bool) -> Result<FetchOutcome, AppError> {
        if !force {
            if let Some(rows) = self.cache.get(ROWS_CACHE_KEY).await {
                debug!(rows = rows.len(), "serving rows from cache");
                return Ok(FetchOutcome {
                    rows,
                    origin: DataOrigin::Cache,
                });
            }
        }

        match self.fetcher.fetch_rows().await {
            Ok(rows) => {
                if let Err(error) = self.cache.set(ROWS_CACHE_KEY, rows.clone(), self.ttl).await {
                    warn!(%error, "failed to cache fetched rows");
                }
                Ok(FetchOutcome {
                    rows,
                    origin: DataOrigin::Network,
                })
            }
            Err(error) => {
                warn!(%error, "row fetch failed");
                match self.cache.get(ROWS_CACHE_KEY).await {
                    Some(rows) => Ok(FetchOutcome {
                        rows,
                        origin: DataOrigin::CacheFallback,
                    }),
                    None => Err(error),
                }
            }
        }
    }
}
