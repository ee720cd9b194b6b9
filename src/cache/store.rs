use crate::cache::durable::SqliteDurableCache;
use crate::cache::memory::{CacheStats, MemoryCache};
use crate::error::AppError;
use crate::market::types::now_unix_ms;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_DURABLE_THRESHOLD_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub capacity: usize,
    pub sweep_interval: Duration,
    /// Entries whose TTL exceeds this are mirrored to the durable tier.
    pub durable_threshold: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            durable_threshold: Duration::from_millis(DEFAULT_DURABLE_THRESHOLD_MS),
        }
    }
}

/// Two-tier cache: a bounded in-process map in front of an optional durable
/// mirror. Constructed explicitly and shared by handle; there is no global
/// instance.
///
/// Must be created inside a tokio runtime because the periodic sweep runs on
/// its own task. The task stops on [`CacheStore::shutdown`] or when the store
/// is dropped.
pub struct CacheStore<V> {
    memory: Arc<Mutex<MemoryCache<V>>>,
    durable: Option<SqliteDurableCache>,
    durable_threshold: Duration,
    sweeper: CancellationToken,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(options: CacheOptions, durable: Option<SqliteDurableCache>) -> Self {
        let memory = Arc::new(Mutex::new(MemoryCache::new(options.capacity)));
        let sweeper = CancellationToken::new();

        spawn_sweeper(
            Arc::clone(&memory),
            durable.clone(),
            options.sweep_interval,
            sweeper.clone(),
        );

        Self {
            memory,
            durable,
            durable_threshold: options.durable_threshold,
            sweeper,
        }
    }

    pub fn in_memory(options: CacheOptions) -> Self {
        Self::new(options, None)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.memory.lock().get(key, Instant::now()) {
            return Some(value);
        }

        let durable = self.durable.as_ref()?;
        let now_ms = now_unix_ms();
        let hit = match durable.load::<V>(key, now_ms).await {
            Ok(hit) => hit?,
            Err(error) => {
                warn!(key, %error, "durable cache read failed");
                return None;
            }
        };

        let remaining = hit.remaining(now_ms)?;
        let evicted = self
            .memory
            .lock()
            .insert(key, hit.value.clone(), remaining, Instant::now());
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "evicted least recently used cache entry");
        }
        Some(hit.value)
    }

    /// Short-lived values stay in memory only; any durable copy left by an
    /// earlier long-lived `set` of the same key is dropped.
    pub async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), AppError> {
        let mirror = (ttl > self.durable_threshold).then(|| value.clone());

        let evicted = self.memory.lock().insert(key, value, ttl, Instant::now());
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "evicted least recently used cache entry");
        }

        let Some(durable) = &self.durable else {
            return Ok(());
        };
        match mirror {
            Some(value) => durable.store(key, &value, ttl, now_unix_ms()).await?,
            None => {
                if durable.remove(key).await? {
                    debug!(key, "dropped stale durable copy");
                }
            }
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<bool, AppError> {
        let mut removed = self.memory.lock().remove(key);
        if let Some(durable) = &self.durable {
            removed |= durable.remove(key).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        self.memory.lock().clear();
        if let Some(durable) = &self.durable {
            durable.clear().await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.memory.lock().stats()
    }

    /// Runs one sweep of the memory tier immediately.
    pub fn sweep(&self) -> usize {
        self.memory.lock().sweep(Instant::now())
    }

    pub fn shutdown(&self) {
        self.sweeper.cancel();
    }
}

impl<V> Drop for CacheStore<V> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

fn spawn_sweeper<V>(
    memory: Arc<Mutex<MemoryCache<V>>>,
    durable: Option<SqliteDurableCache>,
    period: Duration,
    cancel_token: CancellationToken,
) where
    V: Clone + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = memory.lock().sweep(Instant::now());
                    if expired > 0 {
                        debug!(expired, "swept expired cache entries");
                    }

                    if let Some(durable) = &durable {
                        if let Err(error) = durable.purge_expired(now_unix_ms()).await {
                            warn!(%error, "durable cache sweep failed");
                        }
                    }
                }
            }
        }
    });
}
