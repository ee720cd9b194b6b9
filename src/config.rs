use crate::cache::CacheOptions;
use crate::connection::ConnectionSettings;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_REST_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_REST_PATH: &str = "/api/prices";
pub const DEFAULT_CACHE_NAMESPACE: &str = "market_sync";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_PENDING_PATCHES: usize = 500;
pub const DEFAULT_CACHE_CAPACITY: usize = crate::cache::store::DEFAULT_CACHE_CAPACITY;
pub const DEFAULT_CACHE_SWEEP_INTERVAL_MS: u64 = crate::cache::store::DEFAULT_SWEEP_INTERVAL_MS;
pub const DEFAULT_DURABLE_TTL_THRESHOLD_MS: u64 =
    crate::cache::store::DEFAULT_DURABLE_THRESHOLD_MS;
pub const DEFAULT_REST_CACHE_TTL_MS: u64 = 30_000;
pub const DEFAULT_FALLBACK_POLL_INTERVAL_MS: u64 = 15_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
pub const MIN_PING_INTERVAL_MS: u64 = 1_000;
pub const MAX_PING_INTERVAL_MS: u64 = 300_000;
pub const MIN_BACKOFF_BASE_MS: u64 = 100;
pub const MAX_BACKOFF_BASE_MS: u64 = 60_000;
pub const MAX_BACKOFF_MAX_MS: u64 = 600_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 1_000;
pub const MIN_EMIT_INTERVAL_MS: u64 = 8;
pub const MAX_EMIT_INTERVAL_MS: u64 = 1_000;
pub const MIN_MAX_PENDING_PATCHES: usize = 1;
pub const MAX_MAX_PENDING_PATCHES: usize = 100_000;
pub const MIN_CACHE_CAPACITY: usize = 1;
pub const MAX_CACHE_CAPACITY: usize = 100_000;
pub const MIN_CACHE_SWEEP_INTERVAL_MS: u64 = 1_000;
pub const MAX_CACHE_SWEEP_INTERVAL_MS: u64 = 3_600_000;
pub const MIN_FALLBACK_POLL_INTERVAL_MS: u64 = 1_000;

const ENV_PREFIX: &str = "MARKET_SYNC_";

/// Optional overrides; anything left unset takes its `DEFAULT_*` value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncArgs {
    pub ws_url: Option<String>,
    pub rest_base_url: Option<String>,
    pub rest_path: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub emit_interval_ms: Option<u64>,
    pub max_pending_patches: Option<usize>,
    pub cache_capacity: Option<usize>,
    pub cache_sweep_interval_ms: Option<u64>,
    pub durable_ttl_threshold_ms: Option<u64>,
    pub rest_cache_ttl_ms: Option<u64>,
    pub fallback_poll_interval_ms: Option<u64>,
    pub cache_namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub ws_url: String,
    pub rest_base_url: String,
    pub rest_path: String,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub emit_interval_ms: u64,
    pub max_pending_patches: usize,
    pub cache_capacity: usize,
    pub cache_sweep_interval_ms: u64,
    pub durable_ttl_threshold_ms: u64,
    pub rest_cache_ttl_ms: u64,
    /// Zero disables polling while the push channel is down.
    pub fallback_poll_interval_ms: u64,
    pub cache_namespace: String,
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    field: &str,
) -> Result<Option<T>, AppError> {
    let name = format!("{ENV_PREFIX}{field}");
    let Some(raw) = lookup(&name) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| AppError::InvalidArgument(format!("{name} has an invalid value '{raw}'")))
}

fn require_range<T>(name: &str, value: T, min: T, max: T) -> Result<T, AppError>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

fn require_text(name: &str, value: Option<String>, default: &str) -> Result<String, AppError> {
    let value = value
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| default.to_string());
    if value.is_empty() {
        return Err(AppError::InvalidArgument(format!("{name} must not be empty")));
    }
    Ok(value)
}

fn require_url(name: &str, value: Option<String>, default: &str, schemes: &[&str]) -> Result<String, AppError> {
    let value = require_text(name, value, default)?;
    if !schemes
        .iter()
        .any(|scheme| value.starts_with(&format!("{scheme}://")))
    {
        return Err(AppError::InvalidArgument(format!(
            "{name} must use one of: {}",
            schemes.join(", ")
        )));
    }
    Ok(value)
}

impl SyncArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        Ok(Self {
            ws_url: lookup(&format!("{ENV_PREFIX}WS_URL")),
            rest_base_url: lookup(&format!("{ENV_PREFIX}REST_BASE_URL")),
            rest_path: lookup(&format!("{ENV_PREFIX}REST_PATH")),
            connect_timeout_ms: parse_env(&lookup, "CONNECT_TIMEOUT_MS")?,
            ping_interval_ms: parse_env(&lookup, "PING_INTERVAL_MS")?,
            backoff_base_ms: parse_env(&lookup, "BACKOFF_BASE_MS")?,
            backoff_max_ms: parse_env(&lookup, "BACKOFF_MAX_MS")?,
            max_reconnect_attempts: parse_env(&lookup, "MAX_RECONNECT_ATTEMPTS")?,
            emit_interval_ms: parse_env(&lookup, "EMIT_INTERVAL_MS")?,
            max_pending_patches: parse_env(&lookup, "MAX_PENDING_PATCHES")?,
            cache_capacity: parse_env(&lookup, "CACHE_CAPACITY")?,
            cache_sweep_interval_ms: parse_env(&lookup, "CACHE_SWEEP_INTERVAL_MS")?,
            durable_ttl_threshold_ms: parse_env(&lookup, "DURABLE_TTL_THRESHOLD_MS")?,
            rest_cache_ttl_ms: parse_env(&lookup, "REST_CACHE_TTL_MS")?,
            fallback_poll_interval_ms: parse_env(&lookup, "FALLBACK_POLL_INTERVAL_MS")?,
            cache_namespace: lookup(&format!("{ENV_PREFIX}CACHE_NAMESPACE")),
        })
    }

    pub fn normalize(self) -> Result<SyncConfig, AppError> {
        let ws_url = require_url("wsUrl", self.ws_url, DEFAULT_WS_URL, &["ws", "wss"])?;
        let rest_base_url = require_url(
            "restBaseUrl",
            self.rest_base_url,
            DEFAULT_REST_BASE_URL,
            &["http", "https"],
        )?;
        let rest_path = require_text("restPath", self.rest_path, DEFAULT_REST_PATH)?;

        let connect_timeout_ms = require_range(
            "connectTimeoutMs",
            self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            MIN_CONNECT_TIMEOUT_MS,
            MAX_CONNECT_TIMEOUT_MS,
        )?;
        let ping_interval_ms = require_range(
            "pingIntervalMs",
            self.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS),
            MIN_PING_INTERVAL_MS,
            MAX_PING_INTERVAL_MS,
        )?;
        let backoff_base_ms = require_range(
            "backoffBaseMs",
            self.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            MIN_BACKOFF_BASE_MS,
            MAX_BACKOFF_BASE_MS,
        )?;
        let backoff_max_ms = require_range(
            "backoffMaxMs",
            self.backoff_max_ms
                .unwrap_or_else(|| DEFAULT_BACKOFF_MAX_MS.max(backoff_base_ms)),
            backoff_base_ms,
            MAX_BACKOFF_MAX_MS,
        )?;
        let max_reconnect_attempts = require_range(
            "maxReconnectAttempts",
            self.max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            0,
            MAX_RECONNECT_ATTEMPTS,
        )?;
        let emit_interval_ms = require_range(
            "emitIntervalMs",
            self.emit_interval_ms.unwrap_or(DEFAULT_EMIT_INTERVAL_MS),
            MIN_EMIT_INTERVAL_MS,
            MAX_EMIT_INTERVAL_MS,
        )?;
        let max_pending_patches = require_range(
            "maxPendingPatches",
            self.max_pending_patches.unwrap_or(DEFAULT_MAX_PENDING_PATCHES),
            MIN_MAX_PENDING_PATCHES,
            MAX_MAX_PENDING_PATCHES,
        )?;
        let cache_capacity = require_range(
            "cacheCapacity",
            self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
            MIN_CACHE_CAPACITY,
            MAX_CACHE_CAPACITY,
        )?;
        let cache_sweep_interval_ms = require_range(
            "cacheSweepIntervalMs",
            self.cache_sweep_interval_ms
                .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL_MS),
            MIN_CACHE_SWEEP_INTERVAL_MS,
            MAX_CACHE_SWEEP_INTERVAL_MS,
        )?;
        let durable_ttl_threshold_ms = self
            .durable_ttl_threshold_ms
            .unwrap_or(DEFAULT_DURABLE_TTL_THRESHOLD_MS);

        let rest_cache_ttl_ms = self.rest_cache_ttl_ms.unwrap_or(DEFAULT_REST_CACHE_TTL_MS);
        if rest_cache_ttl_ms == 0 {
            return Err(AppError::InvalidArgument(
                "restCacheTtlMs must be greater than zero".to_string(),
            ));
        }

        let fallback_poll_interval_ms = self
            .fallback_poll_interval_ms
            .unwrap_or(DEFAULT_FALLBACK_POLL_INTERVAL_MS);
        if fallback_poll_interval_ms != 0 && fallback_poll_interval_ms < MIN_FALLBACK_POLL_INTERVAL_MS
        {
            return Err(AppError::InvalidArgument(format!(
                "fallbackPollIntervalMs must be 0 or at least {MIN_FALLBACK_POLL_INTERVAL_MS}"
            )));
        }

        let cache_namespace =
            require_text("cacheNamespace", self.cache_namespace, DEFAULT_CACHE_NAMESPACE)?;
        if cache_namespace.contains(':') {
            return Err(AppError::InvalidArgument(
                "cacheNamespace must not contain ':'".to_string(),
            ));
        }

        Ok(SyncConfig {
            ws_url,
            rest_base_url,
            rest_path,
            connect_timeout_ms,
            ping_interval_ms,
            backoff_base_ms,
            backoff_max_ms,
            max_reconnect_attempts,
            emit_interval_ms,
            max_pending_patches,
            cache_capacity,
            cache_sweep_interval_ms,
            durable_ttl_threshold_ms,
            rest_cache_ttl_ms,
            fallback_poll_interval_ms,
            cache_namespace,
        })
    }
}

impl SyncConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            url: self.ws_url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            capacity: self.cache_capacity,
            sweep_interval: Duration::from_millis(self.cache_sweep_interval_ms),
            durable_threshold: Duration::from_millis(self.durable_ttl_threshold_ms),
        }
    }

    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }

    pub fn rest_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.rest_cache_ttl_ms)
    }

    pub fn fallback_poll_interval(&self) -> Option<Duration> {
        (self.fallback_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.fallback_poll_interval_ms))
    }
}
