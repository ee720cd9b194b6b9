use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }

    /// Whether the status reason should be surfaced to consumers as an error.
    pub fn is_faulted(self) -> bool {
        matches!(self, Self::Error | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reason: Option<String>,
    /// Consecutive failed attempts behind the current state.
    pub attempt: u32,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, reason: Option<String>, attempt: u32) -> Self {
        Self {
            state,
            reason,
            attempt,
        }
    }

    pub fn disconnected(reason: Option<String>) -> Self {
        Self::new(ConnectionState::Disconnected, reason, 0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    FullReplace,
    FastUpdate,
    BatchUpdate,
}

impl PatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullReplace => "full_replace",
            Self::FastUpdate => "fast_update",
            Self::BatchUpdate => "batch_update",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "full_replace" => Ok(Self::FullReplace),
            "fast_update" => Ok(Self::FastUpdate),
            "batch_update" => Ok(Self::BatchUpdate),
            other => Err(AppError::Frame(format!("unknown frame type '{other}'"))),
        }
    }
}

/// Per-feed quote fields. Absent fields mean "unknown" on a row and
/// "unchanged" on a patch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceQuote {
    pub price: Option<f64>,
    pub volume_24h: Option<f64>,
    pub change_24h: Option<f64>,
}

impl SourceQuote {
    pub fn merge(&mut self, update: &SourceQuote) {
        if update.price.is_some() {
            self.price = update.price;
        }
        if update.volume_24h.is_some() {
            self.volume_24h = update.volume_24h;
        }
        if update.change_24h.is_some() {
            self.change_24h = update.change_24h;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.volume_24h.is_none() && self.change_24h.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRow {
    pub symbol: String,
    pub sources: BTreeMap<String, SourceQuote>,
    pub premium: Option<f64>,
    pub last_update: i64,
}

impl InstrumentRow {
    pub fn has_price(&self) -> bool {
        self.sources.values().any(|quote| quote.price.is_some())
    }

    pub fn price(&self, source: &str) -> Option<f64> {
        self.sources.get(source).and_then(|quote| quote.price)
    }

    /// Builds a row from a patch, or `None` when no source carries a price.
    pub fn from_patch(patch: &Patch) -> Option<Self> {
        if !patch.has_price() {
            return None;
        }

        Some(Self {
            symbol: patch.symbol.clone(),
            sources: patch.sources.clone(),
            premium: patch.premium,
            last_update: patch.received_at,
        })
    }
}

pub type RowSnapshot = Arc<BTreeMap<String, InstrumentRow>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub symbol: String,
    pub kind: PatchKind,
    pub received_at: i64,
    pub sources: BTreeMap<String, SourceQuote>,
    pub premium: Option<f64>,
}

impl Patch {
    pub fn new(symbol: impl Into<String>, kind: PatchKind, received_at: i64) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            received_at,
            sources: BTreeMap::new(),
            premium: None,
        }
    }

    pub fn with_quote(mut self, source: impl Into<String>, quote: SourceQuote) -> Self {
        self.sources.insert(source.into(), quote);
        self
    }

    pub fn with_premium(mut self, premium: f64) -> Self {
        self.premium = Some(premium);
        self
    }

    pub fn from_row(row: &InstrumentRow, kind: PatchKind) -> Self {
        Self {
            symbol: row.symbol.clone(),
            kind,
            received_at: row.last_update,
            sources: row.sources.clone(),
            premium: row.premium,
        }
    }

    pub fn has_price(&self) -> bool {
        self.sources.values().any(|quote| quote.price.is_some())
    }

    /// Folds a later patch for the same symbol into this one; later fields win.
    pub fn absorb(&mut self, later: &Patch) {
        for (source, quote) in &later.sources {
            self.sources.entry(source.clone()).or_default().merge(quote);
        }
        if later.premium.is_some() {
            self.premium = later.premium;
        }
        self.kind = later.kind;
        self.received_at = self.received_at.max(later.received_at);
    }
}

/// One classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub kind: PatchKind,
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableUpdate {
    Replace(Vec<Patch>),
    Merge {
        patches: Vec<Patch>,
        /// Patches received in the window before coalescing.
        received: usize,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    Empty,
    Live,
    Network,
    Cache,
    CacheFallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncView {
    pub rows: RowSnapshot,
    pub status: ConnectionStatus,
    pub last_update: Option<i64>,
    pub error: Option<String>,
    pub origin: DataOrigin,
}

impl SyncView {
    pub fn initial(status: ConnectionStatus) -> Self {
        Self {
            rows: RowSnapshot::default(),
            status,
            last_update: None,
            error: None,
            origin: DataOrigin::Empty,
        }
    }

    pub fn row(&self, symbol: &str) -> Option<&InstrumentRow> {
        self.rows.get(symbol)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub rows: usize,
    pub origin: DataOrigin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberWire {
    Number(f64),
    Text(String),
}

impl NumberWire {
    pub fn to_finite(&self) -> Result<f64, AppError> {
        let value = match self {
            Self::Number(value) => *value,
            Self::Text(raw) => raw.trim().parse::<f64>()?,
        };
        if !value.is_finite() {
            return Err(AppError::InvalidArgument(
                "numeric fields must be finite".to_string(),
            ));
        }
        Ok(value)
    }
}

fn optional_number(value: Option<&NumberWire>) -> Result<Option<f64>, AppError> {
    value.map(NumberWire::to_finite).transpose()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteWire {
    pub price: Option<NumberWire>,
    #[serde(rename = "volume24h")]
    pub volume_24h: Option<NumberWire>,
    #[serde(rename = "change24h")]
    pub change_24h: Option<NumberWire>,
}

impl TryFrom<&QuoteWire> for SourceQuote {
    type Error = AppError;

    fn try_from(value: &QuoteWire) -> Result<Self, Self::Error> {
        Ok(Self {
            price: optional_number(value.price.as_ref())?,
            volume_24h: optional_number(value.volume_24h.as_ref())?,
            change_24h: optional_number(value.change_24h.as_ref())?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowWire {
    pub symbol: Option<String>,
    #[serde(default)]
    pub sources: BTreeMap<String, QuoteWire>,
    pub premium: Option<NumberWire>,
}

impl RowWire {
    pub fn into_patch(
        self,
        keyed_symbol: Option<&str>,
        kind: PatchKind,
        received_at: i64,
    ) -> Result<Patch, AppError> {
        let symbol = normalize_symbol(self.symbol.as_deref().or(keyed_symbol).unwrap_or(""))?;

        let mut sources = BTreeMap::new();
        for (source, quote) in &self.sources {
            let source = source.trim().to_ascii_lowercase();
            if source.is_empty() {
                return Err(AppError::InvalidArgument(
                    "source names must be non-empty".to_string(),
                ));
            }
            let quote = SourceQuote::try_from(quote)?;
            if !quote.is_empty() {
                sources.insert(source, quote);
            }
        }

        Ok(Patch {
            symbol,
            kind,
            received_at,
            sources,
            premium: optional_number(self.premium.as_ref())?,
        })
    }
}

/// Row collections as they appear in frames and REST bodies.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RowsWire {
    List(Vec<RowWire>),
    Keyed(BTreeMap<String, RowWire>),
    Single(RowWire),
}

impl RowsWire {
    pub fn into_patches(self, kind: PatchKind, received_at: i64) -> Result<Vec<Patch>, AppError> {
        match self {
            Self::List(rows) => rows
                .into_iter()
                .map(|row| row.into_patch(None, kind, received_at))
                .collect(),
            Self::Keyed(rows) => rows
                .into_iter()
                .map(|(symbol, row)| row.into_patch(Some(symbol.as_str()), kind, received_at))
                .collect(),
            Self::Single(row) => Ok(vec![row.into_patch(None, kind, received_at)?]),
        }
    }
}

pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty()
        || !symbol
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/'))
    {
        return Err(AppError::InvalidArgument(format!(
            "symbol '{raw}' must be non-empty ASCII"
        )));
    }
    Ok(symbol)
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
