use crate::market::types::{InstrumentRow, Patch, PatchKind, RowSnapshot, TableUpdate};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Merges the fields present in `patch` into `row`; absent fields are kept.
pub fn merge_patch(row: &mut InstrumentRow, patch: &Patch) {
    for (source, quote) in &patch.sources {
        row.sources.entry(source.clone()).or_default().merge(quote);
    }
    if patch.premium.is_some() {
        row.premium = patch.premium;
    }
    row.last_update = row.last_update.max(patch.received_at);
}

/// Authoritative symbol -> row mapping.
///
/// Rows live behind an `Arc` so [`SyncTable::snapshot`] is a cheap immutable
/// copy; writes clone the map only while a snapshot is still held.
#[derive(Debug, Default)]
pub struct SyncTable {
    rows: RowSnapshot,
    last_update: Option<i64>,
}

impl SyncTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.rows.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&InstrumentRow> {
        self.rows.get(symbol)
    }

    pub fn last_update(&self) -> Option<i64> {
        self.last_update
    }

    fn touch(&mut self, timestamp: i64) {
        self.last_update = Some(self.last_update.map_or(timestamp, |current| current.max(timestamp)));
    }

    /// Returns `false` when the patch was skipped because it would create a
    /// row without any price.
    pub fn apply_patch(&mut self, patch: &Patch) -> bool {
        let rows = Arc::make_mut(&mut self.rows);
        match rows.get_mut(&patch.symbol) {
            Some(row) => merge_patch(row, patch),
            None => {
                let Some(row) = InstrumentRow::from_patch(patch) else {
                    return false;
                };
                rows.insert(row.symbol.clone(), row);
            }
        }
        self.touch(patch.received_at);
        true
    }

    pub fn replace_all<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = InstrumentRow>,
    {
        let mut next = BTreeMap::new();
        let mut newest = None;
        for row in rows.into_iter().filter(InstrumentRow::has_price) {
            newest = Some(newest.map_or(row.last_update, |current: i64| current.max(row.last_update)));
            next.insert(row.symbol.clone(), row);
        }
        self.rows = Arc::new(next);
        if let Some(timestamp) = newest {
            self.touch(timestamp);
        }
    }

    /// Applies a coalesced update and returns how many patches took effect.
    pub fn apply(&mut self, update: TableUpdate) -> usize {
        match update {
            TableUpdate::Replace(patches) => {
                let rows: Vec<InstrumentRow> =
                    patches.iter().filter_map(InstrumentRow::from_patch).collect();
                let applied = rows.len();
                self.replace_all(rows);
                applied
            }
            TableUpdate::Merge { patches, .. } => patches
                .iter()
                .filter(|patch| self.apply_patch(patch))
                .count(),
        }
    }

    /// Merges rows loaded outside the push channel. With `overwrite` unset
    /// only symbols missing from the table are filled in; with it set a row
    /// older than the one held is still skipped.
    pub fn merge_rows(&mut self, rows: &[InstrumentRow], overwrite: bool) -> usize {
        let mut applied = 0;
        for row in rows {
            if let Some(existing) = self.rows.get(&row.symbol) {
                if !overwrite || row.last_update < existing.last_update {
                    continue;
                }
            }
            let patch = Patch::from_row(row, PatchKind::BatchUpdate);
            if self.apply_patch(&patch) {
                applied += 1;
            }
        }
        applied
    }

    pub fn snapshot(&self) -> RowSnapshot {
        Arc::clone(&self.rows)
    }
}
