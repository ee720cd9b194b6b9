use crate::market::types::{Dispatch, Patch, PatchKind, TableUpdate};
use std::collections::BTreeMap;

/// Accumulates patches for one coalescing window and merges them per symbol.
///
/// The window is driven from outside: the pipeline calls [`Coalescer::flush`]
/// on its ticker, and [`Coalescer::push`] returns an update directly when a
/// message must not wait for the next tick.
#[derive(Debug)]
pub struct Coalescer {
    max_pending: usize,
    pending: BTreeMap<String, Patch>,
    pending_count: usize,
}

impl Coalescer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending: max_pending.max(1),
            pending: BTreeMap::new(),
            pending_count: 0,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn pending_symbols(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, dispatch: Dispatch) -> Option<TableUpdate> {
        match dispatch.kind {
            PatchKind::FullReplace => {
                // A snapshot supersedes everything queued before it.
                self.discard();
                Some(TableUpdate::Replace(dispatch.patches))
            }
            PatchKind::FastUpdate => {
                if dispatch.patches.is_empty() {
                    return None;
                }
                self.absorb_all(dispatch.patches);
                self.flush()
            }
            PatchKind::BatchUpdate => {
                self.absorb_all(dispatch.patches);
                if self.pending_count >= self.max_pending {
                    self.flush()
                } else {
                    None
                }
            }
        }
    }

    fn absorb_all(&mut self, patches: Vec<Patch>) {
        for patch in patches {
            self.pending_count = self.pending_count.saturating_add(1);
            match self.pending.get_mut(&patch.symbol) {
                Some(current) => current.absorb(&patch),
                None => {
                    self.pending.insert(patch.symbol.clone(), patch);
                }
            }
        }
    }

    /// Emits one merged update for the window, or nothing when it is empty.
    pub fn flush(&mut self) -> Option<TableUpdate> {
        if self.pending.is_empty() {
            return None;
        }

        let received = std::mem::take(&mut self.pending_count);
        let patches = std::mem::take(&mut self.pending).into_values().collect();
        Some(TableUpdate::Merge { patches, received })
    }

    /// Drops the pending window and returns how many patches were lost.
    pub fn discard(&mut self) -> usize {
        self.pending.clear();
        std::mem::take(&mut self.pending_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::SourceQuote;

    fn priced(symbol: &str, kind: PatchKind, price: f64, received_at: i64) -> Patch {
        Patch::new(symbol, kind, received_at).with_quote(
            "binance",
            SourceQuote {
                price: Some(price),
                ..SourceQuote::default()
            },
        )
    }

    fn batch(patches: Vec<Patch>) -> Dispatch {
        Dispatch {
            kind: PatchKind::BatchUpdate,
            patches,
        }
    }

    #[test]
    fn burst_for_one_symbol_emits_single_patch_with_last_values() {
        let mut coalescer = Coalescer::new(1_000);

        for step in 1..=50 {
            let patch = priced("BTC", PatchKind::BatchUpdate, 100.0 + step as f64, step);
            assert!(coalescer.push(batch(vec![patch])).is_none());
        }

        let update = coalescer.flush().expect("window should flush");
        let TableUpdate::Merge { patches, received } = update else {
            panic!("expected merge update");
        };
        assert_eq!(received, 50);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].symbol, "BTC");
        assert_eq!(
            patches[0].sources.get("binance").and_then(|q| q.price),
            Some(150.0)
        );
        assert_eq!(patches[0].received_at, 50);
    }

    #[test]
    fn merges_overlapping_fields_within_window() {
        let mut coalescer = Coalescer::new(1_000);
        let volume = Patch::new("ETH", PatchKind::BatchUpdate, 1).with_quote(
            "binance",
            SourceQuote {
                volume_24h: Some(42.0),
                ..SourceQuote::default()
            },
        );
        let price = priced("ETH", PatchKind::BatchUpdate, 3_000.0, 2);

        let _ = coalescer.push(batch(vec![volume]));
        let _ = coalescer.push(batch(vec![price]));

        let Some(TableUpdate::Merge { patches, .. }) = coalescer.flush() else {
            panic!("expected merge update");
        };
        let quote = patches[0].sources.get("binance").copied().unwrap();
        assert_eq!(quote.price, Some(3_000.0));
        assert_eq!(quote.volume_24h, Some(42.0));
    }

    #[test]
    fn flushing_empty_window_is_noop() {
        let mut coalescer = Coalescer::new(10);
        assert!(coalescer.flush().is_none());
        assert!(coalescer.push(batch(Vec::new())).is_none());
        assert!(coalescer.flush().is_none());
    }

    #[test]
    fn flushes_when_pending_ceiling_is_reached() {
        let mut coalescer = Coalescer::new(3);
        assert!(coalescer
            .push(batch(vec![priced("A", PatchKind::BatchUpdate, 1.0, 1)]))
            .is_none());
        assert!(coalescer
            .push(batch(vec![priced("B", PatchKind::BatchUpdate, 1.0, 1)]))
            .is_none());

        let update = coalescer
            .push(batch(vec![priced("A", PatchKind::BatchUpdate, 2.0, 2)]))
            .expect("ceiling should force a flush");
        let TableUpdate::Merge { patches, received } = update else {
            panic!("expected merge update");
        };
        assert_eq!(received, 3);
        assert_eq!(patches.len(), 2);
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[test]
    fn fast_update_flushes_immediately_with_pending_window() {
        let mut coalescer = Coalescer::new(1_000);
        let _ = coalescer.push(batch(vec![
            priced("BTC", PatchKind::BatchUpdate, 100.0, 1),
            priced("ETH", PatchKind::BatchUpdate, 10.0, 1),
        ]));

        let update = coalescer
            .push(Dispatch {
                kind: PatchKind::FastUpdate,
                patches: vec![priced("BTC", PatchKind::FastUpdate, 105.0, 2)],
            })
            .expect("fast update bypasses the window");

        let TableUpdate::Merge { patches, .. } = update else {
            panic!("expected merge update");
        };
        let btc = patches.iter().find(|patch| patch.symbol == "BTC").unwrap();
        assert_eq!(btc.sources.get("binance").and_then(|q| q.price), Some(105.0));
        assert_eq!(btc.kind, PatchKind::FastUpdate);
        assert!(patches.iter().any(|patch| patch.symbol == "ETH"));
        assert!(coalescer.flush().is_none());
    }

    #[test]
    fn full_replace_supersedes_pending_window() {
        let mut coalescer = Coalescer::new(1_000);
        let _ = coalescer.push(batch(vec![priced("OLD", PatchKind::BatchUpdate, 1.0, 1)]));

        let update = coalescer
            .push(Dispatch {
                kind: PatchKind::FullReplace,
                patches: vec![priced("NEW", PatchKind::FullReplace, 2.0, 2)],
            })
            .expect("snapshot is emitted immediately");

        assert!(matches!(update, TableUpdate::Replace(ref rows) if rows.len() == 1));
        assert!(coalescer.flush().is_none());
    }

    #[test]
    fn discard_reports_dropped_patches() {
        let mut coalescer = Coalescer::new(1_000);
        let _ = coalescer.push(batch(vec![
            priced("A", PatchKind::BatchUpdate, 1.0, 1),
            priced("A", PatchKind::BatchUpdate, 2.0, 2),
        ]));

        assert_eq!(coalescer.pending_symbols(), 1);
        assert_eq!(coalescer.discard(), 2);
        assert!(coalescer.flush().is_none());
    }
}
