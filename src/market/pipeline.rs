use crate::market::coalescer::Coalescer;
use crate::market::dispatch::dispatch_text;
use crate::market::table::SyncTable;
use crate::market::types::{
    now_unix_ms, ConnectionState, ConnectionStatus, DataOrigin, InstrumentRow, SyncView,
    TableUpdate,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work handed to the pipeline from outside the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    MergeRows {
        rows: Vec<InstrumentRow>,
        origin: DataOrigin,
    },
    ReportError(String),
}

/// Owns the table and coalescer and publishes a [`SyncView`] after every
/// change that consumers can observe.
pub struct Pipeline {
    table: SyncTable,
    coalescer: Coalescer,
    status: ConnectionStatus,
    error: Option<String>,
    origin: DataOrigin,
    emit_interval: Duration,
    view_tx: watch::Sender<SyncView>,
}

impl Pipeline {
    pub fn new(
        emit_interval: Duration,
        max_pending: usize,
        status: ConnectionStatus,
    ) -> (Self, watch::Receiver<SyncView>) {
        let (view_tx, view_rx) = watch::channel(SyncView::initial(status.clone()));
        let pipeline = Self {
            table: SyncTable::default(),
            coalescer: Coalescer::new(max_pending),
            status,
            error: None,
            origin: DataOrigin::Empty,
            emit_interval,
            view_tx,
        };
        (pipeline, view_rx)
    }

    pub fn pending_count(&self) -> usize {
        self.coalescer.pending_count()
    }

    fn publish(&self) {
        self.view_tx.send_replace(SyncView {
            rows: self.table.snapshot(),
            status: self.status.clone(),
            last_update: self.table.last_update(),
            error: self.error.clone(),
            origin: self.origin,
        });
    }

    pub fn handle_frame(&mut self, text: String, received_at: i64) {
        let dispatch = match dispatch_text(text, received_at) {
            Ok(dispatch) => dispatch,
            Err(error) => {
                warn!(%error, "dropping unparsable frame");
                return;
            }
        };
        debug!(
            kind = dispatch.kind.as_str(),
            patches = dispatch.patches.len(),
            "frame dispatched"
        );

        if let Some(update) = self.coalescer.push(dispatch) {
            self.apply(update);
        }
    }

    /// Emits the pending window, if any.
    pub fn flush(&mut self) {
        if let Some(update) = self.coalescer.flush() {
            self.apply(update);
        }
    }

    fn apply(&mut self, update: TableUpdate) {
        let replace = matches!(update, TableUpdate::Replace(_));
        if let TableUpdate::Merge { patches, received } = &update {
            debug!(received, merged = patches.len(), "applying coalesced window");
        }

        let applied = self.table.apply(update);
        if replace || applied > 0 {
            self.origin = DataOrigin::Live;
            self.publish();
        }
    }

    /// Folds rows loaded over REST into the table. While the push channel is
    /// connected live rows win and only missing symbols are filled in. A
    /// connection fault stays on the view until the channel recovers.
    pub fn merge_rows(&mut self, rows: &[InstrumentRow], origin: DataOrigin) {
        let overwrite = self.status.state != ConnectionState::Connected;
        let applied = self.table.merge_rows(rows, overwrite);
        debug!(
            rows = rows.len(),
            applied,
            origin = ?origin,
            "merged fetched rows"
        );

        if self.status.state != ConnectionState::Connected || self.origin == DataOrigin::Empty {
            self.origin = origin;
        }
        if !self.status.state.is_faulted() {
            self.error = None;
        }
        self.publish();
    }

    pub fn report_error(&mut self, message: String) {
        self.error = Some(message);
        self.publish();
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        if status.state == ConnectionState::Connected {
            self.error = None;
        } else if status.state.is_faulted() {
            self.error = status.reason.clone();
        }
        self.status = status;
        self.publish();
    }

    fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::MergeRows { rows, origin } => self.merge_rows(&rows, origin),
            PipelineCommand::ReportError(message) => self.report_error(message),
        }
    }

    pub async fn run(
        mut self,
        mut frames: mpsc::UnboundedReceiver<String>,
        mut commands: mpsc::UnboundedReceiver<PipelineCommand>,
        mut status_rx: watch::Receiver<ConnectionStatus>,
        cancel_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.emit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => self.flush(),
                frame = frames.recv() => {
                    let Some(text) = frame else {
                        debug!("frame channel closed");
                        break;
                    };
                    self.handle_frame(text, now_unix_ms());
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command);
                }
                changed = status_rx.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    self.set_status(status);
                }
            }
        }

        let dropped = self.coalescer.discard();
        if dropped > 0 {
            debug!(dropped, "discarded pending patches on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::SourceQuote;
    use std::collections::BTreeMap;

    const SNAPSHOT: &str = r#"{"type":"full_replace","data":[
        {"symbol":"A","sources":{"binance":{"price":1.0,"volume24h":10}}},
        {"symbol":"B","sources":{"binance":{"price":2.0}}},
        {"symbol":"C","sources":{"binance":{"price":3.0}}}
    ]}"#;

    fn pipeline() -> (Pipeline, watch::Receiver<SyncView>) {
        Pipeline::new(
            Duration::from_millis(100),
            500,
            ConnectionStatus::new(ConnectionState::Connected, None, 0),
        )
    }

    fn price(view: &SyncView, symbol: &str) -> Option<f64> {
        view.row(symbol).and_then(|row| row.price("binance"))
    }

    fn row(symbol: &str, price: f64) -> InstrumentRow {
        InstrumentRow {
            symbol: symbol.to_string(),
            sources: BTreeMap::from([(
                "binance".to_string(),
                SourceQuote {
                    price: Some(price),
                    ..SourceQuote::default()
                },
            )]),
            premium: None,
            last_update: 1,
        }
    }

    #[test]
    fn fast_update_after_snapshot_is_visible_immediately() {
        let (mut pipeline, view) = pipeline();

        pipeline.handle_frame(SNAPSHOT.to_string(), 10);
        assert_eq!(view.borrow().rows.len(), 3);

        pipeline.handle_frame(
            r#"{"type":"fast_update","data":{"symbol":"A","sources":{"binance":{"price":1.5}}}}"#
                .to_string(),
            20,
        );

        let current = view.borrow().clone();
        assert_eq!(price(&current, "A"), Some(1.5));
        assert_eq!(
            current.row("A").and_then(|row| row.sources["binance"].volume_24h),
            Some(10.0)
        );
        assert_eq!(price(&current, "B"), Some(2.0));
        assert_eq!(price(&current, "C"), Some(3.0));
        assert_eq!(current.last_update, Some(20));
        assert_eq!(current.origin, DataOrigin::Live);
    }

    #[test]
    fn batch_updates_wait_for_flush() {
        let (mut pipeline, view) = pipeline();
        pipeline.handle_frame(SNAPSHOT.to_string(), 10);

        pipeline.handle_frame(
            r#"{"type":"batch_update","data":[{"symbol":"B","sources":{"binance":{"price":2.5}}}]}"#
                .to_string(),
            20,
        );
        assert_eq!(price(&view.borrow(), "B"), Some(2.0));
        assert_eq!(pipeline.pending_count(), 1);

        pipeline.flush();
        assert_eq!(price(&view.borrow(), "B"), Some(2.5));
    }

    #[test]
    fn malformed_frames_leave_view_untouched() {
        let (mut pipeline, mut view) = pipeline();
        pipeline.handle_frame(SNAPSHOT.to_string(), 10);
        view.borrow_and_update();

        pipeline.handle_frame("{oops".to_string(), 11);
        pipeline.handle_frame(r#"{"type":"delta","data":[]}"#.to_string(), 12);

        assert!(!view.has_changed().expect("sender alive"));
        assert_eq!(view.borrow().rows.len(), 3);
    }

    #[test]
    fn empty_flush_does_not_notify() {
        let (mut pipeline, mut view) = pipeline();
        view.borrow_and_update();

        pipeline.flush();

        assert!(!view.has_changed().expect("sender alive"));
    }

    #[test]
    fn status_faults_surface_as_errors() {
        let (mut pipeline, view) = pipeline();

        pipeline.set_status(ConnectionStatus::new(
            ConnectionState::Failed,
            Some("gave up after 10 attempts".to_string()),
            10,
        ));
        assert_eq!(view.borrow().status.state, ConnectionState::Failed);
        assert_eq!(
            view.borrow().error.as_deref(),
            Some("gave up after 10 attempts")
        );

        pipeline.set_status(ConnectionStatus::new(ConnectionState::Connected, None, 0));
        assert_eq!(view.borrow().error, None);
    }

    #[test]
    fn fetched_rows_only_fill_gaps_while_connected() {
        let (mut pipeline, view) = pipeline();
        pipeline.handle_frame(SNAPSHOT.to_string(), 10);

        pipeline.merge_rows(&[row("A", 100.0), row("D", 4.0)], DataOrigin::Network);
        assert_eq!(price(&view.borrow(), "A"), Some(1.0));
        assert_eq!(price(&view.borrow(), "D"), Some(4.0));
        assert_eq!(view.borrow().origin, DataOrigin::Live);

        pipeline.set_status(ConnectionStatus::new(
            ConnectionState::Reconnecting,
            None,
            1,
        ));
        pipeline.merge_rows(&[row("A", 100.0)], DataOrigin::CacheFallback);
        assert_eq!(price(&view.borrow(), "A"), Some(100.0));
        assert_eq!(view.borrow().origin, DataOrigin::CacheFallback);
    }

    #[test]
    fn stale_fallback_rows_do_not_replace_newer_live_prices() {
        let (mut pipeline, view) = pipeline();
        pipeline.handle_frame(SNAPSHOT.to_string(), 1_000);
        pipeline.set_status(ConnectionStatus::new(
            ConnectionState::Reconnecting,
            None,
            1,
        ));

        let mut cached = row("A", 100.0);
        cached.last_update = 500;
        pipeline.merge_rows(&[cached], DataOrigin::CacheFallback);

        let current = view.borrow().clone();
        assert_eq!(price(&current, "A"), Some(1.0));
        assert_eq!(current.row("A").map(|row| row.last_update), Some(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_ignores_frames_already_queued() {
        let (pipeline, view) = pipeline();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) =
            watch::channel(ConnectionStatus::new(ConnectionState::Connected, None, 0));
        let cancel_token = CancellationToken::new();

        frames_tx
            .send(r#"{"type":"fast_update","data":{"symbol":"BTC","sources":{"binance":{"price":5}}}}"#.to_string())
            .expect("receiver is held");
        cancel_token.cancel();

        pipeline
            .run(frames_rx, commands_rx, status_rx, cancel_token)
            .await;

        assert!(view.borrow().rows.is_empty());
        assert_eq!(view.borrow().last_update, None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_flushes_on_interval_and_discards_on_cancel() {
        let (pipeline, mut view) = pipeline();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) =
            watch::channel(ConnectionStatus::new(ConnectionState::Connected, None, 0));
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(
            frames_rx,
            commands_rx,
            status_rx,
            cancel_token.clone(),
        ));

        frames_tx
            .send(r#"{"type":"batch_update","data":[{"symbol":"BTC","sources":{"binance":{"price":5}}}]}"#.to_string())
            .expect("pipeline should be running");
        tokio::time::timeout(
            Duration::from_secs(1),
            view.wait_for(|current| current.row("BTC").is_some()),
        )
        .await
        .expect("flush should happen within the interval")
        .expect("view sender alive");

        status_tx.send_replace(ConnectionStatus::new(
            ConnectionState::Error,
            Some("boom".to_string()),
            1,
        ));
        tokio::time::timeout(
            Duration::from_secs(1),
            view.wait_for(|current| current.error.as_deref() == Some("boom")),
        )
        .await
        .expect("status should be folded in")
        .expect("view sender alive");

        frames_tx
            .send(r#"{"type":"batch_update","data":[{"symbol":"ETH","sources":{"binance":{"price":6}}}]}"#.to_string())
            .expect("pipeline should be running");
        cancel_token.cancel();
        task.await.expect("pipeline task should finish");

        assert!(view.borrow().row("ETH").is_none());
    }
}
