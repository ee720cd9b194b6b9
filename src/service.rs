use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, Connector, WsConnector};
use crate::error::AppError;
use crate::market::pipeline::{Pipeline, PipelineCommand};
use crate::market::rest::{CachedRowSource, FetchOutcome, HttpRowFetcher, RowFetcher};
use crate::market::types::{
    ConnectionState, ConnectionStatus, InstrumentRow, RefreshSummary, SyncView,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type LiveMarketSync = MarketSync<WsConnector, HttpRowFetcher>;

/// The public face of the sync core: a watchable [`SyncView`] plus the few
/// operations a host needs (reconnect, refresh, shutdown).
pub struct MarketSync<C, F> {
    connection: Arc<ConnectionManager<C>>,
    rows: Arc<CachedRowSource<F>>,
    commands: mpsc::UnboundedSender<PipelineCommand>,
    view_rx: watch::Receiver<SyncView>,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector, F: RowFetcher> MarketSync<C, F> {
    /// Spawns the pipeline, the initial REST load and the optional fallback
    /// poller, then opens the push channel.
    pub async fn start(
        config: &SyncConfig,
        connector: C,
        fetcher: F,
        cache: Arc<CacheStore<Vec<InstrumentRow>>>,
    ) -> Self {
        let (connection, frames) = ConnectionManager::new(config.connection_settings(), connector);
        let connection = Arc::new(connection);
        let (pipeline, view_rx) = Pipeline::new(
            config.emit_interval(),
            config.max_pending_patches,
            connection.status(),
        );
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let rows = Arc::new(CachedRowSource::new(
            fetcher,
            cache,
            config.rest_cache_ttl(),
        ));
        let cancel_token = CancellationToken::new();

        let mut tasks = vec![tokio::spawn(pipeline.run(
            frames,
            commands_rx,
            connection.subscribe_status(),
            cancel_token.clone(),
        ))];

        let initial_rows = Arc::clone(&rows);
        let initial_commands = commands.clone();
        let initial_cancel = cancel_token.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = initial_cancel.cancelled() => {}
                outcome = initial_rows.load(false) => forward_outcome(&initial_commands, outcome),
            }
        }));

        if let Some(period) = config.fallback_poll_interval() {
            tasks.push(tokio::spawn(run_fallback_poller(
                Arc::clone(&rows),
                commands.clone(),
                connection.subscribe_status(),
                period,
                cancel_token.clone(),
            )));
        }

        info!(url = %config.ws_url, "market sync started");
        connection.connect().await;

        Self {
            connection,
            rows,
            commands,
            view_rx,
            cancel_token,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncView> {
        self.view_rx.clone()
    }

    pub fn view(&self) -> SyncView {
        self.view_rx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub async fn reconnect(&self) {
        self.connection.reconnect().await;
    }

    /// Forces a REST load and merges it into the table. A failure is recorded
    /// on the view and returned.
    pub async fn refresh(&self) -> Result<RefreshSummary, AppError> {
        match self.rows.load(true).await {
            Ok(fetched) => {
                let summary = RefreshSummary {
                    rows: fetched.rows.len(),
                    origin: fetched.origin,
                };
                forward_outcome(&self.commands, Ok(fetched));
                Ok(summary)
            }
            Err(error) => {
                self.send(PipelineCommand::ReportError(error.to_string()));
                Err(error)
            }
        }
    }

    fn send(&self, command: PipelineCommand) {
        if self.commands.send(command).is_err() {
            debug!("pipeline stopped before refresh result arrived");
        }
    }

    /// Stops every task owned by this instance and disconnects. Pending
    /// patches are discarded.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.cancel_token.cancel();
        self.rows.cache().shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "market sync task ended abnormally");
            }
        }
        info!("market sync stopped");
    }
}

impl<C, F> Drop for MarketSync<C, F> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn forward_outcome(
    commands: &mpsc::UnboundedSender<PipelineCommand>,
    outcome: Result<FetchOutcome, AppError>,
) {
    let command = match outcome {
        Ok(FetchOutcome { rows, origin }) => PipelineCommand::MergeRows { rows, origin },
        Err(error) => PipelineCommand::ReportError(error.to_string()),
    };
    if commands.send(command).is_err() {
        debug!("pipeline stopped before fetched rows arrived");
    }
}

async fn run_fallback_poller<F: RowFetcher>(
    rows: Arc<CachedRowSource<F>>,
    commands: mpsc::UnboundedSender<PipelineCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                if status_rx.borrow().state == ConnectionState::Connected {
                    continue;
                }
                debug!("push channel down, polling rows");
                let outcome = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    outcome = rows.load(false) => outcome,
                };
                forward_outcome(&commands, outcome);
            }
        }
    }
}
