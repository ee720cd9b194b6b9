use crate::connection::backoff::Backoff;
use crate::connection::transport::{Connector, PushChannel};
use crate::error::AppError;
use crate::market::types::{ConnectionState, ConnectionStatus};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PING_FRAME: &str = "ping";
pub const PONG_FRAME: &str = "pong";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Zero retries forever.
    pub max_attempts: u32,
}

impl ConnectionSettings {
    /// How long an open channel may stay quiet: one ping interval plus the
    /// time the peer gets to answer it.
    pub fn silence_limit(&self) -> Duration {
        self.ping_interval + self.connect_timeout
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max, self.max_attempts)
    }
}

struct Shared<C> {
    settings: ConnectionSettings,
    connector: C,
    status_tx: watch::Sender<ConnectionStatus>,
    frames_tx: mpsc::UnboundedSender<String>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl<C> Shared<C> {
    fn publish(&self, state: ConnectionState, reason: Option<String>, attempt: u32) {
        debug!(
            state = state.as_str(),
            attempt,
            reason = reason.as_deref(),
            "connection status changed"
        );
        self.status_tx
            .send_replace(ConnectionStatus::new(state, reason, attempt));
    }

    fn attempt_failed(&self, error: AppError, attempt: u32) -> AppError {
        warn!(url = %self.settings.url, attempt, %error, "push channel connect failed");
        self.publish(ConnectionState::Error, Some(error.to_string()), attempt);
        error
    }
}

struct Driver {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl Driver {
    async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(error) = self.join_handle.await {
            warn!(%error, "connection driver ended abnormally");
        }
    }
}

enum SessionEnd {
    Cancelled,
    Closed(&'static str),
    Dropped(AppError),
}

/// Owns the single push-channel connection: its socket, keep-alive, silence
/// watchdog and reconnect schedule.
///
/// Status is published on a watch channel; inbound text payloads go to the
/// receiver returned by [`ConnectionManager::new`].
pub struct ConnectionManager<C> {
    shared: Arc<Shared<C>>,
    driver: tokio::sync::Mutex<Option<Driver>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        settings: ConnectionSettings,
        connector: C,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::disconnected(None));

        let manager = Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                status_tx,
                frames_tx,
                outbox: Mutex::new(None),
            }),
            driver: tokio::sync::Mutex::new(None),
        };
        (manager, frames_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status_tx.borrow().state == ConnectionState::Connected
    }

    /// Starts the connection driver. Does nothing while a driver is running
    /// or after the attempt budget was exhausted; use [`Self::reconnect`] then.
    pub async fn connect(&self) {
        let mut slot = self.driver.lock().await;
        if slot
            .as_ref()
            .is_some_and(|driver| !driver.join_handle.is_finished())
        {
            debug!("connect ignored, driver already running");
            return;
        }
        if self.status().state == ConnectionState::Failed {
            debug!("connect ignored, manager is failed until reconnect");
            return;
        }

        *slot = Some(self.spawn_driver());
    }

    pub async fn disconnect(&self) {
        let existing = self.driver.lock().await.take();
        if let Some(driver) = existing {
            driver.stop().await;
        }
        self.shared.outbox.lock().take();

        info!(url = %self.shared.settings.url, "push channel disconnected");
        self.shared.publish(
            ConnectionState::Disconnected,
            Some("disconnected by client".to_string()),
            0,
        );
    }

    /// Tears down any current driver and starts over with a fresh backoff.
    pub async fn reconnect(&self) {
        let mut slot = self.driver.lock().await;
        if let Some(driver) = slot.take() {
            driver.stop().await;
        }
        self.shared.outbox.lock().take();

        info!(url = %self.shared.settings.url, "manual reconnect requested");
        *slot = Some(self.spawn_driver());
    }

    /// Queues a text frame; returns `false` unless the channel is connected.
    pub fn send(&self, text: impl Into<String>) -> bool {
        if !self.is_connected() {
            return false;
        }

        match self.shared.outbox.lock().as_ref() {
            Some(outbox) => outbox.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    fn spawn_driver(&self) -> Driver {
        let cancel_token = CancellationToken::new();
        self.shared.publish(ConnectionState::Connecting, None, 0);

        let join_handle = tokio::spawn(run_driver(
            Arc::clone(&self.shared),
            cancel_token.clone(),
        ));
        Driver {
            cancel_token,
            join_handle,
        }
    }
}

impl<C> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.cancel_token.cancel();
        }
    }
}

async fn run_driver<C: Connector>(shared: Arc<Shared<C>>, cancel_token: CancellationToken) {
    let settings = &shared.settings;
    let mut backoff = settings.backoff();

    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            attempt = tokio::time::timeout(
                settings.connect_timeout,
                shared.connector.connect(&settings.url),
            ) => attempt,
        };

        let failure = match attempt {
            Ok(Ok(channel)) => {
                backoff.reset();
                match run_session(&shared, channel, &cancel_token).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Closed(reason) => {
                        info!(url = %settings.url, reason, "push channel closed");
                        shared.publish(ConnectionState::Disconnected, Some(reason.to_string()), 0);
                        return;
                    }
                    SessionEnd::Dropped(error) => {
                        warn!(url = %settings.url, %error, "push channel dropped");
                        shared.publish(
                            ConnectionState::Disconnected,
                            Some(error.to_string()),
                            0,
                        );
                        error
                    }
                }
            }
            Ok(Err(error)) => shared.attempt_failed(error, backoff.failures() + 1),
            Err(_) => shared.attempt_failed(
                AppError::ConnectTimeout(settings.connect_timeout),
                backoff.failures() + 1,
            ),
        };

        let Some(delay) = backoff.record_failure() else {
            error!(
                url = %settings.url,
                attempts = backoff.failures(),
                max_attempts = backoff.max_attempts(),
                "push channel reconnect attempts exhausted"
            );
            shared.publish(
                ConnectionState::Failed,
                Some(format!(
                    "gave up after {} attempts: {failure}",
                    backoff.failures()
                )),
                backoff.failures(),
            );
            return;
        };

        shared.publish(
            ConnectionState::Reconnecting,
            Some(format!("retrying in {}ms: {failure}", delay.as_millis())),
            backoff.failures(),
        );
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        shared.publish(ConnectionState::Connecting, None, backoff.failures());
    }
}

async fn run_session<C>(
    shared: &Shared<C>,
    channel: PushChannel,
    cancel_token: &CancellationToken,
) -> SessionEnd {
    let PushChannel {
        mut sink,
        mut stream,
    } = channel;
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    *shared.outbox.lock() = Some(outbox_tx);

    info!(url = %shared.settings.url, "push channel connected");
    shared.publish(ConnectionState::Connected, None, 0);

    let ping_interval = shared.settings.ping_interval;
    let silence_limit = shared.settings.silence_limit();
    let mut keepalive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let silence = tokio::time::sleep(silence_limit);
    tokio::pin!(silence);

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break SessionEnd::Cancelled,
            _ = keepalive.tick() => {
                if let Err(error) = sink.send(Message::Text(PING_FRAME.to_string())).await {
                    break SessionEnd::Dropped(error);
                }
            }
            _ = &mut silence => break SessionEnd::Dropped(AppError::Silent(silence_limit)),
            Some(message) = outbox_rx.recv() => {
                if let Err(error) = sink.send(message).await {
                    break SessionEnd::Dropped(error);
                }
            }
            next = stream.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(error)) => break SessionEnd::Dropped(error),
                    None => break SessionEnd::Dropped(AppError::ChannelClosed("push channel stream ended")),
                };
                silence.as_mut().reset(Instant::now() + silence_limit);

                let text = match message {
                    Message::Text(text) => text,
                    Message::Binary(payload) => match String::from_utf8(payload) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Message::Close(frame) => {
                        let clean = frame
                            .as_ref()
                            .is_some_and(|close| close.code == CloseCode::Normal);
                        break if clean {
                            SessionEnd::Closed("closed by server")
                        } else {
                            SessionEnd::Dropped(AppError::ChannelClosed("server closed the push channel"))
                        };
                    }
                    _ => continue,
                };

                if text.trim() == PONG_FRAME {
                    continue;
                }
                if shared.frames_tx.send(text).is_err() {
                    break SessionEnd::Closed("frame consumer dropped");
                }
            }
        }
    };

    shared.outbox.lock().take();
    if matches!(end, SessionEnd::Cancelled) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::testing::{Attempt, ScriptedConnector, ServerEnd};
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    fn settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            url: "ws://test.invalid/ws".to_string(),
            connect_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            max_attempts,
        }
    }

    async fn wait_for_status(
        rx: &mut watch::Receiver<ConnectionStatus>,
        predicate: impl FnMut(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(predicate))
            .await
            .expect("status should arrive in time")
            .expect("status channel should stay open")
            .clone()
    }

    async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
        tokio::time::timeout(Duration::from_secs(600), servers.recv())
            .await
            .expect("connector should accept in time")
            .expect("connector should stay alive")
    }

    fn pings(messages: &[Message]) -> usize {
        messages
            .iter()
            .filter(|message| matches!(message, Message::Text(text) if text == PING_FRAME))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_text_frames_and_ignores_pong() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept]);
        let (manager, mut frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        manager.connect().await;
        let server = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;

        server.push_text(PONG_FRAME);
        server.push_text(r#"{"type":"batch_update","data":[]}"#);

        let frame = frames.recv().await.expect("frame should be forwarded");
        assert_eq!(frame, r#"{"type":"batch_update","data":[]}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_a_noop_while_connecting_or_connected() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept, Attempt::Accept]);
        let dialer = connector.clone();
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        manager.connect().await;
        manager.connect().await;
        assert_eq!(manager.status().state, ConnectionState::Connecting);

        let _server = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;
        for _ in 0..3 {
            manager.connect().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(dialer.attempts(), 1);
        assert_eq!(manager.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_keepalive_stops_pings_and_retries() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept]);
        let dialer = connector.clone();
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        manager.connect().await;
        let mut server = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(pings(&server.drain_received()), 1);
        server.push_text("pong");
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.disconnect().await;
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(pings(&server.drain_received()), 0);
        assert_eq!(dialer.attempts(), 1);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_back_off_then_fail() {
        let (connector, mut servers) = ScriptedConnector::new([]);
        let dialer = connector.clone();
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();
        let started = Instant::now();

        manager.connect().await;

        let first = wait_for_status(&mut status, |s| {
            s.state == ConnectionState::Reconnecting && s.attempt == 1
        })
        .await;
        assert!(first
            .reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("retrying in 100ms")));

        let second = wait_for_status(&mut status, |s| {
            s.state == ConnectionState::Reconnecting && s.attempt == 2
        })
        .await;
        assert!(second
            .reason
            .as_deref()
            .is_some_and(|reason| reason.starts_with("retrying in 200ms")));

        let failed = wait_for_status(&mut status, |s| s.state == ConnectionState::Failed).await;
        assert_eq!(failed.attempt, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(dialer.attempts(), 3);
        assert_eq!(manager.status().state, ConnectionState::Failed);

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dialer.attempts(), 3);

        dialer.push_plan(Attempt::Accept);
        manager.reconnect().await;
        let _server = next_server(&mut servers).await;
        let connected =
            wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;
        assert_eq!(connected.attempt, 0);
        assert_eq!(dialer.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_treated_as_failure() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Hang, Attempt::Accept]);
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();
        let started = Instant::now();

        manager.connect().await;

        let retry = wait_for_status(&mut status, |s| s.state == ConnectionState::Reconnecting).await;
        assert!(retry
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("timed out")));

        let _server = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;
        assert!(started.elapsed() >= Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_channel_reconnects() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept, Attempt::Accept]);
        let dialer = connector.clone();
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        manager.connect().await;
        let first = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;

        drop(first);
        wait_for_status(&mut status, |s| s.state == ConnectionState::Reconnecting).await;

        let _second = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;
        assert_eq!(dialer.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_is_treated_as_dead() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept, Attempt::Accept]);
        let dialer = connector.clone();
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        manager.connect().await;
        let _quiet = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;

        let retry = wait_for_status(&mut status, |s| s.state == ConnectionState::Reconnecting).await;
        assert!(retry
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("no inbound traffic")));

        let _next = next_server(&mut servers).await;
        assert_eq!(dialer.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_server_close_does_not_reconnect() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept, Attempt::Accept]);
        let dialer = connector.clone();
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        manager.connect().await;
        let server = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;

        let _ = server.outgoing.send(Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))));

        let closed =
            wait_for_status(&mut status, |s| s.state == ConnectionState::Disconnected).await;
        assert_eq!(closed.reason.as_deref(), Some("closed by server"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.attempts(), 1);

        manager.connect().await;
        let _again = next_server(&mut servers).await;
        assert_eq!(dialer.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connected_channel() {
        let (connector, mut servers) = ScriptedConnector::new([Attempt::Accept]);
        let (manager, _frames) = ConnectionManager::new(settings(3), connector);
        let mut status = manager.subscribe_status();

        assert!(!manager.send("hello"));

        manager.connect().await;
        let mut server = next_server(&mut servers).await;
        wait_for_status(&mut status, |s| s.state == ConnectionState::Connected).await;

        assert!(manager.send("hello"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let received = server.drain_received();
        assert!(matches!(received.as_slice(), [Message::Text(text)] if text == "hello"));

        manager.disconnect().await;
        assert!(!manager.send("again"));
    }
}
