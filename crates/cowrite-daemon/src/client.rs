//! Collaboration client: the host-facing handle and its socket driver.
//!
//! `CollabClient::start_collaboration` spawns one task that owns everything
//! with side effects:
//! - Connection establishment and the `join` announcement
//! - Sending local edits and cursor updates, applying inbound frames
//! - Automatic reconnection with exponential backoff
//! - Permanent switch to the local-store fallback once retries run out
//!
//! While the socket is down (backing off or in fallback), local edits are
//! written to the fallback store and the store is polled for edits from
//! other users on the same machine.
//!
//! `disconnect()` signals the task and waits for it, so no reconnect attempt
//! can fire afterwards.

use anyhow::Result;
use cowrite_core::{
    CollabEvent, CollabSession, CursorPosition, EditDescriptor, EditorSurface, EventBus,
    FallbackChannel, LocalStore, Peer, ReconnectConfig, ReconnectState, SessionConfig,
    Subscription, WireMessage, now_ms,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, interval_at, sleep_until, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Upper bound on a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How the client is currently exchanging edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// First connection attempt in progress
    Connecting,
    /// Socket open and joined
    Connected,
    /// Socket down, waiting for the next attempt
    Reconnecting,
    /// Retries exhausted; syncing through the local store
    Fallback,
    /// Disconnected by the host
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server URL (ws:// or wss://)
    pub server_url: String,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    /// How often the fallback store is checked while disconnected
    pub poll_interval: Duration,
    /// How often presence housekeeping runs
    pub tick_interval: Duration,
    /// How often our presence is re-announced while connected
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, session: SessionConfig) -> Self {
        Self {
            server_url: server_url.into(),
            session,
            reconnect: ReconnectConfig::default(),
            poll_interval: cowrite_core::fallback::POLL_INTERVAL,
            tick_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Handle to a running collaboration session.
pub struct CollabClient {
    session: Arc<Mutex<CollabSession>>,
    events: Arc<EventBus<CollabEvent>>,
    mode_rx: watch::Receiver<TransportMode>,
    cursor_tx: mpsc::UnboundedSender<Option<CursorPosition>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    /// Keeps the surface subscription alive; dropping it stops change signals.
    _changes: Subscription<String>,
}

impl CollabClient {
    /// Start synchronizing `surface` with the channel in `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_collaboration(
        config: ClientConfig,
        surface: Arc<dyn EditorSurface>,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self> {
        let session = CollabSession::new(config.session.clone(), Arc::clone(&surface))?;
        let events = Arc::clone(session.events());

        // The callback only signals; the driver re-reads the surface itself.
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let changes = surface.changes().subscribe(move |_: &String| {
            let _ = changes_tx.send(());
        });

        let (cursor_tx, cursor_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(TransportMode::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let fallback = FallbackChannel::new(
            store,
            &config.session.channel_id,
            config.session.user.id.clone(),
        )
        .since(now_ms());

        info!(
            "Starting collaboration on {} as {} ({})",
            config.session.channel_id, config.session.user.name, config.session.user.id
        );

        let session = Arc::new(Mutex::new(session));
        let driver = Driver {
            config,
            session: Arc::clone(&session),
            events: Arc::clone(&events),
            fallback,
            reconnect: ReconnectState::new(),
            mode_tx,
            changes_rx,
            cursor_rx,
            shutdown_rx,
            cursor: None,
            cursor_moved_at: 0,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            session,
            events,
            mode_rx,
            cursor_tx,
            shutdown_tx,
            task: Some(task),
            _changes: changes,
        })
    }

    /// Stop syncing. Waits for the driver task, so no retry fires afterwards.
    pub async fn disconnect(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Client task failed: {}", e);
                }
            }
        }
    }

    /// Peers seen within the staleness window, sorted by id.
    pub async fn connected_users(&self) -> Vec<Peer> {
        self.session.lock().await.connected_users(now_ms())
    }

    pub async fn is_user_online(&self, user_id: &str) -> bool {
        self.session.lock().await.is_user_online(user_id, now_ms())
    }

    /// Announce our cursor position (or `None` to hide it).
    pub fn send_cursor(&self, cursor: Option<CursorPosition>) {
        let _ = self.cursor_tx.send(cursor);
    }

    pub fn mode(&self) -> TransportMode {
        *self.mode_rx.borrow()
    }

    /// Receiver notified on every transport mode change.
    pub fn mode_changes(&self) -> watch::Receiver<TransportMode> {
        self.mode_rx.clone()
    }

    /// Session events: connection changes, applied edits, presence.
    pub fn events(&self) -> &Arc<EventBus<CollabEvent>> {
        &self.events
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Why a driver phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Lost,
    Elapsed,
}

/// The task behind a `CollabClient`.
struct Driver {
    config: ClientConfig,
    session: Arc<Mutex<CollabSession>>,
    events: Arc<EventBus<CollabEvent>>,
    fallback: FallbackChannel,
    reconnect: ReconnectState,
    mode_tx: watch::Sender<TransportMode>,
    changes_rx: mpsc::UnboundedReceiver<()>,
    cursor_rx: mpsc::UnboundedReceiver<Option<CursorPosition>>,
    shutdown_rx: watch::Receiver<bool>,
    /// Our last announced cursor
    cursor: Option<CursorPosition>,
    cursor_moved_at: u64,
}

impl Driver {
    async fn run(mut self) {
        let url = self.config.server_url.clone();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let attempt = tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                result = timeout(CONNECT_TIMEOUT, connect_async(url.as_str())) => result,
            };

            match attempt {
                Ok(Ok((ws, _))) => {
                    info!("Connected to {}", url);
                    self.reconnect.reset();
                    self.set_mode(TransportMode::Connected);
                    self.events.emit(CollabEvent::Connected);

                    let exit = self.run_connected(ws).await;
                    self.events.emit(CollabEvent::Disconnected);
                    if exit == Exit::Shutdown {
                        break;
                    }
                    warn!("Lost connection to {}", url);
                }
                Ok(Err(e)) => warn!("Failed to connect to {}: {}", url, e),
                Err(_) => warn!("Timed out connecting to {}", url),
            }

            match self.reconnect.schedule_reconnect(&self.config.reconnect) {
                Some(delay) => {
                    info!(
                        "Reconnecting to {} in {:?} (attempt {})",
                        url, delay, self.reconnect.attempts
                    );
                    self.set_mode(TransportMode::Reconnecting);
                    self.events.emit(CollabEvent::Reconnecting {
                        attempt: self.reconnect.attempts,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if self.run_offline(Some(delay)).await == Exit::Shutdown {
                        break;
                    }
                }
                None => {
                    warn!(
                        "Giving up on {} after {} attempts; syncing through the local store",
                        url, self.reconnect.attempts
                    );
                    self.set_mode(TransportMode::Fallback);
                    self.events.emit(CollabEvent::FallbackActivated);
                    self.run_offline(None).await;
                    break;
                }
            }
        }

        self.set_mode(TransportMode::Closed);
        debug!("Client driver stopped");
    }

    /// Pump one open socket until it drops or shutdown is requested.
    async fn run_connected(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut source): (WsSink, WsSource) = ws.split();

        let join = self.session.lock().await.join_message();
        if let Err(e) = send_frame(&mut sink, &join).await {
            warn!("Failed to send join: {}", e);
            return Exit::Lost;
        }

        // Edits made while the socket was down go out now.
        if self.flush_local_connected(&mut sink).await.is_err() {
            return Exit::Lost;
        }

        let mut tick = interval(self.config.tick_interval);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.on_frame(&text, &mut sink).await.is_err() {
                            return Exit::Lost;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => warn!("Dropping binary frame from server"),
                    Some(Ok(Message::Close(_))) | None => return Exit::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return Exit::Lost;
                    }
                },

                Some(()) = self.changes_rx.recv() => {
                    self.drain_change_signals();
                    if self.flush_local_connected(&mut sink).await.is_err() {
                        return Exit::Lost;
                    }
                }

                Some(cursor) = self.cursor_rx.recv() => {
                    self.note_cursor(cursor);
                    let message = self.session.lock().await.cursor_message(cursor);
                    if send_frame(&mut sink, &message).await.is_err() {
                        return Exit::Lost;
                    }
                }

                _ = tick.tick() => {
                    self.session.lock().await.tick(now_ms());
                }

                _ = heartbeat.tick() => {
                    let message = self.session.lock().await.cursor_message(self.heartbeat_cursor());
                    if send_frame(&mut sink, &message).await.is_err() {
                        return Exit::Lost;
                    }
                }
            }
        }
    }

    /// Work without a socket: fallback store in, fallback store out.
    ///
    /// Returns after `until` has elapsed, or never (until shutdown) when
    /// `until` is `None`.
    async fn run_offline(&mut self, until: Option<Duration>) -> Exit {
        let deadline = until.map(|d| Instant::now() + d);
        let mut poll = interval(self.config.poll_interval);
        let mut tick = interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return Exit::Shutdown,

                _ = sleep_until_deadline(deadline) => return Exit::Elapsed,

                Some(()) = self.changes_rx.recv() => {
                    self.drain_change_signals();
                    self.flush_local_offline().await;
                }

                Some(cursor) = self.cursor_rx.recv() => self.note_cursor(cursor),

                _ = poll.tick() => self.poll_fallback().await,

                _ = tick.tick() => {
                    self.session.lock().await.tick(now_ms());
                }
            }
        }
    }

    async fn on_frame(&mut self, text: &str, sink: &mut WsSink) -> Result<()> {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame from server: {}", e);
                return Ok(());
            }
        };
        let kind = message.kind();

        // Account for pending local typing before the surface is rewritten.
        if matches!(message, WireMessage::Operation { .. }) {
            self.flush_local_connected(sink).await?;
        }

        let result = self.session.lock().await.handle_message(message, now_ms());
        if let Err(e) = result {
            warn!("Dropping {}: {}", kind, e);
        }
        Ok(())
    }

    /// Send the pending local edit, if any.
    ///
    /// A failed send writes the edit to the fallback store instead and
    /// reports the connection as lost.
    async fn flush_local_connected(&mut self, sink: &mut WsSink) -> Result<()> {
        let Some(operation) = self.session.lock().await.on_local_change(now_ms()) else {
            return Ok(());
        };
        let position = operation.position;
        let message = WireMessage::Operation {
            channel_id: self.config.session.channel_id.clone(),
            operation,
        };

        match send_frame(&mut *sink, &message).await {
            Ok(()) => {
                self.events.emit(CollabEvent::LocalEditSent { position });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send edit, writing it to the local store: {}", e);
                if let WireMessage::Operation { operation, .. } = &message {
                    self.publish_fallback(operation).await;
                }
                Err(e)
            }
        }
    }

    async fn flush_local_offline(&mut self) {
        let operation = self.session.lock().await.on_local_change(now_ms());
        if let Some(operation) = operation {
            self.publish_fallback(&operation).await;
        }
    }

    async fn publish_fallback(&mut self, operation: &EditDescriptor) {
        match self.fallback.publish(operation, now_ms()).await {
            Ok(_) => {
                debug!("Wrote edit at {} to {}", operation.position, self.fallback.key());
                self.events.emit(CollabEvent::LocalEditSent {
                    position: operation.position,
                });
            }
            Err(e) => warn!("Failed to write edit to the local store: {}", e),
        }
    }

    async fn poll_fallback(&mut self) {
        let operation = match self.fallback.poll(now_ms()).await {
            Ok(Some(operation)) => operation,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read the local store: {}", e);
                return;
            }
        };

        self.flush_local_offline().await;
        let result = self.session.lock().await.apply_remote(&operation, now_ms());
        match result {
            Ok(_) => debug!("Applied fallback edit from {}", operation.user_id),
            Err(e) => warn!("Dropping fallback edit from {}: {}", operation.user_id, e),
        }
    }

    fn drain_change_signals(&mut self) {
        while self.changes_rx.try_recv().is_ok() {}
    }

    fn note_cursor(&mut self, cursor: Option<CursorPosition>) {
        self.cursor = cursor;
        self.cursor_moved_at = now_ms();
    }

    /// Cursor to re-announce: the last one, unless it has gone idle.
    fn heartbeat_cursor(&self) -> Option<CursorPosition> {
        let idle = self.config.session.cursor_idle.as_millis() as u64;
        self.cursor
            .filter(|_| now_ms().saturating_sub(self.cursor_moved_at) <= idle)
    }

    fn set_mode(&self, mode: TransportMode) {
        let previous = self.mode_tx.send_replace(mode);
        if previous != mode {
            debug!("Transport mode {:?} -> {:?}", previous, mode);
        }
    }
}

async fn send_frame(sink: &mut WsSink, message: &WireMessage) -> Result<()> {
    let text = message.encode()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::{InMemoryStore, InMemorySurface};

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("ws://localhost:8080", SessionConfig::new("doc", "a", "A"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_session() {
        let config = ClientConfig::new("ws://127.0.0.1:1", SessionConfig::new("", "a", "A"));
        let result = CollabClient::start_collaboration(
            config,
            Arc::new(InMemorySurface::default()),
            Arc::new(InMemoryStore::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_stops_retries() {
        let mut config = ClientConfig::new("ws://127.0.0.1:1", SessionConfig::new("doc", "a", "A"));
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_secs(60),
            ..ReconnectConfig::default()
        };

        let mut client = CollabClient::start_collaboration(
            config,
            Arc::new(InMemorySurface::default()),
            Arc::new(InMemoryStore::new()),
        )
        .unwrap();

        let mut modes = client.mode_changes();
        tokio::time::timeout(
            Duration::from_secs(5),
            modes.wait_for(|m| *m == TransportMode::Reconnecting),
        )
        .await
        .expect("Timeout waiting for backoff")
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.disconnect())
            .await
            .expect("disconnect should not wait out the backoff");
        assert_eq!(client.mode(), TransportMode::Closed);
    }
}
