//! WebSocket relay server for collaboration channels.
//!
//! Manages connection lifecycle, channel membership, and message routing.
//! The server holds no document state: it answers `join` with the channel
//! roster, announces arrivals and departures, and relays `operation` and
//! `cursor_update` frames verbatim to the other members of the sender's
//! channel.

use crate::connection::{ClientConnection, ConnectionEvent, IncomingMessage};
use anyhow::Result;
use cowrite_core::{UserInfo, WireMessage};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

/// Upper bound on the WebSocket upgrade of a new connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection whose WebSocket upgrade has completed.
type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

/// A connection that has joined a channel.
#[derive(Debug, Clone)]
struct Member {
    channel_id: String,
    user: UserInfo,
}

/// WebSocket server relaying frames between channel members.
pub struct RelayServer {
    /// Open connections indexed by conn_id
    connections: HashMap<String, ClientConnection>,
    /// Channel membership indexed by conn_id (set on `join`)
    members: HashMap<String, Member>,
    /// Counter for generating connection IDs
    next_conn_id: u64,
    /// Channel sender for connection events (messages, closes)
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Channel receiver for connection events
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Upgrades finished by handshake tasks
    upgraded_tx: mpsc::UnboundedSender<Upgraded>,
    upgraded_rx: mpsc::UnboundedReceiver<Upgraded>,
    handshake_timeout: Duration,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgraded_tx, upgraded_rx) = mpsc::unbounded_channel();

        Self {
            connections: HashMap::new(),
            members: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
            upgraded_tx,
            upgraded_rx,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Override how long a new connection may take to upgrade.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    pub async fn run_until(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some((ws_stream, addr)) = self.upgraded_rx.recv() => {
                    self.register_connection(ws_stream, addr);
                }

                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }

                _ = &mut shutdown => {
                    info!("Relay server shutting down");
                    break;
                }
            }
        }

        for conn in self.connections.values_mut() {
            conn.close().await;
        }
    }

    /// Serve connections from `listener` forever.
    pub async fn run(self, listener: TcpListener) {
        self.run_until(listener, std::future::pending()).await
    }

    /// Upgrade a new TCP connection in its own task.
    ///
    /// The upgraded stream comes back through `upgraded_rx`, so a client that
    /// never finishes the handshake cannot stall the event loop.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let upgraded_tx = self.upgraded_tx.clone();
        let handshake_timeout = self.handshake_timeout;

        tokio::spawn(async move {
            let ws_stream = match timeout(handshake_timeout, accept_async(stream)).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    // Health checks (like `nc -z`) connect and immediately close without
                    // completing the WebSocket handshake. Log these as debug, not error.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
                Err(_) => {
                    warn!("WebSocket upgrade from {} timed out", addr);
                    return;
                }
            };
            let _ = upgraded_tx.send((ws_stream, addr));
        });
    }

    /// Track an upgraded connection.
    fn register_connection(&mut self, ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) {
        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;

        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = ClientConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    /// Apply one connection event to the server state.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(msg) => self.on_message(msg).await,
            ConnectionEvent::Closed { conn_id } => self.on_closed(&conn_id).await,
        }
    }

    async fn on_message(&mut self, msg: IncomingMessage) {
        let IncomingMessage {
            conn_id,
            message,
            raw,
        } = msg;

        match message {
            WireMessage::Join { channel_id, user } => {
                self.on_join(&conn_id, channel_id, user).await;
            }

            WireMessage::Operation { ref channel_id, .. }
            | WireMessage::CursorUpdate { ref channel_id, .. } => {
                let joined = self
                    .members
                    .get(&conn_id)
                    .map(|m| &m.channel_id == channel_id)
                    .unwrap_or(false);
                if !joined {
                    warn!(
                        "Dropping {} from {}: not a member of {}",
                        message.kind(),
                        conn_id,
                        channel_id
                    );
                    return;
                }
                self.relay(channel_id, &raw, Some(&conn_id)).await;
            }

            WireMessage::UserJoined { .. }
            | WireMessage::UserLeft { .. }
            | WireMessage::UsersList { .. } => {
                warn!(
                    "Dropping server-only frame {} from {}",
                    message.kind(),
                    conn_id
                );
            }
        }
    }

    async fn on_join(&mut self, conn_id: &str, channel_id: String, user: UserInfo) {
        if user.id.is_empty() || channel_id.is_empty() {
            warn!("Dropping join with empty ids from {}", conn_id);
            return;
        }

        // A connection is a member of at most one channel.
        if let Some(previous) = self.members.get(conn_id).cloned() {
            if previous.channel_id != channel_id {
                self.leave(conn_id).await;
            }
        }

        info!(
            "{} ({}) joined {} via {}",
            user.name, user.id, channel_id, conn_id
        );
        self.members.insert(
            conn_id.to_string(),
            Member {
                channel_id: channel_id.clone(),
                user: user.clone(),
            },
        );

        let roster = WireMessage::UsersList {
            channel_id: channel_id.clone(),
            users: self.channel_users(&channel_id),
        };
        if let Some(conn) = self.connections.get(conn_id) {
            if let Err(e) = conn.send(&roster).await {
                warn!("Failed to send roster to {}: {}", conn_id, e);
            }
        }

        let joined = WireMessage::UserJoined {
            channel_id: channel_id.clone(),
            user,
        };
        self.broadcast(&channel_id, &joined, Some(conn_id)).await;
    }

    async fn on_closed(&mut self, conn_id: &str) {
        info!("Connection closed: {}", conn_id);
        self.leave(conn_id).await;
        self.connections.remove(conn_id);
    }

    /// Remove a connection from its channel and tell the remaining members.
    async fn leave(&mut self, conn_id: &str) {
        let Some(member) = self.members.remove(conn_id) else {
            return;
        };
        debug!("{} left {} via {}", member.user.id, member.channel_id, conn_id);

        // The same user may still be present through another connection.
        let still_present = self
            .members
            .values()
            .any(|m| m.channel_id == member.channel_id && m.user.id == member.user.id);
        if still_present {
            return;
        }

        let left = WireMessage::UserLeft {
            channel_id: member.channel_id.clone(),
            user_id: member.user.id,
        };
        self.broadcast(&member.channel_id, &left, None).await;
    }

    /// Users currently joined to a channel, one entry per user id.
    fn channel_users(&self, channel_id: &str) -> Vec<UserInfo> {
        let mut seen = HashSet::new();
        let mut users: Vec<UserInfo> = self
            .members
            .values()
            .filter(|m| m.channel_id == channel_id)
            .filter(|m| seen.insert(m.user.id.clone()))
            .map(|m| m.user.clone())
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    async fn broadcast(&mut self, channel_id: &str, message: &WireMessage, exclude: Option<&str>) {
        match message.encode() {
            Ok(text) => self.relay(channel_id, &text, exclude).await,
            Err(e) => error!("Failed to encode {}: {}", message.kind(), e),
        }
    }

    /// Send a text frame to every member of a channel except `exclude`.
    async fn relay(&mut self, channel_id: &str, text: &str, exclude: Option<&str>) {
        for (conn_id, member) in &self.members {
            if member.channel_id != channel_id || Some(conn_id.as_str()) == exclude {
                continue;
            }
            let Some(conn) = self.connections.get(conn_id) else {
                continue;
            };
            if let Err(e) = conn.send_text(text).await {
                warn!("Failed to relay to {}: {}", conn_id, e);
            }
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections joined to `channel_id`.
    pub fn member_count(&self, channel_id: &str) -> usize {
        self.members
            .values()
            .filter(|m| m.channel_id == channel_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserInfo {
        UserInfo {
            id: id.into(),
            name: id.to_uppercase(),
            color: cowrite_core::color_for(id),
        }
    }

    fn member(channel: &str, id: &str) -> Member {
        Member {
            channel_id: channel.into(),
            user: user(id),
        }
    }

    #[test]
    fn test_channel_users_scoped_and_deduplicated() {
        let mut server = RelayServer::new();
        server.members.insert("conn-1".into(), member("doc", "bob"));
        server.members.insert("conn-2".into(), member("doc", "alice"));
        server.members.insert("conn-3".into(), member("doc", "bob"));
        server.members.insert("conn-4".into(), member("other", "carol"));

        let ids: Vec<_> = server
            .channel_users("doc")
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(server.member_count("doc"), 3);
        assert_eq!(server.member_count("other"), 1);
    }

    #[tokio::test]
    async fn test_close_of_unjoined_connection() {
        let mut server = RelayServer::new();
        server
            .handle_event(ConnectionEvent::Closed {
                conn_id: "conn-9".into(),
            })
            .await;
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_operation_from_non_member_is_dropped() {
        let mut server = RelayServer::new();
        server.members.insert("conn-2".into(), member("doc", "bob"));

        let message = WireMessage::Operation {
            channel_id: "doc".into(),
            operation: cowrite_core::EditDescriptor::insert(0, "x", "mallory", 1),
        };
        let raw = message.encode().unwrap();
        server
            .handle_event(ConnectionEvent::Message(IncomingMessage {
                conn_id: "conn-1".into(),
                message,
                raw,
            }))
            .await;

        assert!(!server.members.contains_key("conn-1"));
    }
}
