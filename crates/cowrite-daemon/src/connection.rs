//! Individual client connection management.
//!
//! Each client connection wraps a WebSocket stream, handling the split
//! between read and write halves for async operation. Inbound frames are
//! decoded here; frames that fail to decode are logged and dropped.

use anyhow::{Result, anyhow};
use cowrite_core::WireMessage;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Frame received from a client connection.
#[derive(Debug)]
pub struct IncomingMessage {
    /// Connection ID assigned by the server (e.g., "conn-1")
    pub conn_id: String,
    /// Decoded frame
    pub message: WireMessage,
    /// Original text, relayed verbatim
    pub raw: String,
}

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Received a well-formed frame from the client
    Message(IncomingMessage),
    /// Connection was closed
    Closed { conn_id: String },
}

type WsSink = futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// A single WebSocket connection to a client.
pub struct ClientConnection {
    pub conn_id: String,
    /// Write half of the WebSocket (wrapped for sharing across tasks)
    write: Arc<Mutex<WsSink>>,
    /// Handle to the read task
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Create a new client connection from a WebSocket stream.
    ///
    /// Spawns a read task that forwards frames to the event channel.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write,
            read_task: Some(read_task),
        }
    }

    /// Read loop that forwards frames to the event channel.
    async fn read_loop(
        conn_id: String,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let raw = match msg {
                        Message::Text(text) => text,
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Non-UTF-8 binary frame from {}, dropping", conn_id);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", conn_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    let message = match WireMessage::decode(&raw) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Dropping frame from {}: {}", conn_id, e);
                            continue;
                        }
                    };

                    debug!("{} from {} ({} bytes)", message.kind(), conn_id, raw.len());
                    let _ = event_tx.send(ConnectionEvent::Message(IncomingMessage {
                        conn_id: conn_id.clone(),
                        message,
                        raw,
                    }));
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            }
        }

        // Notify that connection is closed
        let _ = event_tx.send(ConnectionEvent::Closed {
            conn_id: conn_id.clone(),
        });
    }

    /// Send a text frame to the client.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::text(text))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Encode and send a protocol frame.
    pub async fn send(&self, message: &WireMessage) -> Result<()> {
        let text = message.encode()?;
        self.send_text(&text).await
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        // Send close frame
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }

        // Abort the read task
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
