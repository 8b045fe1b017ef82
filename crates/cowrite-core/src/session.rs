//! Session controller for one user in one channel.
//!
//! `CollabSession` ties an [`EditorSurface`] to the wire protocol:
//!
//! 1. Local edits: the surface signals a change, the session diffs its last
//!    snapshot against the surface content and produces an `EditDescriptor`
//! 2. Remote edits: descriptors from other users are applied to the surface
//!    with its change notifications suspended, so they are never re-detected
//!    as local edits
//! 3. Presence: roster frames and cursor updates feed the `PresenceTracker`
//!
//! The session does no I/O. The socket driver in cowrite-daemon owns the
//! connection and the fallback store and calls into the session.

use crate::edit::{EditDescriptor, EditError, detect_change};
use crate::events::{CollabEvent, EventBus};
use crate::fallback::StoreError;
use crate::peer::{CursorPosition, Peer, color_for};
use crate::presence::{CURSOR_IDLE, PresenceError, PresenceTracker, STALE_AFTER};
use crate::protocol::{ProtocolError, UserInfo, WireMessage};
use crate::surface::EditorSurface;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session config: {0}")]
    InvalidConfig(String),

    #[error("Edit error: {0}")]
    Edit(#[from] EditError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identity and presence windows for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_id: String,
    pub user: UserInfo,
    /// Peers unseen for this long are offline.
    pub stale_after: Duration,
    /// Cursors unmoved for this long are hidden.
    pub cursor_idle: Duration,
}

impl SessionConfig {
    /// Config with default windows. The user's color is derived from its id.
    pub fn new(
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let id = user_id.into();
        Self {
            channel_id: channel_id.into(),
            user: UserInfo {
                color: color_for(&id),
                id,
                name: display_name.into(),
            },
            stale_after: STALE_AFTER,
            cursor_idle: CURSOR_IDLE,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.channel_id.is_empty() {
            return Err(SessionError::InvalidConfig("channel id is empty".into()));
        }
        if self.user.id.is_empty() {
            return Err(SessionError::InvalidConfig("user id is empty".into()));
        }
        Ok(())
    }
}

pub struct CollabSession {
    config: SessionConfig,
    surface: Arc<dyn EditorSurface>,
    /// Last snapshot the session has accounted for.
    snapshot: String,
    presence: PresenceTracker,
    events: Arc<EventBus<CollabEvent>>,
}

impl CollabSession {
    pub fn new(config: SessionConfig, surface: Arc<dyn EditorSurface>) -> Result<Self> {
        config.validate()?;
        let snapshot = surface.content();
        Ok(Self {
            config,
            surface,
            snapshot,
            presence: PresenceTracker::new(),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel_id(&self) -> &str {
        &self.config.channel_id
    }

    pub fn user_id(&self) -> &str {
        &self.config.user.id
    }

    pub fn surface(&self) -> &Arc<dyn EditorSurface> {
        &self.surface
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn events(&self) -> &Arc<EventBus<CollabEvent>> {
        &self.events
    }

    /// Frame announcing this user to the channel.
    pub fn join_message(&self) -> WireMessage {
        WireMessage::Join {
            channel_id: self.config.channel_id.clone(),
            user: self.config.user.clone(),
        }
    }

    pub fn operation_message(&self, operation: EditDescriptor) -> WireMessage {
        WireMessage::Operation {
            channel_id: self.config.channel_id.clone(),
            operation,
        }
    }

    pub fn cursor_message(&self, cursor: Option<CursorPosition>) -> WireMessage {
        WireMessage::CursorUpdate {
            channel_id: self.config.channel_id.clone(),
            user_id: self.config.user.id.clone(),
            cursor,
        }
    }

    /// Diff the surface against the last snapshot.
    ///
    /// Returns the descriptor for the local edit, if any, and advances the
    /// snapshot. Call this before applying a remote edit so pending local
    /// typing is not folded into the remote result.
    pub fn on_local_change(&mut self, now_ms: u64) -> Option<EditDescriptor> {
        let current = self.surface.content();
        let change = detect_change(&self.snapshot, &current)?;
        self.snapshot = current;

        let descriptor = change.into_descriptor(self.config.user.id.clone(), now_ms);
        debug!(
            "Local edit at {} in {}",
            descriptor.position, self.config.channel_id
        );
        Some(descriptor)
    }

    /// Apply a descriptor from another user to the surface.
    ///
    /// Returns `Ok(false)` for our own descriptors. Out-of-bounds descriptors
    /// leave the surface untouched and return the `EditError`.
    pub fn apply_remote(&mut self, operation: &EditDescriptor, now_ms: u64) -> Result<bool> {
        if operation.user_id == self.config.user.id {
            return Ok(false);
        }
        self.presence.touch(&operation.user_id, now_ms);

        let current = self.surface.content();
        let next = match operation.apply(&current) {
            Ok(next) => next,
            Err(e) => {
                self.events.emit(CollabEvent::RemoteEditRejected {
                    user_id: operation.user_id.clone(),
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        {
            let _quiet = self.surface.changes().suspend();
            self.surface.set_content(&next);
        }
        self.snapshot = next;

        self.events.emit(CollabEvent::RemoteEditApplied {
            user_id: operation.user_id.clone(),
            position: operation.position,
        });
        Ok(true)
    }

    /// Handle one inbound frame. Frames for other channels are ignored.
    pub fn handle_message(&mut self, message: WireMessage, now_ms: u64) -> Result<()> {
        if message.channel_id() != self.config.channel_id {
            debug!(
                "Ignoring {} for channel {}",
                message.kind(),
                message.channel_id()
            );
            return Ok(());
        }

        match message {
            WireMessage::Join { .. } => {}

            WireMessage::Operation { operation, .. } => {
                self.apply_remote(&operation, now_ms)?;
            }

            WireMessage::CursorUpdate {
                user_id, cursor, ..
            } => {
                if user_id != self.config.user.id
                    && self.presence.update_cursor(&user_id, cursor, now_ms)
                {
                    self.events.emit(CollabEvent::CursorMoved { user_id });
                }
            }

            WireMessage::UserJoined { user, .. } => {
                if user.id != self.config.user.id {
                    let peer = self.presence.add_peer(Peer::from_user_info(&user, now_ms))?;
                    info!("{} joined {}", peer.display_name, self.config.channel_id);
                    self.events.emit(CollabEvent::PeerJoined { user_id: peer.id });
                }
            }

            WireMessage::UserLeft { user_id, .. } => {
                if let Some(peer) = self.presence.remove_peer(&user_id) {
                    info!("{} left {}", peer.display_name, self.config.channel_id);
                    self.events.emit(CollabEvent::PeerLeft { user_id });
                }
            }

            WireMessage::UsersList { users, .. } => {
                let peers: Vec<Peer> = users
                    .iter()
                    .filter(|u| u.id != self.config.user.id)
                    .map(|u| Peer::from_user_info(u, now_ms))
                    .collect();
                debug!(
                    "Roster for {}: {} peer(s)",
                    self.config.channel_id,
                    peers.len()
                );
                self.presence.replace_all(peers);
            }
        }
        Ok(())
    }

    /// Peers seen within the staleness window.
    pub fn connected_users(&self, now_ms: u64) -> Vec<Peer> {
        self.presence.list_online(self.config.stale_after, now_ms)
    }

    pub fn is_user_online(&self, user_id: &str, now_ms: u64) -> bool {
        self.presence
            .is_online(user_id, self.config.stale_after, now_ms)
    }

    /// Periodic housekeeping: hide idle cursors and drop stale peers.
    pub fn tick(&mut self, now_ms: u64) {
        for user_id in self.presence.retire_idle_cursors(self.config.cursor_idle, now_ms) {
            self.events.emit(CollabEvent::CursorMoved { user_id });
        }
        for user_id in self.presence.prune_stale(self.config.stale_after, now_ms) {
            debug!("{} went stale in {}", user_id, self.config.channel_id);
            self.events.emit(CollabEvent::PeerLeft { user_id });
        }
    }
}
