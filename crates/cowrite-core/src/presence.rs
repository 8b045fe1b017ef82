//! Presence roster for peers sharing a channel.
//!
//! Tracks who is in the channel and where their cursors are, independently of
//! text convergence. Timestamps are passed in by the caller (ms since epoch)
//! so that expiry is deterministic under test.
//!
//! Two windows apply:
//! - peers not seen for [`STALE_AFTER`] are treated as offline
//! - cursors not moved for [`CURSOR_IDLE`] are retired from display

use crate::peer::{CursorPosition, Peer};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

/// Peers unseen for this long are offline.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// Cursors unmoved for this long are hidden.
pub const CURSOR_IDLE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Peer ID cannot be empty")]
    EmptyId,
}

/// Roster of known peers.
///
/// Thread-safe for use from the client task and host queries.
/// Wrap in `Arc` for shared ownership.
#[derive(Default)]
pub struct PresenceTracker {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, or refresh an existing one's metadata and `last_seen_at`.
    ///
    /// An existing cursor is kept when the peer re-announces itself.
    pub fn add_peer(&self, peer: Peer) -> Result<Peer, PresenceError> {
        if peer.id.is_empty() {
            return Err(PresenceError::EmptyId);
        }

        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let entry = peers
            .entry(peer.id.clone())
            .and_modify(|existing| {
                existing.display_name = peer.display_name.clone();
                existing.color_tag = peer.color_tag.clone();
                existing.last_seen_at = existing.last_seen_at.max(peer.last_seen_at);
            })
            .or_insert(peer);
        Ok(entry.clone())
    }

    /// Remove a peer. Returns the removed entry if it was known.
    pub fn remove_peer(&self, id: &str) -> Option<Peer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Replace the roster wholesale (used for `users_list`).
    ///
    /// Cursors of peers that remain in the roster survive the replacement.
    pub fn replace_all(&self, incoming: Vec<Peer>) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::with_capacity(incoming.len());
        for mut peer in incoming {
            if peer.id.is_empty() {
                continue;
            }
            if let Some(old) = peers.get(&peer.id) {
                peer.cursor = old.cursor;
                peer.cursor_updated_at = old.cursor_updated_at;
            }
            next.insert(peer.id.clone(), peer);
        }
        *peers = next;
    }

    /// Move a peer's cursor. Also counts as activity.
    ///
    /// Re-announcing the current position only refreshes `last_seen_at`; the
    /// cursor's idle clock keeps running. Returns false for unknown peers.
    pub fn update_cursor(&self, id: &str, cursor: Option<CursorPosition>, now_ms: u64) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(id) {
            Some(peer) => {
                if peer.cursor != cursor {
                    peer.cursor = cursor;
                    peer.cursor_updated_at = cursor.map(|_| now_ms);
                }
                peer.last_seen_at = now_ms;
                true
            }
            None => false,
        }
    }

    /// Record activity from a peer without changing anything else.
    pub fn touch(&self, id: &str, now_ms: u64) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get_mut(id) {
            peer.last_seen_at = now_ms;
        }
    }

    /// Peers seen within `threshold` of `now_ms`.
    pub fn list_online(&self, threshold: Duration, now_ms: u64) -> Vec<Peer> {
        let mut online: Vec<Peer> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| is_fresh(p.last_seen_at, threshold, now_ms))
            .cloned()
            .collect();
        online.sort_by(|a, b| a.id.cmp(&b.id));
        online
    }

    pub fn is_online(&self, id: &str, threshold: Duration, now_ms: u64) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|p| is_fresh(p.last_seen_at, threshold, now_ms))
            .unwrap_or(false)
    }

    /// Clear cursors that have not moved within `idle`.
    ///
    /// Returns the ids whose cursors were retired.
    pub fn retire_idle_cursors(&self, idle: Duration, now_ms: u64) -> Vec<String> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut retired = Vec::new();
        for peer in peers.values_mut() {
            if let Some(moved_at) = peer.cursor_updated_at {
                if !is_fresh(moved_at, idle, now_ms) {
                    peer.cursor = None;
                    peer.cursor_updated_at = None;
                    retired.push(peer.id.clone());
                }
            }
        }
        retired
    }

    /// Drop peers not seen within `threshold`. Returns the removed ids.
    pub fn prune_stale(&self, threshold: Duration, now_ms: u64) -> Vec<String> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = peers
            .values()
            .filter(|p| !is_fresh(p.last_seen_at, threshold, now_ms))
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// All known peers regardless of freshness.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `seen_at` lies within `window` of `now_ms`. Future timestamps count as fresh.
fn is_fresh(seen_at: u64, window: Duration, now_ms: u64) -> bool {
    now_ms.saturating_sub(seen_at) <= window.as_millis() as u64
}
