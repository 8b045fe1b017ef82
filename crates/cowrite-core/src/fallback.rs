//! Fallback sync through a shared local store.
//!
//! When the collaboration server stays unreachable, peers on the same device
//! exchange edits through a key/value store instead. Each channel owns one
//! key holding the most recent edit as JSON:
//!
//! ```text
//! cowrite:<channelId> = {"userId":"...","operation":{...},"timestamp":1700000000000}
//! ```
//!
//! Writers overwrite the key on every local edit; readers poll it and apply
//! records written by someone else that are newer than the last one seen.
//! Edits made between two polls overwrite each other, so this mode is lossy.
//!
//! Implementations of [`LocalStore`]:
//! - `InMemoryStore` - Shared within one process (and for testing)
//! - `DirStore` (in cowrite-daemon) - One file per key in a shared directory

use crate::edit::EditDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default interval between fallback polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Records stamped further than this ahead of the reader's clock are ignored.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// String key/value store shared by peers on one device.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store. Clone the `Arc` to share it between sessions.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Stored value under a channel key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackRecord {
    pub user_id: String,
    pub operation: EditDescriptor,
    /// When the record was written, ms since epoch.
    pub timestamp: u64,
}

/// Store key for a channel.
pub fn fallback_key(channel_id: &str) -> String {
    format!("cowrite:{}", channel_id)
}

/// One user's view of a channel's fallback key.
pub struct FallbackChannel {
    store: Arc<dyn LocalStore>,
    key: String,
    user_id: String,
    /// Timestamp of the newest record already handled.
    last_seen: u64,
}

impl FallbackChannel {
    pub fn new(store: Arc<dyn LocalStore>, channel_id: &str, user_id: impl Into<String>) -> Self {
        Self {
            store,
            key: fallback_key(channel_id),
            user_id: user_id.into(),
            last_seen: 0,
        }
    }

    /// Ignore records written before `timestamp`.
    ///
    /// Used at session start so a record left over from an earlier session is
    /// not replayed onto the current document.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.last_seen = self.last_seen.max(timestamp.saturating_sub(1));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Overwrite the channel key with our latest edit.
    ///
    /// Record timestamps are strictly increasing per channel view, so two
    /// edits within the same millisecond are still both picked up by readers.
    pub async fn publish(&mut self, operation: &EditDescriptor, now_ms: u64) -> Result<u64> {
        let timestamp = now_ms.max(self.last_seen.saturating_add(1));
        let record = FallbackRecord {
            user_id: self.user_id.clone(),
            operation: operation.clone(),
            timestamp,
        };
        let json = serde_json::to_string(&record)?;
        self.store.set(&self.key, &json).await?;
        self.last_seen = timestamp;
        debug!("Wrote fallback record to {} at {}", self.key, timestamp);
        Ok(timestamp)
    }

    /// Check the channel key for an edit we have not handled yet.
    ///
    /// Returns the stored operation when it was written by another user and
    /// is newer than anything seen so far. Unparseable values and records
    /// stamped more than [`MAX_CLOCK_SKEW`] past `now_ms` are skipped.
    pub async fn poll(&mut self, now_ms: u64) -> Result<Option<EditDescriptor>> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(None);
        };

        let record: FallbackRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable fallback record at {}: {}", self.key, e);
                return Ok(None);
            }
        };

        if record.timestamp <= self.last_seen {
            return Ok(None);
        }
        let horizon = now_ms.saturating_add(MAX_CLOCK_SKEW.as_millis() as u64);
        if record.timestamp > horizon {
            warn!(
                "Ignoring fallback record at {} stamped {} (now {})",
                self.key, record.timestamp, now_ms
            );
            return Ok(None);
        }
        self.last_seen = record.timestamp;

        if record.user_id == self.user_id {
            return Ok(None);
        }

        Ok(Some(record.operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 10_000;

    fn shared_store() -> Arc<dyn LocalStore> {
        Arc::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[test]
    fn test_fallback_key_layout() {
        assert_eq!(fallback_key("doc-42"), "cowrite:doc-42");
    }

    #[tokio::test]
    async fn test_publish_then_peer_polls() {
        let store = shared_store();
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc", "alice");
        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc", "bob");

        let op = EditDescriptor::insert(5, " world", "alice", 1000);
        alice.publish(&op, 1000).await.unwrap();

        assert_eq!(bob.poll(NOW).await.unwrap(), Some(op));
        // Already handled.
        assert_eq!(bob.poll(NOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_own_record_is_ignored() {
        let store = shared_store();
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc", "alice");

        alice
            .publish(&EditDescriptor::insert(0, "x", "alice", 1), 1)
            .await
            .unwrap();
        assert_eq!(alice.poll(NOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let store = shared_store();
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc-a", "alice");
        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc-b", "bob");

        alice
            .publish(&EditDescriptor::insert(0, "x", "alice", 1), 1)
            .await
            .unwrap();
        assert_eq!(bob.poll(NOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_newer_record_after_own_write() {
        let store = shared_store();
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc", "alice");
        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc", "bob");

        bob.publish(&EditDescriptor::insert(0, "b", "bob", 10), 10)
            .await
            .unwrap();
        let later = EditDescriptor::delete(0, 1, "alice", 20);
        alice.publish(&later, 20).await.unwrap();

        assert_eq!(bob.poll(NOW).await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_leftover_record_not_replayed() {
        let store = shared_store();
        let mut earlier = FallbackChannel::new(Arc::clone(&store), "doc", "alice");
        earlier
            .publish(&EditDescriptor::insert(0, "old", "alice", 100), 100)
            .await
            .unwrap();

        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc", "bob").since(200);
        assert_eq!(bob.poll(NOW).await.unwrap(), None);

        // Written in the same millisecond the reader started.
        let racing = EditDescriptor::insert(0, "racing", "alice", 200);
        earlier.publish(&racing, 200).await.unwrap();
        assert_eq!(bob.poll(NOW).await.unwrap(), Some(racing));

        let fresh = EditDescriptor::insert(0, "new", "alice", 300);
        earlier.publish(&fresh, 300).await.unwrap();
        assert_eq!(bob.poll(NOW).await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_unreadable_record_skipped() {
        let store = shared_store();
        store.set(&fallback_key("doc"), "{not json").await.unwrap();

        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc", "bob");
        assert_eq!(bob.poll(NOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_millisecond_publishes_both_seen() {
        let store = shared_store();
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc", "alice");
        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc", "bob");

        let first = EditDescriptor::insert(0, "a", "alice", 500);
        assert_eq!(alice.publish(&first, 500).await.unwrap(), 500);
        assert_eq!(bob.poll(NOW).await.unwrap(), Some(first));

        let second = EditDescriptor::insert(1, "b", "alice", 500);
        assert_eq!(alice.publish(&second, 500).await.unwrap(), 501);
        assert_eq!(bob.poll(NOW).await.unwrap(), Some(second));
    }

    #[test]
    fn test_record_wire_shape() {
        let record = FallbackRecord {
            user_id: "alice".into(),
            operation: EditDescriptor::insert(1, "a", "alice", 5),
            timestamp: 5,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["userId"], "alice");
        assert_eq!(value["operation"]["type"], "insert");
        assert_eq!(value["timestamp"], 5);
    }

    #[tokio::test]
    async fn test_far_future_record_does_not_wedge_the_channel() {
        let store = shared_store();
        let poisoned = FallbackRecord {
            user_id: "mallory".into(),
            operation: EditDescriptor::insert(0, "x", "mallory", u64::MAX),
            timestamp: u64::MAX,
        };
        store
            .set(&fallback_key("doc"), &serde_json::to_string(&poisoned).unwrap())
            .await
            .unwrap();

        let mut bob = FallbackChannel::new(Arc::clone(&store), "doc", "bob");
        assert_eq!(bob.poll(NOW).await.unwrap(), None);

        // Publishing still works, and later records are still picked up.
        assert_eq!(
            bob.publish(&EditDescriptor::insert(0, "b", "bob", NOW), NOW)
                .await
                .unwrap(),
            NOW
        );
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc", "alice");
        let fresh = EditDescriptor::insert(1, "a", "alice", NOW + 1);
        alice.publish(&fresh, NOW + 1).await.unwrap();
        assert_eq!(bob.poll(NOW + 1).await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_publish_after_max_timestamp_does_not_overflow() {
        let store = shared_store();
        let mut alice = FallbackChannel::new(Arc::clone(&store), "doc", "alice").since(u64::MAX);
        let stamped = alice
            .publish(&EditDescriptor::insert(0, "a", "alice", 1), 1)
            .await
            .unwrap();
        assert_eq!(stamped, u64::MAX);
    }
}
