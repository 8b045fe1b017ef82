//! Peer identity and display metadata.

use crate::protocol::UserInfo;
use serde::{Deserialize, Serialize};

/// Where a peer's caret sits.
///
/// Serialized untagged: `{"offset":12}` or `{"line":3,"column":7}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorPosition {
    Offset { offset: usize },
    LineColumn { line: u32, column: u32 },
}

/// A known participant in the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    /// Deterministic color derived from `id`.
    pub color_tag: String,
    /// Last activity, ms since epoch.
    pub last_seen_at: u64,
    pub cursor: Option<CursorPosition>,
    /// When `cursor` was last moved, ms since epoch.
    pub cursor_updated_at: Option<u64>,
}

impl Peer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, now_ms: u64) -> Self {
        let id = id.into();
        Self {
            color_tag: color_for(&id),
            id,
            display_name: display_name.into(),
            last_seen_at: now_ms,
            cursor: None,
            cursor_updated_at: None,
        }
    }

    /// Build from a join announcement. The announced color is kept as-is.
    pub fn from_user_info(info: &UserInfo, now_ms: u64) -> Self {
        Self {
            id: info.id.clone(),
            display_name: info.name.clone(),
            color_tag: info.color.clone(),
            last_seen_at: now_ms,
            cursor: None,
            cursor_updated_at: None,
        }
    }

    pub fn to_user_info(&self) -> UserInfo {
        UserInfo {
            id: self.id.clone(),
            name: self.display_name.clone(),
            color: self.color_tag.clone(),
        }
    }
}

/// Stable CSS color for a user id: FNV-1a hash mapped onto the hue wheel.
pub fn color_for(id: &str) -> String {
    let hue = fnv1a_hash(id) % 360;
    format!("hsl({}, 70%, 50%)", hue)
}

/// Stable across Rust versions (unlike DefaultHasher).
fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
