//! Edit descriptors: detection from snapshot pairs and application to snapshots.
//!
//! Offsets are counted in `char`s (Unicode scalar values), so a descriptor can
//! never land inside a multi-byte UTF-8 sequence.
//!
//! # Limitations
//!
//! The operation model is a common-prefix diff, not an OT or CRDT structure.
//! Two peers editing concurrently can apply each other's descriptors against
//! snapshots that have already moved, and nothing here detects or repairs the
//! resulting divergence. Equal-length replacements are also reported as an
//! insert of the remainder (see [`detect_change`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("Edit out of bounds: position {position} + length {length} exceeds snapshot length {len}")]
    OutOfBounds {
        position: usize,
        length: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, EditError>;

/// What an edit does at its position.
///
/// Serialized with the `"type"` tag used on the wire:
/// `{"type":"insert","content":"..."}` or `{"type":"delete","length":3}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EditKind {
    Insert { content: String },
    Delete { length: usize },
}

impl EditKind {
    /// Number of chars this edit adds (positive) or removes (negative).
    pub fn len_delta(&self) -> isize {
        match self {
            EditKind::Insert { content } => content.chars().count() as isize,
            EditKind::Delete { length } => -(*length as isize),
        }
    }
}

/// A change found by diffing two snapshots, before it is stamped with an origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub position: usize,
    pub kind: EditKind,
}

impl TextChange {
    /// Stamp this change with its originating user and production time.
    pub fn into_descriptor(self, user_id: impl Into<String>, timestamp: u64) -> EditDescriptor {
        EditDescriptor {
            kind: self.kind,
            position: self.position,
            user_id: user_id.into(),
            timestamp,
        }
    }
}

/// An edit as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditDescriptor {
    #[serde(flatten)]
    pub kind: EditKind,
    pub position: usize,
    pub user_id: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: u64,
}

impl EditDescriptor {
    pub fn insert(position: usize, content: impl Into<String>, user_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind: EditKind::Insert {
                content: content.into(),
            },
            position,
            user_id: user_id.into(),
            timestamp,
        }
    }

    pub fn delete(position: usize, length: usize, user_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind: EditKind::Delete { length },
            position,
            user_id: user_id.into(),
            timestamp,
        }
    }

    /// Apply this descriptor to `snapshot`.
    pub fn apply(&self, snapshot: &str) -> Result<String> {
        apply_edit(snapshot, &self.kind, self.position)
    }
}

/// Compare two snapshots and describe the edit that turns `previous` into `current`.
///
/// Finds the common prefix length `p`, then:
/// - `current` longer: insert of the `len(current) - len(previous)` chars at `p`
/// - `current` shorter: delete of `len(previous) - len(current)` chars at `p`
/// - same length but different: insert of everything in `current` from `p` on
///
/// The last case does not remove the replaced text, so applying it elsewhere
/// does not reproduce `current`. Returns `None` when the snapshots are equal.
pub fn detect_change(previous: &str, current: &str) -> Option<TextChange> {
    let prefix = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();

    let prev_len = previous.chars().count();
    let cur_len = current.chars().count();

    if prefix == prev_len && prefix == cur_len {
        return None;
    }

    let kind = if cur_len > prev_len {
        let content = current
            .chars()
            .skip(prefix)
            .take(cur_len - prev_len)
            .collect();
        EditKind::Insert { content }
    } else if cur_len < prev_len {
        EditKind::Delete {
            length: prev_len - cur_len,
        }
    } else {
        EditKind::Insert {
            content: current.chars().skip(prefix).collect(),
        }
    };

    Some(TextChange {
        position: prefix,
        kind,
    })
}

/// Apply an edit at `position` (in chars) to `snapshot`, returning the new snapshot.
///
/// Rejects positions that fall outside the snapshot instead of guessing.
pub fn apply_edit(snapshot: &str, kind: &EditKind, position: usize) -> Result<String> {
    let len = snapshot.chars().count();
    let length = match kind {
        EditKind::Insert { .. } => 0,
        EditKind::Delete { length } => *length,
    };

    if position > len || position.saturating_add(length) > len {
        return Err(EditError::OutOfBounds {
            position,
            length,
            len,
        });
    }

    let start = byte_offset(snapshot, position);
    match kind {
        EditKind::Insert { content } => {
            let mut out = String::with_capacity(snapshot.len() + content.len());
            out.push_str(&snapshot[..start]);
            out.push_str(content);
            out.push_str(&snapshot[start..]);
            Ok(out)
        }
        EditKind::Delete { length } => {
            let end = byte_offset(snapshot, position + length);
            let mut out = String::with_capacity(snapshot.len() - (end - start));
            out.push_str(&snapshot[..start]);
            out.push_str(&snapshot[end..]);
            Ok(out)
        }
    }
}

/// Byte index of the `char_pos`-th char. Callers check bounds first.
fn byte_offset(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(position: usize, content: &str) -> TextChange {
        TextChange {
            position,
            kind: EditKind::Insert {
                content: content.into(),
            },
        }
    }

    fn delete(position: usize, length: usize) -> TextChange {
        TextChange {
            position,
            kind: EditKind::Delete { length },
        }
    }

    // ==================== Detection ====================

    #[test]
    fn test_detect_no_change() {
        assert_eq!(detect_change("hello", "hello"), None);
        assert_eq!(detect_change("", ""), None);
    }

    #[test]
    fn test_detect_append() {
        assert_eq!(detect_change("hello", "hello world"), Some(insert(5, " world")));
    }

    #[test]
    fn test_detect_insert_at_start_and_middle() {
        assert_eq!(detect_change("world", "hello world"), Some(insert(0, "hello ")));
        assert_eq!(detect_change("held", "hello, world"), Some(insert(3, "lo, worl")));
        assert_eq!(detect_change("abc", "abXYc"), Some(insert(2, "XY")));
    }

    #[test]
    fn test_detect_insert_into_empty() {
        assert_eq!(detect_change("", "abc"), Some(insert(0, "abc")));
    }

    #[test]
    fn test_detect_delete() {
        assert_eq!(detect_change("hello world", "hello"), Some(delete(5, 6)));
        assert_eq!(detect_change("hello world", "world"), Some(delete(0, 6)));
        assert_eq!(detect_change("abXYc", "abc"), Some(delete(2, 2)));
        assert_eq!(detect_change("abc", ""), Some(delete(0, 3)));
    }

    #[test]
    fn test_detect_every_contiguous_insertion() {
        let base = "the quick fox";
        let inserted = "brown ";
        for p in 0..=base.len() {
            let mut current = base.to_string();
            current.insert_str(p, inserted);
            let change = detect_change(base, &current).unwrap();
            // Repeated chars around the insertion point shift `p` right, but
            // applying the change must still reproduce `current`.
            let applied = apply_edit(base, &change.kind, change.position).unwrap();
            assert_eq!(applied, current, "insertion at {}", p);
            assert_eq!(change.kind.len_delta(), inserted.len() as isize);
        }
    }

    #[test]
    fn test_detect_every_contiguous_deletion() {
        let base = "abcdefgh";
        for p in 0..base.len() {
            for l in 1..=(base.len() - p) {
                let current = format!("{}{}", &base[..p], &base[p + l..]);
                assert_eq!(detect_change(base, &current), Some(delete(p, l)));
            }
        }
    }

    #[test]
    fn test_detect_replacement_reports_remainder_insert() {
        // Equal length, differing content: reported as an insert of the remainder.
        assert_eq!(detect_change("cat", "cut"), Some(insert(1, "ut")));
        let change = detect_change("cat", "cut").unwrap();
        let applied = apply_edit("cat", &change.kind, change.position).unwrap();
        assert_eq!(applied, "cutat");
    }

    #[test]
    fn test_detect_counts_chars_not_bytes() {
        assert_eq!(detect_change("héllo", "héllo wörld"), Some(insert(5, " wörld")));
        assert_eq!(detect_change("日本語", "日本"), Some(delete(2, 1)));
    }

    #[test]
    fn test_detect_positions_in_bounds() {
        let pairs = [("", "x"), ("abc", "a"), ("abc", "abcd"), ("xyz", "xya")];
        for (prev, cur) in pairs {
            let change = detect_change(prev, cur).unwrap();
            let len = prev.chars().count();
            assert!(change.position <= len);
            if let EditKind::Delete { length } = change.kind {
                assert!(change.position + length <= len);
            }
        }
    }

    // ==================== Application ====================

    #[test]
    fn test_apply_insert_and_delete() {
        assert_eq!(
            apply_edit("hello", &EditKind::Insert { content: " world".into() }, 5).unwrap(),
            "hello world"
        );
        assert_eq!(
            apply_edit("hello world", &EditKind::Delete { length: 6 }, 5).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_apply_multibyte() {
        assert_eq!(
            apply_edit("日本", &EditKind::Insert { content: "の".into() }, 1).unwrap(),
            "日の本"
        );
        assert_eq!(
            apply_edit("naïve café", &EditKind::Delete { length: 1 }, 2).unwrap(),
            "nave café"
        );
    }

    #[test]
    fn test_insert_then_delete_roundtrip() {
        let original = "collaborative editing";
        let ins = EditDescriptor::insert(13, " text", "alice", 1);
        let after = ins.apply(original).unwrap();
        assert_eq!(after, "collaborative text editing");

        let del = EditDescriptor::delete(13, 5, "alice", 2);
        assert_eq!(del.apply(&after).unwrap(), original);
    }

    #[test]
    fn test_apply_out_of_bounds() {
        assert_eq!(
            apply_edit("abc", &EditKind::Insert { content: "x".into() }, 4),
            Err(EditError::OutOfBounds {
                position: 4,
                length: 0,
                len: 3
            })
        );
        assert!(apply_edit("abc", &EditKind::Delete { length: 2 }, 2).is_err());
        assert!(apply_edit("abc", &EditKind::Delete { length: usize::MAX }, 1).is_err());
    }

    #[test]
    fn test_hello_world_scenarios() {
        let change = detect_change("hello", "hello world").unwrap();
        let op = change.into_descriptor("peer-a", 10);
        assert_eq!(op.position, 5);
        assert_eq!(op.kind, EditKind::Insert { content: " world".into() });
        assert_eq!(op.apply("hello").unwrap(), "hello world");

        let change = detect_change("hello world", "hello").unwrap();
        let op = change.into_descriptor("peer-a", 11);
        assert_eq!(op.position, 5);
        assert_eq!(op.kind, EditKind::Delete { length: 6 });
        assert_eq!(op.apply("hello world").unwrap(), "hello");
    }

    // ==================== Serialization ====================

    #[test]
    fn test_descriptor_wire_shape() {
        let op = EditDescriptor::insert(5, " world", "u1", 1700000000000);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["position"], 5);
        assert_eq!(json["content"], " world");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["timestamp"], 1700000000000u64);

        let parsed: EditDescriptor = serde_json::from_str(
            r#"{"type":"delete","position":5,"length":6,"userId":"u2","timestamp":7}"#,
        )
        .unwrap();
        assert_eq!(parsed, EditDescriptor::delete(5, 6, "u2", 7));
    }
}
