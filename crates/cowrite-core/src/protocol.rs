//! Wire protocol between collaboration clients and the relay server.
//!
//! Every frame is a JSON text message tagged by `"type"`:
//!
//! ```text
//! client → server   join           {channelId, user:{id,name,color}}
//! both directions   operation      {channelId, operation:{type,position,content|length,userId,timestamp}}
//! both directions   cursor_update  {channelId, userId, cursor}
//! server → client   user_joined    {channelId, user}
//! server → client   user_left      {channelId, userId}
//! server → client   users_list     {channelId, users:[...]}
//! ```
//!
//! `operation` and `cursor_update` frames are relayed verbatim by the server.

use crate::edit::EditDescriptor;
use crate::peer::CursorPosition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum accepted frame size (1MB). Documents are plain text.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Identity a user announces when joining a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    Join {
        channel_id: String,
        user: UserInfo,
    },
    Operation {
        channel_id: String,
        operation: EditDescriptor,
    },
    CursorUpdate {
        channel_id: String,
        user_id: String,
        cursor: Option<CursorPosition>,
    },
    UserJoined {
        channel_id: String,
        user: UserInfo,
    },
    UserLeft {
        channel_id: String,
        user_id: String,
    },
    UsersList {
        channel_id: String,
        users: Vec<UserInfo>,
    },
}

impl WireMessage {
    /// Channel this frame is scoped to.
    pub fn channel_id(&self) -> &str {
        match self {
            WireMessage::Join { channel_id, .. }
            | WireMessage::Operation { channel_id, .. }
            | WireMessage::CursorUpdate { channel_id, .. }
            | WireMessage::UserJoined { channel_id, .. }
            | WireMessage::UserLeft { channel_id, .. }
            | WireMessage::UsersList { channel_id, .. } => channel_id,
        }
    }

    /// Wire name of the frame type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Join { .. } => "join",
            WireMessage::Operation { .. } => "operation",
            WireMessage::CursorUpdate { .. } => "cursor_update",
            WireMessage::UserJoined { .. } => "user_joined",
            WireMessage::UserLeft { .. } => "user_left",
            WireMessage::UsersList { .. } => "users_list",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> UserInfo {
        UserInfo {
            id: "alice".into(),
            name: "Alice".into(),
            color: "hsl(120, 70%, 50%)".into(),
        }
    }

    #[test]
    fn test_join_wire_shape() {
        let msg = WireMessage::Join {
            channel_id: "doc-1".into(),
            user: alice(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "join",
                "channelId": "doc-1",
                "user": {"id": "alice", "name": "Alice", "color": "hsl(120, 70%, 50%)"}
            })
        );
    }

    #[test]
    fn test_operation_wire_shape() {
        let msg = WireMessage::Operation {
            channel_id: "doc-1".into(),
            operation: EditDescriptor::delete(5, 6, "alice", 42),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "operation",
                "channelId": "doc-1",
                "operation": {"type": "delete", "position": 5, "length": 6, "userId": "alice", "timestamp": 42}
            })
        );
    }

    #[test]
    fn test_decode_inbound_frames() {
        let left = WireMessage::decode(r#"{"type":"user_left","channelId":"c","userId":"bob"}"#).unwrap();
        assert_eq!(
            left,
            WireMessage::UserLeft {
                channel_id: "c".into(),
                user_id: "bob".into()
            }
        );

        let list = WireMessage::decode(
            r#"{"type":"users_list","channelId":"c","users":[{"id":"a","name":"A","color":"x"}]}"#,
        )
        .unwrap();
        match list {
            WireMessage::UsersList { users, .. } => assert_eq!(users.len(), 1),
            other => panic!("Expected UsersList, got {:?}", other),
        }

        let cursor = WireMessage::decode(
            r#"{"type":"cursor_update","channelId":"c","userId":"a","cursor":{"line":3,"column":7}}"#,
        )
        .unwrap();
        assert_eq!(
            cursor,
            WireMessage::CursorUpdate {
                channel_id: "c".into(),
                user_id: "a".into(),
                cursor: Some(CursorPosition::LineColumn { line: 3, column: 7 }),
            }
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            WireMessage::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(WireMessage::decode(r#"{"type":"unknown","channelId":"c"}"#).is_err());
        assert!(WireMessage::decode(r#"{"type":"operation","channelId":"c"}"#).is_err());
    }

    #[test]
    fn test_decode_too_large() {
        let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            WireMessage::decode(&huge),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_channel_and_kind() {
        let msg = WireMessage::CursorUpdate {
            channel_id: "doc-9".into(),
            user_id: "a".into(),
            cursor: None,
        };
        assert_eq!(msg.channel_id(), "doc-9");
        assert_eq!(msg.kind(), "cursor_update");
    }
}
