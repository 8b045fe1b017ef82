//! cowrite-core: Collaborative text synchronization for a shared editing surface.
//!
//! This crate provides the transport-agnostic core:
//! - Detecting local edits by diffing snapshots, and applying remote ones
//! - The JSON wire protocol spoken with the relay server
//! - Presence roster with staleness and cursor idle windows
//! - Reconnect backoff and the local-store fallback channel
//! - EditorSurface and LocalStore trait abstractions

pub mod edit;
pub mod events;
pub mod fallback;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod surface;

pub use edit::{EditDescriptor, EditError, EditKind, TextChange, apply_edit, detect_change};
pub use events::{CollabEvent, EventBus, Subscription, SuspendGuard};
pub use fallback::{FallbackChannel, FallbackRecord, InMemoryStore, LocalStore, StoreError};
pub use peer::{CursorPosition, Peer, color_for};
pub use presence::{PresenceError, PresenceTracker};
pub use protocol::{ProtocolError, UserInfo, WireMessage};
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use session::{CollabSession, SessionConfig, SessionError, now_ms};
pub use surface::{EditorSurface, InMemorySurface};
