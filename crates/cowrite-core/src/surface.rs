//! Editor surface abstraction.
//!
//! The synchronization core never touches an editor directly. It reads and
//! writes whole snapshots through [`EditorSurface`] and listens for changes on
//! the surface's change bus.
//!
//! Implementations:
//! - `InMemorySurface` - For testing and embedding
//! - `FileSurface` (in cowrite-daemon) - A text file watched on disk

use crate::events::EventBus;
use std::sync::{Arc, RwLock};

/// The editing surface a session synchronizes.
///
/// `set_content` must publish on `changes()` like any other write; callers
/// that do not want their write observed hold `changes().suspend()` around it.
pub trait EditorSurface: Send + Sync {
    /// Current full snapshot.
    fn content(&self) -> String;

    /// Replace the snapshot wholesale.
    fn set_content(&self, content: &str);

    /// Bus notified with the new snapshot after every change.
    fn changes(&self) -> &Arc<EventBus<String>>;
}

/// In-memory surface.
pub struct InMemorySurface {
    content: RwLock<String>,
    changes: Arc<EventBus<String>>,
}

impl InMemorySurface {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            content: RwLock::new(initial.into()),
            changes: Arc::new(EventBus::new()),
        }
    }
}

impl Default for InMemorySurface {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl EditorSurface for InMemorySurface {
    fn content(&self) -> String {
        self.content
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_content(&self, content: &str) {
        {
            let mut current = self.content.write().unwrap_or_else(|e| e.into_inner());
            if *current == content {
                return;
            }
            *current = content.to_string();
        }
        self.changes.emit(content.to_string());
    }

    fn changes(&self) -> &Arc<EventBus<String>> {
        &self.changes
    }
}
