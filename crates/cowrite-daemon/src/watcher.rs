//! File watcher with debouncing for the edited document.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The
//! parent directory is watched (editors often replace files on save) and
//! events are filtered down to the one watched file.

use anyhow::{Result, anyhow};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watcher for a single file.
pub struct FileWatcher {
    path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for file events
    event_rx: mpsc::UnboundedReceiver<FileEventKind>,
}

impl FileWatcher {
    /// Start watching `path`.
    ///
    /// Uses 100ms debounce period to avoid rapid-fire events during saves.
    pub fn new(path: PathBuf) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let path = path.canonicalize().unwrap_or(path);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            Duration::from_millis(100),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    if let Some(kind) = Self::process_events(&events, &file_name) {
                        // Receiver dropped means the surface is gone.
                        let _ = event_tx.send(kind);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Collapse a debounced batch into at most one event for the watched file.
    fn process_events(events: &[DebouncedEvent], file_name: &OsString) -> Option<FileEventKind> {
        let event = events
            .iter()
            .find(|e| e.path.file_name() == Some(file_name.as_os_str()))?;

        let kind = if event.path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };
        debug!("File event: {:?} - {}", kind, event.path.display());
        Some(kind)
    }

    /// Wait for the next event. Returns `None` once the watcher stops.
    pub async fn recv(&mut self) -> Option<FileEventKind> {
        self.event_rx.recv().await
    }

    /// The watched path (canonicalized).
    pub fn path(&self) -> &Path {
        &self.path
    }
}
