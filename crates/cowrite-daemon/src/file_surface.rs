//! Editing surface backed by a text file on disk.
//!
//! Any editor can work on the file; saves are picked up by a `FileWatcher`
//! and published on the surface's change bus. `set_content` updates the
//! cached content at once and hands the write to a writer task, which
//! replaces the file atomically (temp file, then rename). Watcher events that
//! arrive while our own writes are in flight are ignored, and later ones only
//! publish content that differs from the cache.

use crate::watcher::{FileEventKind, FileWatcher};
use anyhow::{Context, Result};
use cowrite_core::{EditorSurface, EventBus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub struct FileSurface {
    path: PathBuf,
    /// Last content read from or written to disk
    content: RwLock<String>,
    changes: Arc<EventBus<String>>,
    /// Queue of contents for the writer task
    write_tx: mpsc::UnboundedSender<String>,
    /// Writes queued but not yet on disk
    pending_writes: Arc<AtomicUsize>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileSurface {
    /// Open `path` (created empty if missing) and start watching it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&path, "")
                    .await
                    .with_context(|| format!("creating {}", path.display()))?;
                String::new()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        let watcher = FileWatcher::new(path.clone())?;

        // Ends once the surface (and with it `write_tx`) is dropped.
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let pending_writes = Arc::new(AtomicUsize::new(0));
        tokio::spawn(Self::write_loop(
            path.clone(),
            write_rx,
            Arc::clone(&pending_writes),
        ));

        let surface = Arc::new(Self {
            path,
            content: RwLock::new(content),
            changes: Arc::new(EventBus::new()),
            write_tx,
            pending_writes,
            watch_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::watch_loop(Arc::downgrade(&surface), watcher));
        *surface.watch_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(surface)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every write queued by `set_content` is on disk.
    pub async fn flush(&self) {
        while self.pending_writes.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn write_loop(
        path: PathBuf,
        mut write_rx: mpsc::UnboundedReceiver<String>,
        pending_writes: Arc<AtomicUsize>,
    ) {
        while let Some(content) = write_rx.recv().await {
            if let Err(e) = write_atomic(&path, &content).await {
                error!("Failed to write {}: {}", path.display(), e);
            }
            pending_writes.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("File write loop ended");
    }

    async fn watch_loop(surface: Weak<Self>, mut watcher: FileWatcher) {
        while let Some(kind) = watcher.recv().await {
            let Some(surface) = surface.upgrade() else {
                break;
            };
            match kind {
                FileEventKind::Modified => surface.reload().await,
                FileEventKind::Deleted => {
                    warn!("{} was deleted; keeping last content", surface.path.display());
                }
            }
        }
        debug!("File watch loop ended");
    }

    /// Re-read the file and publish it if it differs from what we know.
    async fn reload(&self) {
        // Our own write is still landing; its rename raises another event.
        if self.pending_writes.load(Ordering::SeqCst) > 0 {
            debug!("Skipping reload of {} during our write", self.path.display());
            return;
        }

        let on_disk = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return;
            }
        };

        {
            let mut current = self.content.write().unwrap_or_else(|e| e.into_inner());
            if *current == on_disk || self.pending_writes.load(Ordering::SeqCst) > 0 {
                return;
            }
            *current = on_disk.clone();
        }
        debug!("{} changed on disk", self.path.display());
        self.changes.emit(on_disk);
    }
}

/// Replace `path` with `content` so readers never see a partial file.
async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "cowrite".to_string());
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp_path, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

impl EditorSurface for FileSurface {
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
            self.pending_writes.fetch_add(1, Ordering::SeqCst);
        }
        if self.write_tx.send(content.to_string()).is_err() {
            self.pending_writes.fetch_sub(1, Ordering::SeqCst);
            error!("Writer for {} has stopped", self.path.display());
        }
        self.changes.emit(content.to_string());
    }

    fn changes(&self) -> &Arc<EventBus<String>> {
        &self.changes
    }
}

impl Drop for FileSurface {
    fn drop(&mut self) {
        if let Some(task) = self
            .watch_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
