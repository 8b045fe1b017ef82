//! Directory-backed fallback store using tokio::fs.
//!
//! Every key is one file in a shared directory, so separate processes on the
//! same machine can exchange fallback records.

use async_trait::async_trait;
use cowrite_core::fallback::{LocalStore, Result, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Native store implementation for the daemon
pub struct DirStore {
    base_path: PathBuf,
}

impl DirStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File holding `key`.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are percent-encoded as UTF-8
    /// bytes, so distinct keys always map to distinct files.
    fn full_path(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
                name.push(byte as char);
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        self.base_path.join(format!("{}.json", name))
    }
}

#[async_trait]
impl LocalStore for DirStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.full_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        // Write then rename so readers never see a half-written record.
        let full_path = self.full_path(key);
        let tmp_path = full_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, value)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &full_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(dir.path().join("store"));

        assert_eq!(store.get("cowrite:doc").await.unwrap(), None);

        store.set("cowrite:doc", "{\"a\":1}").await.unwrap();
        store.set("cowrite:doc", "{\"a\":2}").await.unwrap();
        assert_eq!(
            store.get("cowrite:doc").await.unwrap(),
            Some("{\"a\":2}".to_string())
        );

        store.remove("cowrite:doc").await.unwrap();
        assert_eq!(store.get("cowrite:doc").await.unwrap(), None);
        // Removing a missing key is fine.
        store.remove("cowrite:doc").await.unwrap();
    }

    #[tokio::test]
    async fn test_two_stores_share_directory() {
        let dir = TempDir::new().unwrap();
        let a = DirStore::new(dir.path());
        let b = DirStore::new(dir.path());

        a.set("cowrite:shared", "hello").await.unwrap();
        assert_eq!(b.get("cowrite:shared").await.unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn test_key_to_file_name() {
        let store = DirStore::new("/tmp/x");
        assert_eq!(
            store.full_path("cowrite:doc/1"),
            PathBuf::from("/tmp/x/cowrite%3Adoc%2F1.json")
        );
        assert_eq!(
            store.full_path("cowrite:ü"),
            PathBuf::from("/tmp/x/cowrite%3A%C3%BC.json")
        );
    }

    #[test]
    fn test_similar_keys_get_distinct_files() {
        let store = DirStore::new("/tmp/x");
        let keys = [
            "cowrite:team/notes",
            "cowrite:team_notes",
            "cowrite:team:notes",
            "cowrite:team%2Fnotes",
        ];
        let paths: std::collections::HashSet<_> = keys.iter().map(|k| store.full_path(k)).collect();
        assert_eq!(paths.len(), keys.len());
    }

    #[tokio::test]
    async fn test_fallback_channels_do_not_leak() {
        use cowrite_core::{EditDescriptor, FallbackChannel};
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(DirStore::new(dir.path()));
        let mut alice = FallbackChannel::new(Arc::clone(&store), "team/notes", "alice");
        let mut bob = FallbackChannel::new(Arc::clone(&store), "team_notes", "bob");

        alice
            .publish(&EditDescriptor::insert(0, "secret", "alice", 1_000), 1_000)
            .await
            .unwrap();
        assert_eq!(bob.poll(1_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(dir.path());
        store.set("k", "v").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }
}
