//! Filesystem-backed artifact store
//!
//! Maps a key to a path by joining with the root directory and replacing
//! slashes with the OS separator. `create_if_absent` relies on
//! `O_CREAT | O_EXCL` semantics via `OpenOptions::create_new`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::store::ArtifactStore;

/// Artifact store rooted at a local directory.
pub struct LocalStore {
    root_dir: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root_dir = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self { root_dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let normalized = key.trim_start_matches('/');
        let mut path = self.root_dir.clone();
        for part in normalized.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    async fn ensure_parent(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn not_found(key: &str, err: std::io::Error) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound {
                key: key.to_string(),
            }
        } else {
            StoreError::Io(err)
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn read_text(&self, key: &str) -> StoreResult<String> {
        tokio::fs::read_to_string(self.path_for(key))
            .await
            .map_err(|e| Self::not_found(key, e))
    }

    async fn write_text(&self, key: &str, text: &str) -> StoreResult<()> {
        self.write_bytes(key, text.as_bytes()).await
    }

    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|e| Self::not_found(key, e))
    }

    async fn write_bytes(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key);
        self.ensure_parent(&path).await?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.path_for(key).exists())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let normalized = prefix.trim_start_matches('/').replace('\\', "/");
        let root = self.path_for(&normalized);
        let mut keys = Vec::new();
        if !root.exists() {
            return Ok(keys);
        }
        if root.is_file() {
            keys.push(normalized);
            return Ok(keys);
        }
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root_dir) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let target = self.path_for(prefix);
        if target.is_dir() {
            let _ = tokio::fs::remove_dir_all(&target).await;
        } else if target.exists() {
            let _ = tokio::fs::remove_file(&target).await;
        }
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, data: &[u8]) -> StoreResult<bool> {
        let path = self.path_for(key);
        self.ensure_parent(&path).await?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut handle) => {
                use std::io::Write;
                handle.write_all(data)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn uri_for_key(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }

    async fn list_runs(&self) -> StoreResult<Vec<String>> {
        let mut runs = Vec::new();
        if !self.root_dir.exists() {
            return Ok(runs);
        }
        let mut entries = tokio::fs::read_dir(&self.root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().is_dir() {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort();
        Ok(runs)
    }

    fn supports_history_trim(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_text_roundtrip() {
        let (_dir, store) = make_store();
        store.write_text("run_a/example.txt", "hello").await.unwrap();
        assert!(store.exists("run_a/example.txt").await.unwrap());
        assert_eq!(store.read_text("run_a/example.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_bytes_roundtrip() {
        let (_dir, store) = make_store();
        store
            .write_bytes("run_a/data.bin", &[1u8, 2, 3])
            .await
            .unwrap();
        assert_eq!(store.read_bytes("run_a/data.bin").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (_dir, store) = make_store();
        let err = store.read_text("absent/key.json").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_is_recursive() {
        let (_dir, store) = make_store();
        store.write_text("run_a/example.txt", "x").await.unwrap();
        store.write_text("run_a/nested/deep.json", "{}").await.unwrap();
        let keys = store.list("").await.unwrap();
        assert!(keys.contains(&"run_a/example.txt".to_string()));
        assert!(keys.contains(&"run_a/nested/deep.json".to_string()));
    }

    #[tokio::test]
    async fn test_list_single_file_prefix() {
        let (_dir, store) = make_store();
        store.write_text("run_a/only.txt", "x").await.unwrap();
        let keys = store.list("run_a/only.txt").await.unwrap();
        assert_eq!(keys, vec!["run_a/only.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_subtree() {
        let (_dir, store) = make_store();
        store.write_text("run_a/a.txt", "x").await.unwrap();
        store.write_text("run_a/sub/b.txt", "y").await.unwrap();
        store.delete_prefix("run_a").await.unwrap();
        assert!(!store.exists("run_a/a.txt").await.unwrap());
        // Deleting again is a no-op
        store.delete_prefix("run_a").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_if_absent_succeeds_once() {
        let (_dir, store) = make_store();
        assert!(store.create_if_absent("locks/worker.lock", b"one").await.unwrap());
        assert!(!store.create_if_absent("locks/worker.lock", b"two").await.unwrap());
        assert_eq!(store.read_text("locks/worker.lock").await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_list_runs_sorted() {
        let (_dir, store) = make_store();
        store.write_text("run_b/x.txt", "x").await.unwrap();
        store.write_text("run_a/x.txt", "x").await.unwrap();
        assert_eq!(store.list_runs().await.unwrap(), vec!["run_a", "run_b"]);
    }

    #[tokio::test]
    async fn test_uri_for_key() {
        let (_dir, store) = make_store();
        let uri = store.uri_for_key("run_a/example.txt");
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("run_a/example.txt"));
    }
}
