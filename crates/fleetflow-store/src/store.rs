//! `ArtifactStore` trait and backend selection
//!
//! Guarantees shared by every backend:
//! - `write_*` creates parent "directories" as needed and overwrites
//!   existing content (last writer wins).
//! - `create_if_absent` succeeds exactly once per key, atomically against
//!   concurrent callers. Used only for the worker lock.
//! - `list(prefix)` returns every leaf key under the prefix, recursively,
//!   skipping pseudo-directory markers. Ordering is not guaranteed;
//!   callers sort when order matters.
//! - Reading a missing key yields `StoreError::NotFound`.
//!
//! The store never caches.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::gcs::GcsStore;
use crate::local::LocalStore;

/// Durable key/value blob store for run artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read a UTF-8 text artifact. `NotFound` if the key is absent.
    async fn read_text(&self, key: &str) -> StoreResult<String>;

    /// Write a UTF-8 text artifact, overwriting any existing content.
    async fn write_text(&self, key: &str, text: &str) -> StoreResult<()>;

    /// Read a binary artifact. `NotFound` if the key is absent.
    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Write a binary artifact, overwriting any existing content.
    async fn write_bytes(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Whether a key currently exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Every leaf key under `prefix` (recursive, unordered).
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Best-effort recursive delete. No error if the prefix is absent.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;

    /// Create `key` only if it does not exist. Returns `true` when this
    /// call created it. Atomic against concurrent callers.
    async fn create_if_absent(&self, key: &str, data: &[u8]) -> StoreResult<bool>;

    /// Backend-appropriate absolute URI for reports (`file://`, `gs://`).
    fn uri_for_key(&self, key: &str) -> String;

    /// Top-level run directories, sorted ascending.
    async fn list_runs(&self) -> StoreResult<Vec<String>>;

    /// Whether the backend trims history locally. Object-storage backends
    /// defer to bucket lifecycle rules and return `false`.
    fn supports_history_trim(&self) -> bool {
        false
    }
}

/// Read a JSON artifact and deserialize it.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &str,
) -> StoreResult<T> {
    let text = store.read_text(key).await?;
    Ok(serde_json::from_str(&text)?)
}

/// Serialize a payload as pretty-printed JSON and write it.
pub async fn write_json<T: Serialize>(
    store: &dyn ArtifactStore,
    key: &str,
    payload: &T,
) -> StoreResult<()> {
    let text = serde_json::to_string_pretty(payload)?;
    store.write_text(key, &text).await
}

/// Whether an artifacts root selects the object-storage backend.
pub fn is_gcs_uri(uri: &str) -> bool {
    uri.to_ascii_lowercase().starts_with("gs://")
}

/// Split `gs://bucket/prefix` into `(bucket, prefix)`. Prefix may be empty.
pub fn parse_gcs_uri(uri: &str) -> (String, String) {
    let normalized = &uri["gs://".len()..];
    match normalized.split_once('/') {
        Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
        None => (normalized.to_string(), String::new()),
    }
}

/// Pick a store for `artifacts_root`. Supports local paths, `file://`
/// paths, and `gs://bucket/prefix`.
pub fn build_store(artifacts_root: &str) -> StoreResult<Box<dyn ArtifactStore>> {
    if is_gcs_uri(artifacts_root) {
        let (bucket, prefix) = parse_gcs_uri(artifacts_root);
        if bucket.is_empty() {
            return Err(StoreError::InvalidRoot(artifacts_root.to_string()));
        }
        tracing::debug!(%bucket, %prefix, "using object-storage backend");
        return Ok(Box::new(GcsStore::new(&bucket, &prefix)));
    }
    let path = artifacts_root.strip_prefix("file://").unwrap_or(artifacts_root);
    tracing::debug!(%path, "using local artifact store");
    Ok(Box::new(LocalStore::new(path)))
}
