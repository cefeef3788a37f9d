//! In-memory fake for the `ArtifactStore` trait (testing only)
//!
//! Backed by a `Mutex<BTreeMap<String, Vec<u8>>>`. `create_if_absent` is
//! atomic because the whole map is guarded by one lock, which is exactly
//! the contract the worker lock needs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::store::ArtifactStore;

/// In-memory artifact store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(key: &str) -> String {
        key.trim_start_matches('/').to_string()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn read_text(&self, key: &str) -> StoreResult<String> {
        let bytes = self.read_bytes(key).await?;
        String::from_utf8(bytes).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn write_text(&self, key: &str, text: &str) -> StoreResult<()> {
        self.write_bytes(key, text.as_bytes()).await
    }

    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(&Self::normalize(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn write_bytes(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(Self::normalize(key), data.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.contains_key(&Self::normalize(key)))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let normalized = Self::normalize(prefix);
        let blobs = self.blobs.lock().unwrap();
        let keys = blobs
            .keys()
            .filter(|k| {
                normalized.is_empty()
                    || **k == normalized
                    || k.starts_with(&format!("{normalized}/"))
            })
            .cloned()
            .collect();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let normalized = Self::normalize(prefix);
        let mut blobs = self.blobs.lock().unwrap();
        blobs.retain(|k, _| {
            !(*k == normalized || k.starts_with(&format!("{normalized}/")))
        });
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, data: &[u8]) -> StoreResult<bool> {
        let mut blobs = self.blobs.lock().unwrap();
        let normalized = Self::normalize(key);
        if blobs.contains_key(&normalized) {
            return Ok(false);
        }
        blobs.insert(normalized, data.to_vec());
        Ok(true)
    }

    fn uri_for_key(&self, key: &str) -> String {
        format!("mem://{}", Self::normalize(key))
    }

    async fn list_runs(&self) -> StoreResult<Vec<String>> {
        let blobs = self.blobs.lock().unwrap();
        let mut runs: Vec<String> = blobs
            .keys()
            .filter_map(|k| k.split_once('/').map(|(run, _)| run.to_string()))
            .collect();
        runs.sort();
        runs.dedup();
        Ok(runs)
    }

    fn supports_history_trim(&self) -> bool {
        true
    }
}
