//! Latest-run pointer
//!
//! `latest_run.txt` holds the id of the most recently completed run. When
//! absent, run ids are timestamp-like, so the lexicographically last run
//! directory is the best fallback.

use crate::error::StoreResult;
use crate::store::ArtifactStore;

pub const LATEST_KEY: &str = "latest_run.txt";

/// Point `latest_run.txt` at `run_id`.
pub async fn write_latest(store: &dyn ArtifactStore, run_id: &str) -> StoreResult<()> {
    store.write_text(LATEST_KEY, run_id).await
}

/// The pointer value, if present and readable.
pub async fn read_latest(store: &dyn ArtifactStore) -> StoreResult<Option<String>> {
    if !store.exists(LATEST_KEY).await? {
        return Ok(None);
    }
    match store.read_text(LATEST_KEY).await {
        Ok(text) => {
            let trimmed = text.trim().to_string();
            Ok((!trimmed.is_empty()).then_some(trimmed))
        }
        Err(_) => Ok(None),
    }
}

/// The latest run id: the pointer when set, otherwise the last run
/// directory in sort order.
pub async fn latest_run_id(store: &dyn ArtifactStore) -> StoreResult<Option<String>> {
    if let Some(latest) = read_latest(store).await? {
        return Ok(Some(latest));
    }
    let runs = store.list_runs().await?;
    Ok(runs.last().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_pointer_roundtrip() {
        let store = MemoryStore::new();
        write_latest(&store, "run-20260101-000000Z").await.unwrap();
        assert_eq!(
            read_latest(&store).await.unwrap().as_deref(),
            Some("run-20260101-000000Z")
        );
    }

    #[tokio::test]
    async fn test_fallback_to_last_run_directory() {
        let store = MemoryStore::new();
        store.write_text("run-a/x.json", "{}").await.unwrap();
        store.write_text("run-b/x.json", "{}").await.unwrap();
        assert_eq!(latest_run_id(&store).await.unwrap().as_deref(), Some("run-b"));
    }

    #[tokio::test]
    async fn test_empty_store_has_no_latest() {
        let store = MemoryStore::new();
        assert_eq!(latest_run_id(&store).await.unwrap(), None);
    }
}
