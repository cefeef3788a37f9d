//! Append-only per-run shadow log
//!
//! One `<run_id>/shadow.jsonl` per run; each line is a JSON object with at
//! least `{run_id, event, created_at}` plus arbitrary metadata. Appends
//! preserve prior content even on read-modify-write backends (object
//! storage): read the existing text, append the new line, write back.
//! No rotation, no compaction, never truncated during a run.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;
use crate::store::ArtifactStore;

/// One entry of a run's shadow log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowEvent {
    pub run_id: String,
    pub event: String,
    pub created_at: String,
    #[serde(flatten)]
    pub meta: serde_json::Map<String, Value>,
}

fn shadow_key(run_id: &str) -> String {
    format!("{run_id}/shadow.jsonl")
}

/// Append one event to the run's shadow log.
pub async fn append_shadow(
    store: &dyn ArtifactStore,
    run_id: &str,
    event: &str,
    meta: serde_json::Map<String, Value>,
) -> StoreResult<()> {
    let entry = ShadowEvent {
        run_id: run_id.to_string(),
        event: event.to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        meta,
    };
    let key = shadow_key(run_id);
    let existing = match store.exists(&key).await? {
        true => store.read_text(&key).await.unwrap_or_default(),
        false => String::new(),
    };
    let line = serde_json::to_string(&entry)?;
    store.write_text(&key, &format!("{existing}{line}\n")).await
}

/// All shadow events for a run, in append order. Missing log yields an
/// empty list; malformed lines are skipped.
pub async fn read_shadow_events(
    store: &dyn ArtifactStore,
    run_id: &str,
) -> StoreResult<Vec<ShadowEvent>> {
    let key = shadow_key(run_id);
    if !store.exists(&key).await? {
        return Ok(Vec::new());
    }
    let text = store.read_text(&key).await?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn meta(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_append_preserves_prior_lines() {
        let store = MemoryStore::new();
        append_shadow(&store, "run_a", "start", meta(&[])).await.unwrap();
        append_shadow(
            &store,
            "run_a",
            "timeline",
            meta(&[("incidents", Value::from(2))]),
        )
        .await
        .unwrap();

        let events = read_shadow_events(&store, "run_a").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "start");
        assert_eq!(events[1].event, "timeline");
        assert_eq!(events[1].meta.get("incidents"), Some(&Value::from(2)));
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let store = MemoryStore::new();
        let events = read_shadow_events(&store, "run_missing").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_entries_carry_run_id_and_timestamp() {
        let store = MemoryStore::new();
        append_shadow(&store, "run_a", "start", meta(&[])).await.unwrap();
        let events = read_shadow_events(&store, "run_a").await.unwrap();
        assert_eq!(events[0].run_id, "run_a");
        assert!(events[0].created_at.ends_with('Z'));
    }
}
