//! Snapshot selection.
//!
//! Snapshots live under `<prefix>/<host_id>/snapshot-<YYYYMMDDTHHMMSSZ>.json`.
//! Selection drops snapshots whose window ends before `now - window_hours`,
//! groups the rest by host, and keeps either the newest-ending snapshot
//! (`latest`) or all of them (`all`; the timeline builder merges events).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tracing::debug;

use fleetflow_store::ArtifactStore;

use crate::error::Result;
use crate::incident::{parse_ts, Snapshot};

/// Keep the newest snapshot per host, or every in-window snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Latest,
    All,
}

impl SelectMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "latest" => Some(SelectMode::Latest),
            "all" => Some(SelectMode::All),
            _ => None,
        }
    }
}

/// One selected snapshot with its parsed window end.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub key: String,
    pub snapshot: Snapshot,
    pub end: DateTime<Utc>,
}

/// All selected snapshots of one host, newest-ending first.
#[derive(Debug, Clone)]
pub struct HostSnapshots {
    pub host_id: String,
    pub snapshots: Vec<LoadedSnapshot>,
}

fn host_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._:-]{3,64}$").expect("valid host id regex"))
}

fn snapshot_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^snapshot-\d{8}T\d{6}Z\.json$").expect("valid snapshot regex"))
}

/// Select in-window snapshots under `prefix`, grouped per host and capped
/// at `max_hosts` hosts (ordered by host id).
pub async fn load_snapshots(
    store: &dyn ArtifactStore,
    prefix: &str,
    window_hours: i64,
    select_mode: SelectMode,
    max_hosts: Option<usize>,
) -> Result<Vec<HostSnapshots>> {
    let cutoff = Utc::now() - Duration::hours(window_hours);
    let mut per_host: BTreeMap<String, Vec<LoadedSnapshot>> = BTreeMap::new();

    for key in store.list(prefix).await? {
        if !key.ends_with(".json") {
            continue;
        }
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() < 2 {
            continue;
        }
        let host_from_key = parts[parts.len() - 2];
        let filename = parts[parts.len() - 1];
        if !host_id_re().is_match(host_from_key) || !snapshot_file_re().is_match(filename) {
            continue;
        }
        let snapshot: Snapshot = match fleetflow_store::read_json(store, &key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(%key, error = %e, "skipping unreadable snapshot");
                continue;
            }
        };
        let end = snapshot.window.end.as_deref().and_then(parse_ts);
        if let Some(end) = end {
            if end < cutoff {
                continue;
            }
        }
        let host_id = if snapshot.host_id.is_empty() {
            host_from_key.to_string()
        } else {
            snapshot.host_id.clone()
        };
        per_host.entry(host_id).or_default().push(LoadedSnapshot {
            key,
            end: end.unwrap_or_else(Utc::now),
            snapshot,
        });
    }

    let mut hosts: Vec<HostSnapshots> = per_host
        .into_iter()
        .map(|(host_id, mut snapshots)| {
            snapshots.sort_by(|a, b| b.end.cmp(&a.end));
            if select_mode == SelectMode::Latest {
                snapshots.truncate(1);
            }
            HostSnapshots { host_id, snapshots }
        })
        .collect();

    if let Some(cap) = max_hosts {
        hosts.truncate(cap);
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_store::MemoryStore;
    use serde_json::json;

    async fn put_snapshot(store: &MemoryStore, key: &str, host: &str, end: &str) {
        let doc = json!({
            "schema_version": "1.0",
            "snapshot_id": format!("{host}-snap"),
            "host_id": host,
            "generated_at": end,
            "window": {"start": "2026-01-01T00:00:00Z", "end": end},
            "events": [],
        });
        store
            .write_text(key, &serde_json::to_string(&doc).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_key_shape_filtering() {
        let store = MemoryStore::new();
        put_snapshot(&store, "snaps/HOST-001/snapshot-20260101T060000Z.json", "HOST-001", "2026-01-01T06:00:00Z").await;
        // Bad filename and bad host id
        put_snapshot(&store, "snaps/HOST-001/other.json", "HOST-001", "2026-01-01T06:00:00Z").await;
        put_snapshot(&store, "snaps/h!/snapshot-20260101T060000Z.json", "h!", "2026-01-01T06:00:00Z").await;

        let hosts = load_snapshots(&store, "snaps", 24 * 365 * 10, SelectMode::All, None)
            .await
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host_id, "HOST-001");
        assert_eq!(hosts[0].snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_mode_picks_newest_end() {
        let store = MemoryStore::new();
        put_snapshot(&store, "snaps/HOST-001/snapshot-20260101T060000Z.json", "HOST-001", "2026-01-01T06:00:00Z").await;
        put_snapshot(&store, "snaps/HOST-001/snapshot-20260101T180000Z.json", "HOST-001", "2026-01-01T18:00:00Z").await;

        let hosts = load_snapshots(&store, "snaps", 24 * 365 * 10, SelectMode::Latest, None)
            .await
            .unwrap();
        assert_eq!(hosts[0].snapshots.len(), 1);
        assert!(hosts[0].snapshots[0].key.contains("T180000Z"));
    }

    #[tokio::test]
    async fn test_all_mode_keeps_every_in_window_snapshot() {
        let store = MemoryStore::new();
        put_snapshot(&store, "snaps/HOST-001/snapshot-20260101T060000Z.json", "HOST-001", "2026-01-01T06:00:00Z").await;
        put_snapshot(&store, "snaps/HOST-001/snapshot-20260101T180000Z.json", "HOST-001", "2026-01-01T18:00:00Z").await;

        let hosts = load_snapshots(&store, "snaps", 24 * 365 * 10, SelectMode::All, None)
            .await
            .unwrap();
        assert_eq!(hosts[0].snapshots.len(), 2);
    }

    #[tokio::test]
    async fn test_window_cutoff_drops_stale_snapshots() {
        let store = MemoryStore::new();
        put_snapshot(&store, "snaps/HOST-001/snapshot-20200101T060000Z.json", "HOST-001", "2020-01-01T06:00:00Z").await;

        let hosts = load_snapshots(&store, "snaps", 24, SelectMode::Latest, None)
            .await
            .unwrap();
        assert!(hosts.is_empty());
    }

    #[tokio::test]
    async fn test_max_hosts_cap_is_ordered_by_host_id() {
        let store = MemoryStore::new();
        for host in ["HOST-003", "HOST-001", "HOST-002"] {
            put_snapshot(
                &store,
                &format!("snaps/{host}/snapshot-20260101T060000Z.json"),
                host,
                "2026-01-01T06:00:00Z",
            )
            .await;
        }
        let hosts = load_snapshots(&store, "snaps", 24 * 365 * 10, SelectMode::Latest, Some(2))
            .await
            .unwrap();
        let ids: Vec<&str> = hosts.iter().map(|h| h.host_id.as_str()).collect();
        assert_eq!(ids, vec!["HOST-001", "HOST-002"]);
    }

    #[test]
    fn test_select_mode_parse() {
        assert_eq!(SelectMode::parse("latest"), Some(SelectMode::Latest));
        assert_eq!(SelectMode::parse("ALL"), Some(SelectMode::All));
        assert_eq!(SelectMode::parse("bogus"), None);
    }
}
