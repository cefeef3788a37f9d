//! Fleet incident detection pipeline.
//!
//! Snapshot-driven batch detector: per-host event snapshots are selected
//! by window ([`snapshot`]), messages scrubbed ([`redact`]), a battery of
//! rule-based detectors emits incidents ([`detect`]), incidents cluster
//! across hosts by message-template signature and roll up into a fleet
//! summary with per-host actions ([`fleet`]). The run lifecycle
//! ([`lifecycle`]) guards execution with a TTL lock and applies
//! time-based retention.

pub mod detect;
pub mod fleet;
pub mod lifecycle;
pub mod redact;
pub mod report;
pub mod snapshot;
pub mod timeline;
pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use lifecycle::{run_worker, IncidentFlowOptions, IncidentFlowResult};
pub use snapshot::SelectMode;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Inclusive observation window, ISO-8601 timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Window {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// One raw host event as shipped in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Value>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One per-host event snapshot document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub snapshot_id: String,
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub window: Window,
    #[serde(default)]
    pub events: Vec<SnapshotEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Cleaned evidence event retained inside an incident record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEvent {
    pub ts: String,
    pub provider: String,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Value>,
}

/// Cluster identity of an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signature_key: String,
    pub signature_hash: String,
}

/// One detected incident on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub schema_version: String,
    pub incident_id: String,
    pub host_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub window: Window,
    pub detected_at: String,
    pub severity: u32,
    pub confidence: f64,
    pub summary: String,
    pub signature: Signature,
    pub recommended_actions: Vec<String>,
    pub evidence: Vec<EvidenceEvent>,
    pub tags: Vec<String>,
}

/// Per-host merged view: redacted events, detected incidents, tickets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostTimeline {
    pub schema_version: String,
    pub host_id: String,
    pub user_id: Option<String>,
    pub window: Window,
    pub events: Vec<SnapshotEvent>,
    pub incidents: Vec<IncidentRecord>,
    pub tickets: Vec<Value>,
    pub last_event_ts: String,
    pub severity: u32,
}

/// Cross-host incident cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub signature_hash: String,
    pub signature_key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub affected_hosts: usize,
    pub example_hosts: Vec<String>,
    pub severity: u32,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub delta_affected_hosts: Option<i64>,
}

/// One ranked host with its decided action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopHost {
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub score: u32,
    pub reasons: Vec<String>,
    pub incident_refs: Vec<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub delta_score: Option<i64>,
    #[serde(default)]
    pub action_reason: String,
}

/// Fleet-wide rollup of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSummary {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub window: Window,
    pub host_count: usize,
    pub incident_count: usize,
    pub overall_risk_score: u32,
    pub top_hosts: Vec<TopHost>,
    pub clusters: Vec<Cluster>,
}

/// Compact prior-run view used for delta computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub generated_at: String,
    pub clusters: Vec<HistoryCluster>,
    pub top_hosts: Vec<HistoryHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryCluster {
    pub signature_hash: String,
    pub affected_hosts: usize,
    pub severity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryHost {
    pub host_id: String,
    pub score: u32,
}

/// Worker lock document at `locks/worker.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLock {
    pub run_id: String,
    pub created_at: String,
    pub ttl_minutes: i64,
}

/// `<run_id>/run_status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub status: String,
    pub message: String,
    pub started_at: Option<String>,
    pub finished_at: String,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Parse an ISO-8601 timestamp. Accepts `Z`, explicit offsets, and naive
/// timestamps (assumed UTC). Detectors skip events whose timestamps do
/// not parse.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// Current time in ISO-8601, `+00:00` offset form.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ts_variants() {
        assert!(parse_ts("2026-01-01T01:00:00Z").is_some());
        assert!(parse_ts("2026-01-01T01:00:00+02:00").is_some());
        assert!(parse_ts("2026-01-01T01:00:00").is_some());
        assert!(parse_ts("not a time").is_none());
        assert!(parse_ts("").is_none());
    }

    #[test]
    fn test_snapshot_event_defaults() {
        let event: SnapshotEvent = serde_json::from_str(r#"{"ts":"2026-01-01T00:00:00Z"}"#).unwrap();
        assert!(event.tags.is_empty());
        assert!(event.event_id.is_none());
        assert_eq!(event.message, "");
    }

    #[test]
    fn test_timeline_serializes_null_user_id() {
        let timeline = HostTimeline {
            schema_version: "1.0".to_string(),
            host_id: "HOST-001".to_string(),
            user_id: None,
            window: Window::default(),
            events: Vec::new(),
            incidents: Vec::new(),
            tickets: Vec::new(),
            last_event_ts: String::new(),
            severity: 0,
        };
        let value = serde_json::to_value(&timeline).unwrap();
        assert!(value["user_id"].is_null());
    }

    #[test]
    fn test_top_host_omits_missing_user_id() {
        let host = TopHost {
            host_id: "HOST-001".to_string(),
            user_id: None,
            score: 10,
            reasons: Vec::new(),
            incident_refs: Vec::new(),
            action: "ignore".to_string(),
            delta_score: None,
            action_reason: String::new(),
        };
        let value = serde_json::to_value(&host).unwrap();
        assert!(value.get("user_id").is_none());
    }
}
