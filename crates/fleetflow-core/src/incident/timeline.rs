//! Per-host timeline construction.
//!
//! Merges a host's selected snapshots into one timeline: events
//! concatenated and sorted by timestamp, window unioned across
//! snapshots, messages redacted before detection. Hosts are independent,
//! so the lifecycle builds timelines concurrently.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use fleetflow_store::ArtifactStore;

use crate::error::Result;
use crate::incident::detect::{detect_incidents_for_host, host_severity};
use crate::incident::redact::Redactor;
use crate::incident::snapshot::HostSnapshots;
use crate::incident::{parse_ts, HostTimeline, Window};

/// Tickets grouped by host id. Tickets parse leniently; a ticket without
/// a `host_id` lands under `unknown`.
pub async fn load_tickets(
    store: &dyn ArtifactStore,
    run_id: &str,
    ticket_prefix: Option<&str>,
) -> Result<BTreeMap<String, Vec<Value>>> {
    let base = ticket_prefix
        .map(str::to_string)
        .unwrap_or_else(|| format!("{run_id}/tickets"));
    let mut tickets: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for key in store.list(&base).await? {
        if !key.ends_with(".json") {
            continue;
        }
        let payload: Value = match fleetflow_store::read_json(store, &key).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%key, error = %e, "skipping unreadable ticket");
                continue;
            }
        };
        let host_id = payload
            .get("host_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        tickets.entry(host_id).or_default().push(payload);
    }
    Ok(tickets)
}

/// Union of snapshot windows, compared as ISO strings.
fn union_window(host: &HostSnapshots) -> Window {
    let mut start: Option<String> = None;
    let mut end: Option<String> = None;
    for loaded in &host.snapshots {
        if let Some(s) = &loaded.snapshot.window.start {
            if start.as_ref().map(|cur| s < cur).unwrap_or(true) {
                start = Some(s.clone());
            }
        }
        if let Some(e) = &loaded.snapshot.window.end {
            if end.as_ref().map(|cur| e > cur).unwrap_or(true) {
                end = Some(e.clone());
            }
        }
    }
    Window { start, end }
}

fn latest_ts(events: &[crate::incident::SnapshotEvent]) -> String {
    events
        .iter()
        .filter_map(|e| parse_ts(&e.ts))
        .max()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Build one host's timeline from its merged snapshots.
pub fn build_host_timeline(
    host: &HostSnapshots,
    tickets: Vec<Value>,
    redactor: &Redactor,
) -> HostTimeline {
    let mut events: Vec<_> = host
        .snapshots
        .iter()
        .flat_map(|loaded| loaded.snapshot.events.iter().cloned())
        .collect();
    events.sort_by(|a, b| a.ts.cmp(&b.ts));
    for event in &mut events {
        event.message = redactor.redact_message(&event.message);
    }

    let window = union_window(host);
    let incidents = detect_incidents_for_host(&host.host_id, &window, &events);
    let user_id = host
        .snapshots
        .iter()
        .find_map(|loaded| loaded.snapshot.user_id.as_deref());

    HostTimeline {
        schema_version: "1.0".to_string(),
        host_id: host.host_id.clone(),
        user_id: redactor.hash_user(user_id),
        window,
        last_event_ts: latest_ts(&events),
        severity: host_severity(&incidents),
        events,
        incidents,
        tickets,
    }
}
