//! End-to-end tests for the fleet incident worker: detection, clustering,
//! history deltas, lock behavior, and schema validation.

use serde_json::json;

use fleetflow_core::incident::detect::signature_for_event;
use fleetflow_core::incident::{
    run_worker, FleetSummary, HistoryEntry, HostTimeline, IncidentFlowOptions, SelectMode,
    SnapshotEvent,
};
use fleetflow_core::{Config, FlowError};
use fleetflow_store::{read_shadow_events, ArtifactStore, LocalStore};

fn config_for(dir: &tempfile::TempDir) -> Config {
    Config {
        artifacts_root: dir.path().display().to_string(),
        ..Config::default()
    }
}

fn options_for(run_id: &str) -> IncidentFlowOptions {
    IncidentFlowOptions {
        window_hours: 24 * 365 * 20,
        ..IncidentFlowOptions::new(run_id)
    }
}

fn bsod_snapshot(host: &str, suffix: &str, ts: &str, end: &str) -> serde_json::Value {
    json!({
        "schema_version": "1.0",
        "snapshot_id": format!("{host}-{suffix}"),
        "host_id": host,
        "generated_at": end,
        "window": {"start": "2026-01-01T00:00:00Z", "end": end},
        "events": [{
            "ts": ts,
            "level": "Error",
            "source": "WindowsEventLog:System",
            "provider": "BugCheck",
            "event_id": 1001,
            "message": "BugCheck 0x0000007e",
            "data": {},
            "tags": ["bsod"]
        }],
        "stats": {"event_count": 1, "critical_count": 0, "error_count": 1, "warning_count": 0}
    })
}

async fn put(store: &LocalStore, key: &str, value: &serde_json::Value) {
    store
        .write_text(key, &serde_json::to_string(value).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn single_bsod_event_produces_incident_and_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "run-bsod";
    put(
        &store,
        &format!("{run_id}/snapshots/HOST-001/snapshot-20260101T120000Z.json"),
        &bsod_snapshot("HOST-001", "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
    )
    .await;

    let result = run_worker(&config_for(&dir), options_for(run_id))
        .await
        .unwrap();

    let timeline: HostTimeline =
        fleetflow_store::read_json(&store, &format!("{run_id}/hosts/HOST-001/timeline.json"))
            .await
            .unwrap();
    assert_eq!(timeline.incidents.len(), 1);
    assert_eq!(timeline.incidents[0].kind, "bsod");
    assert_eq!(timeline.incidents[0].severity, 85);
    assert_eq!(timeline.incidents[0].confidence, 0.75);

    let fleet = &result.fleet_summary;
    assert_eq!(fleet.clusters.len(), 1);
    assert_eq!(fleet.clusters[0].affected_hosts, 1);
    assert_eq!(fleet.clusters[0].status, "new");
    assert!(matches!(
        fleet.top_hosts[0].action.as_str(),
        "contact" | "monitor"
    ));

    // Terminal bookkeeping
    let status: serde_json::Value =
        fleetflow_store::read_json(&store, &format!("{run_id}/run_status.json"))
            .await
            .unwrap();
    assert_eq!(status["status"], "success");
    assert_eq!(
        store.read_text("latest_run.txt").await.unwrap(),
        run_id
    );
    assert!(!store.exists("locks/worker.lock").await.unwrap());
    assert!(store
        .exists(&format!("history/{run_id}.json"))
        .await
        .unwrap());
}

#[tokio::test]
async fn identical_signature_on_two_hosts_clusters_and_spikes() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "run-spike";
    for host in ["HOST-001", "HOST-002"] {
        put(
            &store,
            &format!("{run_id}/snapshots/{host}/snapshot-20260101T120000Z.json"),
            &bsod_snapshot(host, "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
        )
        .await;
    }

    // Prior run saw this signature on zero hosts
    let event: SnapshotEvent = serde_json::from_value(json!({
        "ts": "2026-01-01T01:00:00Z",
        "provider": "BugCheck",
        "event_id": 1001,
        "message": "BugCheck 0x0000007e",
    }))
    .unwrap();
    let signature = signature_for_event(&event);
    let prior = HistoryEntry {
        run_id: "run-0".to_string(),
        generated_at: "2026-01-01T00:00:00Z".to_string(),
        clusters: vec![fleetflow_core::incident::HistoryCluster {
            signature_hash: signature.signature_hash.clone(),
            affected_hosts: 0,
            severity: 85,
        }],
        top_hosts: Vec::new(),
    };
    fleetflow_store::write_json(&store, "history/run-0.json", &prior)
        .await
        .unwrap();

    let result = run_worker(&config_for(&dir), options_for(run_id))
        .await
        .unwrap();
    let fleet = &result.fleet_summary;

    assert_eq!(fleet.clusters.len(), 1);
    let cluster = &fleet.clusters[0];
    assert_eq!(cluster.affected_hosts, 2);
    assert_eq!(cluster.severity, 90);
    assert_eq!(cluster.status, "spiking");
    assert_eq!(cluster.delta_affected_hosts, Some(2));
    for host in &fleet.top_hosts {
        assert_eq!(host.action, "contact");
    }
}

#[tokio::test]
async fn select_all_merges_snapshots_per_host() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "merge-run";

    put(
        &store,
        "snapshots/HOST-001/snapshot-20260101T060000Z.json",
        &json!({
            "schema_version": "1.0",
            "snapshot_id": "HOST-001-1",
            "host_id": "HOST-001",
            "generated_at": "2026-01-01T00:00:00Z",
            "window": {"start": "2026-01-01T00:00:00Z", "end": "2026-01-01T06:00:00Z"},
            "events": [{
                "ts": "2026-01-01T01:00:00Z",
                "level": "Error",
                "source": "WindowsEventLog:System",
                "provider": "BugCheck",
                "event_id": 1001,
                "message": "BugCheck 0x00000124",
                "data": {},
                "tags": ["bsod"]
            }]
        }),
    )
    .await;
    put(
        &store,
        "snapshots/HOST-001/snapshot-20260101T180000Z.json",
        &json!({
            "schema_version": "1.0",
            "snapshot_id": "HOST-001-2",
            "host_id": "HOST-001",
            "generated_at": "2026-01-01T12:00:00Z",
            "window": {"start": "2026-01-01T12:00:00Z", "end": "2026-01-01T18:00:00Z"},
            "events": [{
                "ts": "2026-01-01T13:00:00Z",
                "level": "Error",
                "source": "WindowsEventLog:Disk",
                "provider": "Disk",
                "event_id": 7,
                "message": "Disk failure imminent",
                "data": {},
                "tags": ["disk_full"]
            }]
        }),
    )
    .await;

    let options = IncidentFlowOptions {
        snapshot_prefix: Some("snapshots".to_string()),
        select_mode: SelectMode::All,
        ..options_for(run_id)
    };
    run_worker(&config_for(&dir), options).await.unwrap();

    let timeline: HostTimeline =
        fleetflow_store::read_json(&store, &format!("{run_id}/hosts/HOST-001/timeline.json"))
            .await
            .unwrap();
    assert_eq!(timeline.window.start.as_deref(), Some("2026-01-01T00:00:00Z"));
    assert_eq!(timeline.window.end.as_deref(), Some("2026-01-01T18:00:00Z"));
    assert_eq!(timeline.events.len(), 2);
    assert!(timeline.incidents.len() >= 2);

    let report = store
        .read_text(&format!("{run_id}/hosts/HOST-001/report.md"))
        .await
        .unwrap();
    assert!(report.contains("2026-01-01T00:00:00Z"));
    assert!(report.contains("Disk usage approaching capacity"));
}

#[tokio::test]
async fn run_without_user_id_passes_validation() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "run-no-user";
    put(
        &store,
        &format!("{run_id}/snapshots/HOST-001/snapshot-20260101T120000Z.json"),
        &bsod_snapshot("HOST-001", "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
    )
    .await;

    run_worker(&config_for(&dir), options_for(run_id))
        .await
        .unwrap();

    fleetflow_core::schema::validate_or_raise(&store, run_id)
        .await
        .unwrap();

    let fleet: FleetSummary =
        fleetflow_store::read_json(&store, &format!("{run_id}/fleet_summary.json"))
            .await
            .unwrap();
    let raw: serde_json::Value =
        fleetflow_store::read_json(&store, &format!("{run_id}/fleet_summary.json"))
            .await
            .unwrap();
    assert!(!fleet.top_hosts.is_empty());
    assert!(raw["top_hosts"][0].get("user_id").is_none());

    let timeline: serde_json::Value =
        fleetflow_store::read_json(&store, &format!("{run_id}/hosts/HOST-001/timeline.json"))
            .await
            .unwrap();
    assert!(timeline["user_id"].is_null());
}

#[tokio::test]
async fn held_lock_refuses_second_worker() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "run-locked";
    put(
        &store,
        &format!("{run_id}/snapshots/HOST-001/snapshot-20260101T120000Z.json"),
        &bsod_snapshot("HOST-001", "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
    )
    .await;

    // A live worker holds the lock
    let live_lock = json!({
        "run_id": "other-run",
        "created_at": chrono::Utc::now().to_rfc3339(),
        "ttl_minutes": 30,
    });
    store
        .create_if_absent("locks/worker.lock", live_lock.to_string().as_bytes())
        .await
        .unwrap();

    let err = run_worker(&config_for(&dir), options_for(run_id))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::LockHeld));

    // Run directory untouched, lock intact
    assert!(!store
        .exists(&format!("{run_id}/run_status.json"))
        .await
        .unwrap());
    assert!(!store
        .exists(&format!("{run_id}/fleet_summary.json"))
        .await
        .unwrap());
    assert!(store.exists("locks/worker.lock").await.unwrap());
}

#[tokio::test]
async fn stale_lock_is_broken_with_shadow_note() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "run-breakglass";
    put(
        &store,
        &format!("{run_id}/snapshots/HOST-001/snapshot-20260101T120000Z.json"),
        &bsod_snapshot("HOST-001", "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
    )
    .await;

    let stale_lock = json!({
        "run_id": "crashed-run",
        "created_at": (chrono::Utc::now() - chrono::Duration::minutes(120)).to_rfc3339(),
        "ttl_minutes": 30,
    });
    store
        .create_if_absent("locks/worker.lock", stale_lock.to_string().as_bytes())
        .await
        .unwrap();

    run_worker(&config_for(&dir), options_for(run_id))
        .await
        .unwrap();

    let events = read_shadow_events(&store, run_id).await.unwrap();
    let start = events.iter().find(|e| e.event == "start").unwrap();
    assert_eq!(start.meta.get("break_glass"), Some(&json!(true)));
}

#[tokio::test]
async fn reruns_on_same_snapshots_agree_up_to_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    for host in ["HOST-001", "HOST-002"] {
        put(
            &store,
            &format!("snapshots/{host}/snapshot-20260101T120000Z.json"),
            &bsod_snapshot(host, "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
        )
        .await;
    }
    let base = IncidentFlowOptions {
        snapshot_prefix: Some("snapshots".to_string()),
        ..options_for("run-a")
    };
    let first = run_worker(&config_for(&dir), base.clone()).await.unwrap();
    let second = run_worker(
        &config_for(&dir),
        IncidentFlowOptions {
            run_id: "run-b".to_string(),
            ..base
        },
    )
    .await
    .unwrap();

    let a = &first.fleet_summary;
    let b = &second.fleet_summary;
    assert_eq!(a.host_count, b.host_count);
    assert_eq!(a.incident_count, b.incident_count);
    assert_eq!(a.overall_risk_score, b.overall_risk_score);
    assert_eq!(a.clusters.len(), b.clusters.len());
    assert_eq!(a.clusters[0].signature_hash, b.clusters[0].signature_hash);
    assert_eq!(a.clusters[0].affected_hosts, b.clusters[0].affected_hosts);
    assert_eq!(a.clusters[0].severity, b.clusters[0].severity);
    // Delta fields differ by design: the second run has history behind it
    assert_eq!(a.clusters[0].status, "new");
    assert_eq!(b.clusters[0].status, "ongoing");
}

#[tokio::test]
async fn tickets_attach_to_their_host() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path());
    let run_id = "run-tickets";
    put(
        &store,
        &format!("{run_id}/snapshots/HOST-001/snapshot-20260101T120000Z.json"),
        &bsod_snapshot("HOST-001", "1", "2026-01-01T01:00:00Z", "2026-01-01T12:00:00Z"),
    )
    .await;
    put(
        &store,
        &format!("{run_id}/tickets/T-100.json"),
        &json!({
            "ticket_id": "T-100",
            "host_id": "HOST-001",
            "subject": "Machine keeps rebooting",
            "symptoms": ["random reboot", "blue screen"]
        }),
    )
    .await;

    run_worker(&config_for(&dir), options_for(run_id))
        .await
        .unwrap();

    let timeline: HostTimeline =
        fleetflow_store::read_json(&store, &format!("{run_id}/hosts/HOST-001/timeline.json"))
            .await
            .unwrap();
    assert_eq!(timeline.tickets.len(), 1);
    assert_eq!(timeline.tickets[0]["ticket_id"], "T-100");
}
