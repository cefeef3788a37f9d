//! Run lifecycle for the incident worker.
//!
//! Execution is guarded by an advisory lock at `locks/worker.lock`,
//! created only via `create_if_absent`. A lock older than its TTL is
//! treated as evidence of a crashed prior run and may be broken once per
//! attempt (the break-glass path, noted in the shadow log). The run
//! directory is mutated only while holding the lock; history append,
//! latest-pointer update and retention purge run after validation.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use fleetflow_store::{
    append_shadow, build_store, read_json, write_json, write_latest, ArtifactStore,
};

use crate::config::Config;
use crate::error::{FlowError, Result};
use crate::incident::fleet::{build_fleet_summary, compact_history};
use crate::incident::redact::Redactor;
use crate::incident::report::render_host_report;
use crate::incident::snapshot::{load_snapshots, SelectMode};
use crate::incident::timeline::{build_host_timeline, load_tickets};
use crate::incident::{
    parse_ts, utc_now_iso, FleetSummary, HistoryEntry, HostTimeline, RunStatus, WorkerLock,
};
use crate::schema::validate_or_raise;
use crate::util::json_meta;

const LOCK_KEY: &str = "locks/worker.lock";
const HISTORY_PREFIX: &str = "history";
const HISTORY_LIMIT: usize = 7;

/// Caller-facing knobs of one worker invocation.
#[derive(Debug, Clone)]
pub struct IncidentFlowOptions {
    pub run_id: String,
    pub snapshot_root: Option<String>,
    pub snapshot_prefix: Option<String>,
    pub ticket_prefix: Option<String>,
    pub retention_hours: i64,
    pub window_hours: i64,
    pub select_mode: SelectMode,
    pub max_hosts: Option<usize>,
}

impl IncidentFlowOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            snapshot_root: None,
            snapshot_prefix: None,
            ticket_prefix: None,
            retention_hours: 48,
            window_hours: 24,
            select_mode: SelectMode::Latest,
            max_hosts: None,
        }
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct IncidentFlowResult {
    pub fleet_summary: FleetSummary,
    pub purged_runs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Worker lock
// ---------------------------------------------------------------------------

fn lock_payload(run_id: &str, ttl_minutes: i64) -> WorkerLock {
    WorkerLock {
        run_id: run_id.to_string(),
        created_at: utc_now_iso(),
        ttl_minutes,
    }
}

fn lock_is_stale(lock: &WorkerLock, ttl_minutes: i64) -> bool {
    match parse_ts(&lock.created_at) {
        Some(created) => created < Utc::now() - Duration::minutes(ttl_minutes),
        // Unparseable lock is treated as abandoned
        None => true,
    }
}

/// Try to take the worker lock. Returns `(acquired, break_glass)`.
pub async fn acquire_lock(
    store: &dyn ArtifactStore,
    run_id: &str,
    ttl_minutes: i64,
) -> Result<(bool, bool)> {
    let payload = serde_json::to_vec_pretty(&lock_payload(run_id, ttl_minutes))?;
    if store.create_if_absent(LOCK_KEY, &payload).await? {
        return Ok((true, false));
    }
    let existing: WorkerLock = match read_json(store, LOCK_KEY).await {
        Ok(lock) => lock,
        Err(_) => WorkerLock {
            run_id: String::new(),
            created_at: String::new(),
            ttl_minutes,
        },
    };
    if lock_is_stale(&existing, ttl_minutes) {
        warn!(run_id, holder = %existing.run_id, "breaking stale worker lock");
        store.delete_prefix(LOCK_KEY).await?;
        if store.create_if_absent(LOCK_KEY, &payload).await? {
            return Ok((true, true));
        }
    }
    Ok((false, false))
}

pub async fn release_lock(store: &dyn ArtifactStore) -> Result<()> {
    store.delete_prefix(LOCK_KEY).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Run status, history, retention
// ---------------------------------------------------------------------------

async fn write_run_status(
    store: &dyn ArtifactStore,
    run_id: &str,
    status: &str,
    message: &str,
    started_at: Option<&str>,
) -> Result<()> {
    let payload = RunStatus {
        run_id: run_id.to_string(),
        status: status.to_string(),
        message: message.to_string(),
        started_at: started_at.map(str::to_string),
        finished_at: utc_now_iso(),
    };
    write_json(store, &format!("{run_id}/run_status.json"), &payload).await?;
    Ok(())
}

/// The most recent history entries, oldest first.
pub async fn load_history(store: &dyn ArtifactStore) -> Result<Vec<HistoryEntry>> {
    let mut keys: Vec<String> = store
        .list(HISTORY_PREFIX)
        .await?
        .into_iter()
        .filter(|k| k.ends_with(".json"))
        .collect();
    keys.sort();
    let mut entries = Vec::new();
    for key in keys {
        if let Ok(entry) = read_json::<HistoryEntry>(store, &key).await {
            entries.push(entry);
        }
    }
    let skip = entries.len().saturating_sub(HISTORY_LIMIT);
    Ok(entries.into_iter().skip(skip).collect())
}

/// Append a compact summary and, on backends that own their retention,
/// trim to the newest entries. Trim failures are logged, never fatal.
pub async fn append_history(store: &dyn ArtifactStore, entry: &HistoryEntry) -> Result<()> {
    write_json(
        store,
        &format!("{HISTORY_PREFIX}/{}.json", entry.run_id),
        entry,
    )
    .await?;
    if !store.supports_history_trim() {
        return Ok(());
    }
    let mut keys: Vec<String> = store.list(HISTORY_PREFIX).await?;
    keys.sort();
    let extras = keys.len().saturating_sub(HISTORY_LIMIT);
    for old in keys.into_iter().take(extras) {
        if let Err(e) = store.delete_prefix(&old).await {
            warn!(key = %old, error = %e, "history trim failed");
        }
    }
    Ok(())
}

async fn run_is_pinned(store: &dyn ArtifactStore, run_id: &str) -> bool {
    store
        .exists(&format!("{run_id}/pinned"))
        .await
        .unwrap_or(false)
}

async fn run_generated_at(store: &dyn ArtifactStore, run_id: &str) -> Option<DateTime<Utc>> {
    let key = format!("{run_id}/fleet_summary.json");
    let summary: FleetSummary = read_json(store, &key).await.ok()?;
    parse_ts(&summary.generated_at)
}

/// Delete run prefixes older than the retention window, keeping the
/// current run and anything pinned. Best-effort.
pub async fn purge_old_runs(
    store: &dyn ArtifactStore,
    retention_hours: i64,
    keep_run: &str,
) -> Result<Vec<String>> {
    let cutoff = Utc::now() - Duration::hours(retention_hours);
    let mut deleted = Vec::new();
    for run_id in store.list_runs().await? {
        if run_id == HISTORY_PREFIX || run_id == keep_run {
            continue;
        }
        if run_is_pinned(store, &run_id).await {
            continue;
        }
        let Some(generated_at) = run_generated_at(store, &run_id).await else {
            continue;
        };
        if generated_at < cutoff {
            if let Err(e) = store.delete_prefix(&run_id).await {
                warn!(run_id, error = %e, "retention purge failed");
                continue;
            }
            deleted.push(run_id);
        }
    }
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Execute the detection pipeline against an already-locked store.
pub async fn run_incident_flow(
    store: &dyn ArtifactStore,
    snapshot_store: &dyn ArtifactStore,
    options: &IncidentFlowOptions,
    redactor: &Redactor,
) -> Result<IncidentFlowResult> {
    let run_id = &options.run_id;
    let history = load_history(store).await?;
    let prev = history.last();

    let snapshot_prefix = options
        .snapshot_prefix
        .clone()
        .unwrap_or_else(|| format!("{run_id}/snapshots"));
    let hosts = load_snapshots(
        snapshot_store,
        &snapshot_prefix,
        options.window_hours,
        options.select_mode,
        options.max_hosts,
    )
    .await?;
    let mut tickets = load_tickets(store, run_id, options.ticket_prefix.as_deref()).await?;

    // Hosts are independent; build their timelines concurrently.
    let builders = hosts.iter().map(|host| {
        let host_tickets = tickets.remove(&host.host_id).unwrap_or_default();
        async move { build_host_timeline(host, host_tickets, redactor) }
    });
    let built: Vec<HostTimeline> = futures::future::join_all(builders).await;
    let mut timelines: BTreeMap<String, HostTimeline> = BTreeMap::new();
    for timeline in built {
        append_shadow(
            store,
            run_id,
            "timeline",
            json_meta(json!({
                "host_id": timeline.host_id,
                "incidents": timeline.incidents.len(),
            })),
        )
        .await?;
        timelines.insert(timeline.host_id.clone(), timeline);
    }

    let fleet = build_fleet_summary(run_id, &timelines, prev);

    for timeline in timelines.values() {
        let host_id = &timeline.host_id;
        write_json(
            store,
            &format!("{run_id}/hosts/{host_id}/timeline.json"),
            timeline,
        )
        .await?;
        store
            .write_text(
                &format!("{run_id}/hosts/{host_id}/report.md"),
                &render_host_report(timeline),
            )
            .await?;
        append_shadow(
            store,
            run_id,
            "write_host",
            json_meta(json!({ "host_id": host_id })),
        )
        .await?;
    }

    write_json(store, &format!("{run_id}/fleet_summary.json"), &fleet).await?;
    append_shadow(
        store,
        run_id,
        "fleet",
        json_meta(json!({ "clusters": fleet.clusters.len() })),
    )
    .await?;

    validate_or_raise(store, run_id).await?;

    if let Err(e) = append_history(store, &compact_history(&fleet)).await {
        warn!(run_id, error = %e, "history append failed");
    }
    write_latest(store, run_id).await?;
    let purged = purge_old_runs(store, options.retention_hours, run_id)
        .await
        .unwrap_or_default();

    Ok(IncidentFlowResult {
        fleet_summary: fleet,
        purged_runs: purged,
    })
}

/// Full worker invocation: lock, status bookkeeping, pipeline, retention,
/// unlock. Errors are recorded in `run_status.json` and the shadow log
/// before propagating.
pub async fn run_worker(config: &Config, options: IncidentFlowOptions) -> Result<IncidentFlowResult> {
    let store = build_store(&config.artifacts_root)?;
    let snapshot_store: Option<Box<dyn ArtifactStore>> = match &options.snapshot_root {
        Some(root) => Some(build_store(root)?),
        None => None,
    };
    let run_id = options.run_id.clone();
    let started_at = utc_now_iso();

    let (acquired, break_glass) =
        acquire_lock(store.as_ref(), &run_id, config.lock_ttl_minutes).await?;
    if !acquired {
        // Do not touch the run directory while another worker owns it.
        return Err(FlowError::LockHeld);
    }

    // The lock must be released on every path below, so status and shadow
    // bookkeeping never early-returns from here on.
    let outcome = async {
        append_shadow(
            store.as_ref(),
            &run_id,
            "start",
            json_meta(json!({ "break_glass": break_glass })),
        )
        .await?;
        write_run_status(store.as_ref(), &run_id, "running", "started", Some(&started_at))
            .await?;
        info!(run_id, break_glass, "incident flow started");

        let snapshots = snapshot_store.as_deref().unwrap_or(store.as_ref());
        let redactor = Redactor::new(config.redaction_mode, &config.redaction_salt);
        run_incident_flow(store.as_ref(), snapshots, &options, &redactor).await
    }
    .await;

    let result = match outcome {
        Ok(result) => {
            if let Err(e) = write_run_status(
                store.as_ref(),
                &run_id,
                "success",
                "completed",
                Some(&started_at),
            )
            .await
            {
                warn!(run_id, error = %e, "failed to record success status");
            }
            let _ = append_shadow(store.as_ref(), &run_id, "done", json_meta(json!({}))).await;
            if !result.purged_runs.is_empty() {
                let _ = append_shadow(
                    store.as_ref(),
                    &run_id,
                    "retention",
                    json_meta(json!({ "purged": result.purged_runs })),
                )
                .await;
            }
            Ok(result)
        }
        Err(err) => {
            if let Err(e) = write_run_status(
                store.as_ref(),
                &run_id,
                "failure",
                &err.to_string(),
                Some(&started_at),
            )
            .await
            {
                warn!(run_id, error = %e, "failed to record failure status");
            }
            let _ = append_shadow(
                store.as_ref(),
                &run_id,
                "error",
                json_meta(json!({ "error": err.to_string() })),
            )
            .await;
            Err(err)
        }
    };

    if let Err(e) = release_lock(store.as_ref()).await {
        warn!(run_id, error = %e, "failed to release worker lock");
    }
    result
}
