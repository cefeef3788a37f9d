//! Cluster and fleet aggregation.
//!
//! Side-free: takes host timelines plus the prior run's compact history
//! entry and emits a new fleet summary without touching storage. This
//! keeps the component unit-testable and lets the lifecycle parallelise
//! timeline construction freely.

use std::collections::{BTreeMap, BTreeSet};

use crate::incident::{
    parse_ts, utc_now_iso, Cluster, FleetSummary, HistoryCluster, HistoryEntry, HistoryHost,
    HostTimeline, TopHost, Window,
};

const TOP_HOSTS_LIMIT: usize = 10;
const EXAMPLE_HOSTS_LIMIT: usize = 20;

/// Incident types that make a `new` cluster worth an immediate contact.
const CRITICAL_TYPES: &[&str] = &["bsod"];

struct ClusterAccumulator {
    signature_key: String,
    kind: String,
    hosts: BTreeSet<String>,
    max_severity: u32,
    first_seen: Option<chrono::DateTime<chrono::Utc>>,
    last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// Group incidents by signature hash across hosts.
fn aggregate_clusters(timelines: &BTreeMap<String, HostTimeline>) -> Vec<Cluster> {
    let mut accumulators: BTreeMap<String, ClusterAccumulator> = BTreeMap::new();
    for (host_id, timeline) in timelines {
        for incident in &timeline.incidents {
            let hash = &incident.signature.signature_hash;
            if hash.is_empty() {
                continue;
            }
            let acc = accumulators
                .entry(hash.clone())
                .or_insert_with(|| ClusterAccumulator {
                    signature_key: incident.signature.signature_key.clone(),
                    kind: incident.kind.clone(),
                    hosts: BTreeSet::new(),
                    max_severity: 0,
                    first_seen: None,
                    last_seen: None,
                });
            acc.hosts.insert(host_id.clone());
            acc.max_severity = acc.max_severity.max(incident.severity);
            if let Some(start) = incident.window.start.as_deref().and_then(parse_ts) {
                if acc.first_seen.map(|cur| start < cur).unwrap_or(true) {
                    acc.first_seen = Some(start);
                }
            }
            if let Some(end) = incident.window.end.as_deref().and_then(parse_ts) {
                if acc.last_seen.map(|cur| end > cur).unwrap_or(true) {
                    acc.last_seen = Some(end);
                }
            }
        }
    }

    let mut clusters: Vec<Cluster> = accumulators
        .into_iter()
        .map(|(hash, acc)| {
            let affected = acc.hosts.len();
            Cluster {
                signature_hash: hash,
                signature_key: acc.signature_key,
                kind: acc.kind,
                affected_hosts: affected,
                example_hosts: acc.hosts.into_iter().take(EXAMPLE_HOSTS_LIMIT).collect(),
                severity: (acc.max_severity + 5 * (affected.saturating_sub(1)) as u32).min(100),
                first_seen: acc.first_seen.map(|dt| dt.to_rfc3339()),
                last_seen: acc.last_seen.map(|dt| dt.to_rfc3339()),
                status: String::new(),
                delta_affected_hosts: None,
            }
        })
        .collect();
    clusters.sort_by(|a, b| {
        (b.severity, b.affected_hosts).cmp(&(a.severity, a.affected_hosts))
    });
    clusters
}

/// Run-over-run status: `new` with no prior entry, `spiking` when two or
/// more hosts joined since the last run, `ongoing` otherwise.
fn assign_cluster_status(clusters: &mut [Cluster], prev: Option<&HistoryEntry>) {
    let Some(prev) = prev else {
        for cluster in clusters.iter_mut() {
            cluster.status = "new".to_string();
            cluster.delta_affected_hosts = None;
        }
        return;
    };
    let prev_map: BTreeMap<&str, &HistoryCluster> = prev
        .clusters
        .iter()
        .map(|c| (c.signature_hash.as_str(), c))
        .collect();
    for cluster in clusters.iter_mut() {
        match prev_map.get(cluster.signature_hash.as_str()) {
            None => {
                cluster.status = "new".to_string();
                cluster.delta_affected_hosts = None;
            }
            Some(prev_cluster) => {
                let delta =
                    cluster.affected_hosts as i64 - prev_cluster.affected_hosts as i64;
                cluster.delta_affected_hosts = Some(delta);
                cluster.status = if delta >= 2 { "spiking" } else { "ongoing" }.to_string();
            }
        }
    }
}

/// Rank hosts by severity, then incident count; keep the top ten.
fn top_hosts(timelines: &BTreeMap<String, HostTimeline>) -> Vec<TopHost> {
    let mut hosts: Vec<TopHost> = timelines
        .values()
        .map(|timeline| TopHost {
            host_id: timeline.host_id.clone(),
            user_id: timeline.user_id.clone(),
            score: timeline.severity,
            reasons: timeline
                .incidents
                .iter()
                .map(|i| format!("{} (sev {})", i.kind, i.severity))
                .collect(),
            incident_refs: timeline
                .incidents
                .iter()
                .map(|i| i.incident_id.clone())
                .collect(),
            action: String::new(),
            delta_score: None,
            action_reason: String::new(),
        })
        .collect();
    hosts.sort_by(|a, b| {
        (b.score, b.incident_refs.len()).cmp(&(a.score, a.incident_refs.len()))
    });
    hosts.truncate(TOP_HOSTS_LIMIT);
    hosts
}

/// Decide contact/monitor/ignore for one host.
fn action_for_host(
    score: u32,
    prev_score: Option<u32>,
    has_cluster_spike: bool,
    has_new_critical: bool,
) -> (&'static str, Option<i64>, &'static str) {
    let delta = prev_score.map(|prev| score as i64 - prev as i64);
    let rising = prev_score.is_none() || delta.is_some_and(|d| d >= 5);
    if has_new_critical || has_cluster_spike || (score >= 70 && rising) {
        return ("contact", delta, "High severity or cluster spike");
    }
    if score >= 50 || delta.is_some_and(|d| d >= 10) {
        return ("monitor", delta, "Moderate severity or trending up");
    }
    ("ignore", delta, "Low severity or stable")
}

/// Build the fleet summary for a run from its timelines and the previous
/// run's compact history entry.
pub fn build_fleet_summary(
    run_id: &str,
    timelines: &BTreeMap<String, HostTimeline>,
    prev: Option<&HistoryEntry>,
) -> FleetSummary {
    let mut clusters = aggregate_clusters(timelines);
    assign_cluster_status(&mut clusters, prev);
    let mut hosts = top_hosts(timelines);

    let cluster_by_hash: BTreeMap<&str, &Cluster> = clusters
        .iter()
        .map(|c| (c.signature_hash.as_str(), c))
        .collect();
    let mut host_clusters: BTreeMap<&str, Vec<&Cluster>> = BTreeMap::new();
    for (host_id, timeline) in timelines {
        for incident in &timeline.incidents {
            if let Some(cluster) = cluster_by_hash.get(incident.signature.signature_hash.as_str())
            {
                host_clusters.entry(host_id.as_str()).or_default().push(cluster);
            }
        }
    }
    let prev_scores: BTreeMap<&str, u32> = prev
        .map(|p| {
            p.top_hosts
                .iter()
                .map(|h| (h.host_id.as_str(), h.score))
                .collect()
        })
        .unwrap_or_default();

    for host in &mut hosts {
        let related = host_clusters
            .get(host.host_id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let has_spike = related.iter().any(|c| c.status == "spiking");
        let has_new_critical = related
            .iter()
            .any(|c| c.status == "new" && CRITICAL_TYPES.contains(&c.kind.as_str()));
        let (action, delta, reason) = action_for_host(
            host.score,
            prev_scores.get(host.host_id.as_str()).copied(),
            has_spike,
            has_new_critical,
        );
        host.action = action.to_string();
        host.delta_score = delta;
        host.action_reason = reason.to_string();
    }

    let overall_risk_score = if hosts.is_empty() {
        0
    } else {
        let top5: Vec<u32> = hosts.iter().take(5).map(|h| h.score).collect();
        let mean = top5.iter().sum::<u32>() as f64 / top5.len() as f64;
        ((mean + clusters.len() as f64 * 2.0) as u32).min(100)
    };

    let mut window = Window::default();
    for timeline in timelines.values() {
        if let Some(start) = &timeline.window.start {
            if window.start.as_ref().map(|cur| start < cur).unwrap_or(true) {
                window.start = Some(start.clone());
            }
        }
        if let Some(end) = &timeline.window.end {
            if window.end.as_ref().map(|cur| end > cur).unwrap_or(true) {
                window.end = Some(end.clone());
            }
        }
    }
    if window.start.is_none() {
        window.start = Some(utc_now_iso());
    }
    if window.end.is_none() {
        window.end = window.start.clone();
    }

    FleetSummary {
        schema_version: "1.0".to_string(),
        run_id: run_id.to_string(),
        generated_at: utc_now_iso(),
        window,
        host_count: timelines.len(),
        incident_count: timelines.values().map(|t| t.incidents.len()).sum(),
        overall_risk_score,
        top_hosts: hosts,
        clusters,
    }
}

/// Compact a summary into the history entry used for the next run's
/// deltas.
pub fn compact_history(summary: &FleetSummary) -> HistoryEntry {
    HistoryEntry {
        run_id: summary.run_id.clone(),
        generated_at: summary.generated_at.clone(),
        clusters: summary
            .clusters
            .iter()
            .map(|c| HistoryCluster {
                signature_hash: c.signature_hash.clone(),
                affected_hosts: c.affected_hosts,
                severity: c.severity,
            })
            .collect(),
        top_hosts: summary
            .top_hosts
            .iter()
            .map(|h| HistoryHost {
                host_id: h.host_id.clone(),
                score: h.score,
            })
            .collect(),
    }
}
