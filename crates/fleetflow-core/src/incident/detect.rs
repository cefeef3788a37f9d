//! Rule-based incident detectors.
//!
//! Each detector scans a host's chronological event list and returns at
//! most one incident. Detectors never fail on malformed events:
//! unparseable timestamps are skipped when computing windows, missing
//! fields read as empty.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::incident::{
    utc_now_iso, EvidenceEvent, IncidentRecord, Signature, SnapshotEvent, Window,
};

const EVIDENCE_MESSAGE_LIMIT: usize = 512;

struct Detection {
    kind: &'static str,
    title: &'static str,
    summary: &'static str,
    severity: u32,
    confidence: f64,
    evidence: Vec<SnapshotEvent>,
}

fn digit_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid digit regex"))
}

/// Lowercase, collapse whitespace, replace every digit run with `<n>`.
pub fn normalize_message_template(message: &str) -> String {
    let lowered = message.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    digit_run_re().replace_all(&collapsed, "<n>").into_owned()
}

fn event_id_text(event_id: Option<&serde_json::Value>) -> String {
    match event_id {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Signature of the earliest evidence event:
/// `signature_key = "<provider>:<event_id>|<template>"` (template capped
/// at 200 chars), `signature_hash` = first 12 hex chars of SHA-256 over
/// `provider|event_id|template`.
pub fn signature_for_event(event: &SnapshotEvent) -> Signature {
    let template = normalize_message_template(&event.message);
    let event_id = event_id_text(event.event_id.as_ref());
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", event.provider, event_id, template).as_bytes());
    let digest = hex::encode(hasher.finalize());
    let capped: String = template.chars().take(200).collect();
    Signature {
        signature_key: format!("{}:{}|{}", event.provider, event_id, capped),
        signature_hash: digest[..12].to_string(),
    }
}

/// Retain only the allowed fields and truncate long messages.
fn clean_evidence(events: &[&SnapshotEvent]) -> Vec<EvidenceEvent> {
    events
        .iter()
        .map(|e| {
            let message = if e.message.len() > EVIDENCE_MESSAGE_LIMIT {
                let cut: String = e.message.chars().take(EVIDENCE_MESSAGE_LIMIT - 3).collect();
                format!("{cut}...")
            } else {
                e.message.clone()
            };
            EvidenceEvent {
                ts: e.ts.clone(),
                provider: e.provider.clone(),
                level: e.level.clone(),
                message,
                event_id: e.event_id.clone(),
                source: (!e.source.is_empty()).then(|| e.source.clone()),
                record_id: e.record_id.clone(),
            }
        })
        .collect()
}

fn recommended_actions(kind: &str) -> Vec<String> {
    let actions: &[&str] = match kind {
        "bsod" => &[
            "Capture minidump and driver list before reboot loops clear them.",
            "Roll back or update the last installed driver/patch.",
        ],
        "disk_full" => &[
            "Clear temp folders and large caches.",
            "Expand disk or reassign user data to secondary volume.",
        ],
        "service_crash_loop" => &[
            "Review service logs for repeated stop codes.",
            "Restart service under supervisor and collect crash dumps.",
        ],
        "network_instability" => &[
            "Reset adapter and DNS cache, verify driver version.",
            "Check site switch/appliance for correlated resets.",
        ],
        "update_failure" => &[
            "Re-run updater with verbose logging enabled.",
            "Remove partially applied patches and retry.",
        ],
        _ => &["Collect logs and escalate to tier 2."],
    };
    actions.iter().map(|a| a.to_string()).collect()
}

fn has_tag(event: &SnapshotEvent, tag: &str) -> bool {
    event.tags.iter().any(|t| t == tag)
}

fn detect_bsod(events: &[SnapshotEvent]) -> Option<Detection> {
    let evidence: Vec<&SnapshotEvent> = events
        .iter()
        .filter(|e| has_tag(e, "bsod") || has_tag(e, "unexpected_shutdown"))
        .collect();
    if evidence.is_empty() {
        return None;
    }
    let n = evidence.len() as u32;
    Some(Detection {
        kind: "bsod",
        title: "Blue screen / unexpected shutdown",
        summary: "Detected blue screen or unexpected shutdown events",
        severity: (85 + 5 * (n - 1)).min(100),
        confidence: if n > 1 { 0.9 } else { 0.75 },
        evidence: evidence.into_iter().cloned().collect(),
    })
}

fn detect_disk_full(events: &[SnapshotEvent]) -> Option<Detection> {
    let evidence: Vec<&SnapshotEvent> = events
        .iter()
        .filter(|e| has_tag(e, "disk_full") || e.source.to_lowercase().contains("disk"))
        .collect();
    if evidence.is_empty() {
        return None;
    }
    let n = evidence.len() as u32;
    Some(Detection {
        kind: "disk_full",
        title: "Disk near capacity",
        summary: "Disk usage approaching capacity",
        severity: (70 + 5 * (n - 1)).min(95),
        confidence: (0.7 + 0.05 * n as f64).min(0.95),
        evidence: evidence.into_iter().cloned().collect(),
    })
}

fn detect_service_crash_loop(events: &[SnapshotEvent]) -> Option<Detection> {
    let evidence: Vec<&SnapshotEvent> = events
        .iter()
        .filter(|e| {
            has_tag(e, "service_crash")
                || e.provider.to_lowercase().contains("service control manager")
        })
        .collect();
    if evidence.len() < 2 {
        return None;
    }
    let n = evidence.len() as u32;
    Some(Detection {
        kind: "service_crash_loop",
        title: "Service crash loop detected",
        summary: "Repeated service crashes detected",
        severity: (65 + 5 * n.min(5)).min(90),
        confidence: (0.7 + 0.05 * n as f64).min(0.95),
        evidence: evidence.into_iter().cloned().collect(),
    })
}

fn detect_network_instability(events: &[SnapshotEvent]) -> Option<Detection> {
    let evidence: Vec<&SnapshotEvent> = events
        .iter()
        .filter(|e| has_tag(e, "network_reset") || has_tag(e, "dns_failure"))
        .collect();
    if evidence.is_empty() {
        return None;
    }
    let n = evidence.len() as u32;
    Some(Detection {
        kind: "network_instability",
        title: "Network adapter resets / DNS failures",
        summary: "Network instability detected",
        severity: (55 + 5 * n.min(6)).min(85),
        confidence: (0.6 + 0.05 * n as f64).min(0.9),
        evidence: evidence.into_iter().cloned().collect(),
    })
}

fn detect_update_failure(events: &[SnapshotEvent]) -> Option<Detection> {
    let evidence: Vec<&SnapshotEvent> = events
        .iter()
        .filter(|e| has_tag(e, "update_failure") || e.source.to_lowercase().contains("update"))
        .collect();
    if evidence.is_empty() {
        return None;
    }
    let n = evidence.len() as u32;
    Some(Detection {
        kind: "update_failure",
        title: "Update or install failure burst",
        summary: "Repeated update or install failures",
        severity: (65 + 5 * (n - 1).min(4)).min(90),
        confidence: (0.65 + 0.05 * n as f64).min(0.9),
        evidence: evidence.into_iter().cloned().collect(),
    })
}

/// Run every detector over a host's events and materialise incident
/// records. At most one incident per detector.
pub fn detect_incidents_for_host(
    host_id: &str,
    window: &Window,
    events: &[SnapshotEvent],
) -> Vec<IncidentRecord> {
    let detectors: &[fn(&[SnapshotEvent]) -> Option<Detection>] = &[
        detect_bsod,
        detect_disk_full,
        detect_service_crash_loop,
        detect_network_instability,
        detect_update_failure,
    ];
    let mut incidents = Vec::new();
    for detector in detectors {
        if let Some(detection) = detector(events) {
            let refs: Vec<&SnapshotEvent> = detection.evidence.iter().collect();
            let signature = signature_for_event(&detection.evidence[0]);
            incidents.push(IncidentRecord {
                schema_version: "1.0".to_string(),
                incident_id: format!("{host_id}-incident-{}", incidents.len() + 1),
                host_id: host_id.to_string(),
                kind: detection.kind.to_string(),
                window: window.clone(),
                detected_at: utc_now_iso(),
                severity: detection.severity,
                confidence: detection.confidence,
                summary: detection.summary.to_string(),
                signature,
                recommended_actions: recommended_actions(detection.kind),
                evidence: clean_evidence(&refs),
                tags: Vec::new(),
            });
        }
    }
    incidents
}

/// Highest incident severity, 0 when quiet.
pub fn host_severity(incidents: &[IncidentRecord]) -> u32 {
    incidents.iter().map(|i| i.severity).max().unwrap_or(0)
}
