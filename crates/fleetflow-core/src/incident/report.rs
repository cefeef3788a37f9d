//! Human-readable host report rendering.

use crate::incident::HostTimeline;

/// Render `<run_id>/hosts/<host_id>/report.md`.
pub fn render_host_report(timeline: &HostTimeline) -> String {
    let mut lines = vec![
        format!("# Host report: {}", timeline.host_id),
        String::new(),
        format!(
            "Window: {} -> {}",
            timeline.window.start.as_deref().unwrap_or(""),
            timeline.window.end.as_deref().unwrap_or("")
        ),
        String::new(),
    ];
    if timeline.incidents.is_empty() {
        lines.push("No incidents detected.".to_string());
        return lines.join("\n");
    }
    lines.push("Incidents:".to_string());
    for incident in &timeline.incidents {
        lines.push(format!(
            "- [{}] {} (type={}, confidence={})",
            incident.severity, incident.summary, incident.kind, incident.confidence
        ));
        for action in &incident.recommended_actions {
            lines.push(format!("  - Action: {action}"));
        }
        if let Some(sample) = incident.evidence.first() {
            let event_id = sample
                .event_id
                .as_ref()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            lines.push(format!(
                "  - Evidence: {} {} {} {}",
                sample.ts, sample.provider, event_id, sample.message
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{EvidenceEvent, IncidentRecord, Signature, Window};
    use serde_json::json;

    fn quiet_timeline() -> HostTimeline {
        HostTimeline {
            schema_version: "1.0".to_string(),
            host_id: "HOST-001".to_string(),
            user_id: None,
            window: Window {
                start: Some("2026-01-01T00:00:00Z".to_string()),
                end: Some("2026-01-01T12:00:00Z".to_string()),
            },
            events: Vec::new(),
            incidents: Vec::new(),
            tickets: Vec::new(),
            last_event_ts: String::new(),
            severity: 0,
        }
    }

    #[test]
    fn test_quiet_host_report() {
        let report = render_host_report(&quiet_timeline());
        assert!(report.contains("# Host report: HOST-001"));
        assert!(report.contains("2026-01-01T00:00:00Z"));
        assert!(report.contains("2026-01-01T12:00:00Z"));
        assert!(report.contains("No incidents detected."));
    }

    #[test]
    fn test_incident_report_lists_actions_and_evidence() {
        let mut timeline = quiet_timeline();
        timeline.incidents.push(IncidentRecord {
            schema_version: "1.0".to_string(),
            incident_id: "HOST-001-incident-1".to_string(),
            host_id: "HOST-001".to_string(),
            kind: "disk_full".to_string(),
            window: timeline.window.clone(),
            detected_at: "2026-01-01T12:00:00Z".to_string(),
            severity: 70,
            confidence: 0.75,
            summary: "Disk usage approaching capacity".to_string(),
            signature: Signature {
                signature_key: "Disk:7|disk failure imminent".to_string(),
                signature_hash: "abc123def456".to_string(),
            },
            recommended_actions: vec!["Clear temp folders and large caches.".to_string()],
            evidence: vec![EvidenceEvent {
                ts: "2026-01-01T13:00:00Z".to_string(),
                provider: "Disk".to_string(),
                level: "Error".to_string(),
                message: "Disk failure imminent".to_string(),
                event_id: Some(json!(7)),
                source: None,
                record_id: None,
            }],
            tags: Vec::new(),
        });
        let report = render_host_report(&timeline);
        assert!(report.contains("[70] Disk usage approaching capacity (type=disk_full"));
        assert!(report.contains("  - Action: Clear temp folders"));
        assert!(report.contains("  - Evidence: 2026-01-01T13:00:00Z Disk 7 Disk failure imminent"));
    }
}
