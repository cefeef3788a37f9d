//! Scenario validation against synthetic truth labels.
//!
//! A run produced from a generated scenario carries a
//! `<run_id>/truth.json` describing what the detector should have found.
//! Validation scores incident-type precision/recall, top-host ranking
//! quality and cluster detection, records scenario-tag warnings, and
//! writes `validation_report.md` plus `validation_summary.json` back
//! into the run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use fleetflow_store::{append_shadow, read_json, write_json, ArtifactStore};

use crate::error::{FlowError, Result};
use crate::incident::FleetSummary;
use crate::schema::validate_run;
use crate::util::json_meta;

/// Truth labels shipped alongside a synthetic scenario.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TruthLabels {
    #[serde(default)]
    pub expects_incident_types: Vec<String>,
    #[serde(default)]
    pub expects_clustered_outage: bool,
    #[serde(default)]
    pub expected_top_hosts: Vec<String>,
    #[serde(default)]
    pub scenario_tags: Vec<String>,
}

/// Validation scores for one run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub run_id: String,
    pub incident_type_precision: f64,
    pub incident_type_recall: f64,
    pub ranking_score: f64,
    pub cluster_detected: bool,
    pub schema_errors: Vec<String>,
    pub scenario_warnings: Vec<String>,
}

async fn collect_detected_types(
    store: &dyn ArtifactStore,
    run_id: &str,
) -> Result<BTreeSet<String>> {
    let mut detected = BTreeSet::new();
    for key in store.list(&format!("{run_id}/hosts")).await? {
        if !key.ends_with("timeline.json") {
            continue;
        }
        let timeline: Value = read_json(store, &key).await?;
        for incident in timeline
            .get("incidents")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(kind) = incident.get("type").and_then(Value::as_str) {
                detected.insert(kind.to_string());
            }
        }
    }
    Ok(detected)
}

fn precision_recall(truth: &BTreeSet<String>, detected: &BTreeSet<String>) -> (f64, f64) {
    if truth.is_empty() {
        return (1.0, 1.0);
    }
    let tp = truth.intersection(detected).count() as f64;
    let precision = tp / detected.len().max(1) as f64;
    let recall = tp / truth.len() as f64;
    (precision, recall)
}

fn ranking_hits(summary: &FleetSummary, expected: &[String]) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let observed: Vec<&str> = summary
        .top_hosts
        .iter()
        .take(expected.len())
        .map(|h| h.host_id.as_str())
        .collect();
    let hits = expected
        .iter()
        .filter(|host| observed.contains(&host.as_str()))
        .count();
    hits as f64 / expected.len() as f64
}

async fn scenario_warnings(
    store: &dyn ArtifactStore,
    run_id: &str,
    truth: &TruthLabels,
    summary: &FleetSummary,
) -> Result<Vec<String>> {
    let tags: BTreeSet<&str> = truth.scenario_tags.iter().map(String::as_str).collect();
    let mut warnings = Vec::new();
    if tags.contains("driver_rollout_wave")
        && !summary.clusters.iter().any(|c| c.affected_hosts >= 2)
    {
        warnings.push("expected clustered outage but none detected".to_string());
    }
    if tags.contains("missing_data") && summary.host_count == 0 {
        warnings.push("missing_data scenario resulted in zero hosts (unexpected)".to_string());
    }
    if tags.contains("time_skew") {
        let snapshot_hosts: BTreeSet<String> = store
            .list(&format!("{run_id}/snapshots"))
            .await?
            .into_iter()
            .filter(|k| k.ends_with(".json"))
            .filter_map(|k| {
                let parts: Vec<&str> = k.split('/').collect();
                (parts.len() >= 2).then(|| parts[parts.len() - 2].to_string())
            })
            .collect();
        if summary.host_count != snapshot_hosts.len() {
            warnings.push("time_skew scenario host count mismatch".to_string());
        }
    }
    Ok(warnings)
}

fn render_report(truth: &TruthLabels, summary: &FleetSummary, result: &ValidationSummary) -> String {
    let mut lines = vec![
        format!("# Validation report for run {}", result.run_id),
        String::new(),
        "## Schema".to_string(),
        format!("- Schema errors: {}", result.schema_errors.len()),
        String::new(),
        "## Scores".to_string(),
        format!(
            "- Incident type precision: {:.2}",
            result.incident_type_precision
        ),
        format!("- Incident type recall: {:.2}", result.incident_type_recall),
        format!("- Ranking quality (hit rate): {:.2}", result.ranking_score),
        format!(
            "- Cluster detected: {}",
            if result.cluster_detected { "yes" } else { "no" }
        ),
        String::new(),
        "## Truth labels".to_string(),
        format!(
            "- Expected types: {}",
            truth.expects_incident_types.join(", ")
        ),
        format!(
            "- Expects clustered outage: {}",
            truth.expects_clustered_outage
        ),
        format!(
            "- Expected top hosts: {}",
            truth.expected_top_hosts.join(", ")
        ),
        format!("- Scenario tags: {}", truth.scenario_tags.join(", ")),
        String::new(),
        "## Fleet summary snapshot".to_string(),
        format!("- Host count: {}", summary.host_count),
        format!("- Incident count: {}", summary.incident_count),
        format!("- Clusters detected: {}", summary.clusters.len()),
        format!(
            "- Top hosts seen: {}",
            summary
                .top_hosts
                .iter()
                .map(|h| h.host_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        String::new(),
        "## Notes".to_string(),
        "Scores are deterministic for a given seed and snapshot set.".to_string(),
    ];
    if !result.schema_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Schema errors".to_string());
        for err in &result.schema_errors {
            lines.push(format!("- {err}"));
        }
    }
    if !result.scenario_warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Scenario warnings".to_string());
        for warning in &result.scenario_warnings {
            lines.push(format!("- {warning}"));
        }
    }
    lines.join("\n")
}

/// Score a run against its truth labels and persist the report. Schema
/// errors always fail; scenario warnings fail only under
/// `strict_scenario`.
pub async fn validate_scenario(
    store: &dyn ArtifactStore,
    run_id: &str,
    strict_scenario: bool,
) -> Result<ValidationSummary> {
    let schema_errors = validate_run(store, run_id).await?;
    let truth: TruthLabels = read_json(store, &format!("{run_id}/truth.json")).await?;
    let summary: FleetSummary = read_json(store, &format!("{run_id}/fleet_summary.json")).await?;

    let detected = collect_detected_types(store, run_id).await?;
    let expected: BTreeSet<String> = truth.expects_incident_types.iter().cloned().collect();
    let (precision, recall) = precision_recall(&expected, &detected);
    let warnings = scenario_warnings(store, run_id, &truth, &summary).await?;

    let result = ValidationSummary {
        run_id: run_id.to_string(),
        incident_type_precision: precision,
        incident_type_recall: recall,
        ranking_score: ranking_hits(&summary, &truth.expected_top_hosts),
        cluster_detected: summary.clusters.iter().any(|c| c.affected_hosts >= 2),
        schema_errors,
        scenario_warnings: warnings,
    };

    store
        .write_text(
            &format!("{run_id}/validation_report.md"),
            &render_report(&truth, &summary, &result),
        )
        .await?;
    write_json(store, &format!("{run_id}/validation_summary.json"), &result).await?;
    append_shadow(
        store,
        run_id,
        "validation",
        json_meta(json!({
            "precision": result.incident_type_precision,
            "recall": result.incident_type_recall,
            "warnings": result.scenario_warnings.len(),
        })),
    )
    .await?;

    if !result.schema_errors.is_empty() {
        return Err(FlowError::SchemaValidation(result.schema_errors.join("; ")));
    }
    if strict_scenario && !result.scenario_warnings.is_empty() {
        return Err(FlowError::ScenarioChecks(
            result.scenario_warnings.join("; "),
        ));
    }
    Ok(result)
}
