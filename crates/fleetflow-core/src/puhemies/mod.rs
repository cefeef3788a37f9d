//! Puhemies — resumable tabular ingestion pipeline.
//!
//! The run's artifacts under `<run_id>/` *are* its state; the process is
//! ephemeral. [`orchestrate::run_from_file`] previews the input, proposes
//! header candidates and either completes or suspends for human input.
//! [`resume::continue_run`] picks the run back up once a confirmation,
//! override or manual recipe has been written. Save manifests are written
//! last so re-invocation after partial writes stays idempotent.

pub mod orchestrate;
pub mod recipe;
pub mod resume;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use fleetflow_store::{write_json, ArtifactStore};

use crate::error::Result;
use crate::tabular::normalize_label;

pub use orchestrate::{orchestrate, run_from_file};
pub use resume::continue_run;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Outcome of an orchestrate/continue invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Ok,
    NeedsHumanConfirmation,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    ContinueToSchema,
    ProvideConfirmedHeaderCandidate,
    WriteHumanConfirmation,
    FixManualRecipe,
    RerunRequired,
    ReviewArtifacts,
}

/// One selectable header candidate in a suspension response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub normalized_headers: Vec<String>,
    pub confidence: f64,
}

/// Public response shape of the Core A API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuhemiesResponse {
    pub run_id: String,
    pub status: FlowStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Choice>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextStep>,
}

impl PuhemiesResponse {
    pub fn ok(run_id: &str, message: &str, next_step: NextStep) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: FlowStatus::Ok,
            message: message.to_string(),
            question: None,
            choices: None,
            next_step: Some(next_step),
        }
    }

    pub fn needs_confirmation(
        run_id: &str,
        message: &str,
        question: Option<&str>,
        next_step: NextStep,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: FlowStatus::NeedsHumanConfirmation,
            message: message.to_string(),
            question: question.map(str::to_string),
            choices: None,
            next_step: Some(next_step),
        }
    }

    pub fn with_choices(mut self, choices: Vec<Choice>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == FlowStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Immutable record of what the orchestrator saw: preview rows, hashes
/// and the persisted input copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePacket {
    pub run_id: String,
    pub artifact_key: String,
    pub preview_rows: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_artifact_key: Option<String>,
    /// Local materialization of the source, re-hashed by the resume guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structural_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderCandidate {
    pub candidate_id: String,
    pub header_rows: Vec<usize>,
    pub merge_strategy: String,
    pub normalized_headers: Vec<String>,
    pub confidence: f64,
    pub evidence_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderSpec {
    pub run_id: String,
    pub artifact_key: String,
    pub selected_candidate_id: String,
    pub candidates: Vec<HeaderCandidate>,
    pub needs_human_confirmation: bool,
    pub alternatives: Vec<String>,
    pub refusal_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanConfirmation {
    pub confirmed_header_candidate: String,
    #[serde(default)]
    pub confirmed_by: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOverride {
    #[serde(default)]
    pub header_row_index: usize,
    #[serde(default)]
    pub edited_headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
}

/// Optional row/column clipping applied before the adapter layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRegion {
    #[serde(default)]
    pub start_row: Option<usize>,
    #[serde(default)]
    pub end_row: Option<usize>,
    #[serde(default)]
    pub include_columns: Vec<String>,
    #[serde(default)]
    pub exclude_columns: Vec<String>,
}

/// Optional renaming/typing layer applied on top of a confirmed header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterSchema {
    #[serde(default)]
    pub canonical_fields: Vec<String>,
    #[serde(default)]
    pub field_map: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub types: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub evidence_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    pub source: String,
    pub canonical: String,
    pub dtype: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaFieldSet {
    pub fields: Vec<SchemaField>,
    pub unmapped_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub run_id: String,
    pub artifact_key: String,
    pub schema_layer: String,
    pub schema_spec: SchemaFieldSet,
    pub confidence: f64,
    pub alternatives: Vec<serde_json::Value>,
    pub evidence_keys: Vec<String>,
    pub refusal_reason: Option<String>,
}

/// Terminal marker for a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveManifest {
    pub run_id: String,
    pub artifact_key: String,
    pub saved_files: Vec<String>,
    pub saved_uris: Vec<String>,
    pub report_paths: Vec<String>,
    pub confidence: f64,
    pub alternatives: Vec<serde_json::Value>,
    pub evidence_keys: Vec<String>,
    pub refusal_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Keys & hashing
// ---------------------------------------------------------------------------

pub(crate) mod keys {
    pub fn evidence(run_id: &str) -> String {
        format!("{run_id}/evidence_packet.json")
    }
    pub fn header_spec(run_id: &str) -> String {
        format!("{run_id}/header_spec.json")
    }
    pub fn confirmation(run_id: &str) -> String {
        format!("{run_id}/human_confirmation.json")
    }
    pub fn header_override(run_id: &str) -> String {
        format!("{run_id}/header_override.json")
    }
    pub fn manual_recipe(run_id: &str) -> String {
        format!("{run_id}/manual_recipe.json")
    }
    pub fn table_region(run_id: &str) -> String {
        format!("{run_id}/table_region.json")
    }
    pub fn adapter(run_id: &str) -> String {
        format!("{run_id}/adapter_schema_spec.json")
    }
    pub fn schema_spec(run_id: &str) -> String {
        format!("{run_id}/schema_spec.json")
    }
    pub fn save_manifest(run_id: &str) -> String {
        format!("{run_id}/save_manifest.json")
    }
    pub fn clean_csv(run_id: &str) -> String {
        format!("{run_id}/output/clean.csv")
    }
    pub fn clean_data_csv(run_id: &str) -> String {
        format!("{run_id}/output/clean_data.csv")
    }
    pub fn extracted_metadata(run_id: &str) -> String {
        format!("{run_id}/output/extracted_metadata.json")
    }
}

/// SHA-256 of the full input bytes, lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Structural fingerprint of the first preview rows: cells are
/// whitespace-collapsed and lowercased, joined with `|` per row and `\n`
/// across rows. The filename is excluded so sibling files with the same
/// shape share a fingerprint.
pub fn structural_hash(preview_rows: &[Vec<String>]) -> String {
    let flattened: Vec<String> = preview_rows
        .iter()
        .take(crate::tabular::reader::PREVIEW_ROWS)
        .map(|row| {
            row.iter()
                .map(|cell| normalize_label(cell))
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect();
    hash_bytes(flattened.join("\n").as_bytes())
}

/// Record a human's header choice for a suspended run.
pub async fn write_human_confirmation(
    store: &dyn ArtifactStore,
    run_id: &str,
    choice_id: &str,
    confirmed_by: &str,
) -> Result<()> {
    let payload = HumanConfirmation {
        confirmed_header_candidate: choice_id.to_string(),
        confirmed_by: Some(confirmed_by.to_string()),
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
    };
    write_json(store, &keys::confirmation(run_id), &payload).await?;
    Ok(())
}
