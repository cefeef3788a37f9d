//! Run entry point: preview, evidence packet, header candidates,
//! ambiguity gate, recipe recall.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info};

use fleetflow_store::{append_shadow, write_json, ArtifactStore, GcsStore};

use crate::error::Result;
use crate::puhemies::recipe::{copy_recalled_recipe, lookup_recipe};
use crate::puhemies::resume::continue_run;
use crate::puhemies::{
    hash_bytes, keys, structural_hash, Choice, EvidencePacket, HeaderCandidate, HeaderSpec,
    NextStep, PuhemiesResponse,
};
use crate::tabular::reader::read_preview;
use crate::tabular::{header_looks_like_data, normalize_header};
use crate::util::{json_meta, round3};

/// Where the orchestrator found the input and what it hashed to.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Local materialization of the input (temp download for gs:// URIs).
    pub file_path: PathBuf,
    pub source_uri: String,
    pub input_artifact_key: String,
    pub file_hash: String,
    pub sheet_name: Option<String>,
}

/// Build one header candidate per preview row.
fn build_header_candidates(
    preview_rows: &[Vec<String>],
    evidence_key: &str,
) -> Vec<HeaderCandidate> {
    if preview_rows.is_empty() {
        return Vec::new();
    }
    let col_count = preview_rows.iter().map(Vec::len).max().unwrap_or(0);
    preview_rows
        .iter()
        .enumerate()
        .map(|(ridx, row)| {
            let normalized: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(idx, value)| normalize_header(value, idx))
                .collect();
            let non_empty = row.iter().filter(|v| !v.trim().is_empty()).count();
            let fill_ratio = if col_count > 0 {
                non_empty as f64 / col_count as f64
            } else {
                0.0
            };
            let penalty = if header_looks_like_data(&normalized) {
                0.2
            } else {
                0.0
            };
            let confidence = round3((fill_ratio - penalty).max(0.0).min(0.95));
            HeaderCandidate {
                candidate_id: format!("row_{ridx}"),
                header_rows: vec![ridx],
                merge_strategy: "single_row".to_string(),
                normalized_headers: normalized,
                confidence,
                evidence_keys: vec![evidence_key.to_string()],
            }
        })
        .collect()
}

/// Highest confidence wins; ties go to the lowest row index.
fn select_candidate(candidates: &[HeaderCandidate]) -> Option<&HeaderCandidate> {
    let mut best: Option<&HeaderCandidate> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.confidence <= current.confidence => {}
            _ => best = Some(candidate),
        }
    }
    best
}

fn choices_from(candidates: &[HeaderCandidate]) -> Vec<Choice> {
    candidates
        .iter()
        .map(|c| Choice {
            id: c.candidate_id.clone(),
            normalized_headers: c.normalized_headers.clone(),
            confidence: c.confidence,
        })
        .collect()
}

/// Write the evidence packet and header spec for a run and decide whether
/// a human has to pick the header row.
pub async fn orchestrate(
    store: &dyn ArtifactStore,
    run_id: &str,
    preview_rows: Vec<Vec<String>>,
    source: Option<SourceInfo>,
) -> Result<PuhemiesResponse> {
    let evidence_key = keys::evidence(run_id);
    let evidence = EvidencePacket {
        run_id: run_id.to_string(),
        artifact_key: evidence_key.clone(),
        preview_rows: preview_rows.clone(),
        source_uri: source.as_ref().map(|s| s.source_uri.clone()),
        input_artifact_key: source.as_ref().map(|s| s.input_artifact_key.clone()),
        file_path: source
            .as_ref()
            .map(|s| s.file_path.display().to_string()),
        file_hash: source.as_ref().map(|s| s.file_hash.clone()),
        structural_hash: source
            .as_ref()
            .map(|_| structural_hash(&preview_rows)),
        sheet_name: source.as_ref().and_then(|s| s.sheet_name.clone()),
    };
    write_json(store, &evidence_key, &evidence).await?;

    let candidates = build_header_candidates(&preview_rows, &evidence_key);
    if candidates.is_empty() {
        let header_spec = HeaderSpec {
            run_id: run_id.to_string(),
            artifact_key: keys::header_spec(run_id),
            selected_candidate_id: String::new(),
            candidates: Vec::new(),
            needs_human_confirmation: true,
            alternatives: Vec::new(),
            refusal_reason: None,
        };
        write_json(store, &keys::header_spec(run_id), &header_spec).await?;
        append_shadow(store, run_id, "stop_due_to_empty_preview", json_meta(json!({}))).await?;
        return Ok(PuhemiesResponse::needs_confirmation(
            run_id,
            "No header candidates found in preview.",
            Some("Provide a manual recipe or re-run with a non-empty file."),
            NextStep::ProvideConfirmedHeaderCandidate,
        )
        .with_choices(Vec::new()));
    }

    let selected = select_candidate(&candidates).expect("candidates checked non-empty");
    let selected_id = selected.candidate_id.clone();
    let ambiguous = header_looks_like_data(&selected.normalized_headers);
    let header_spec = HeaderSpec {
        run_id: run_id.to_string(),
        artifact_key: keys::header_spec(run_id),
        selected_candidate_id: selected_id.clone(),
        candidates: candidates.clone(),
        needs_human_confirmation: ambiguous,
        alternatives: candidates
            .iter()
            .filter(|c| c.candidate_id != selected_id)
            .map(|c| c.candidate_id.clone())
            .collect(),
        refusal_reason: None,
    };
    write_json(store, &keys::header_spec(run_id), &header_spec).await?;

    if ambiguous {
        append_shadow(
            store,
            run_id,
            "stop_due_to_ambiguous_headers",
            json_meta(json!({ "selected_candidate_id": selected_id })),
        )
        .await?;
        debug!(run_id, %selected_id, "header selection ambiguous, suspending");
        return Ok(PuhemiesResponse::needs_confirmation(
            run_id,
            "Header selection is ambiguous and looks like data.",
            Some("Which header candidate should be used?"),
            NextStep::ProvideConfirmedHeaderCandidate,
        )
        .with_choices(choices_from(&candidates)));
    }

    append_shadow(
        store,
        run_id,
        "header_selection_ok",
        json_meta(json!({ "selected_candidate_id": selected_id })),
    )
    .await?;
    Ok(PuhemiesResponse::ok(
        run_id,
        "Header selection accepted.",
        NextStep::ContinueToSchema,
    ))
}

/// Materialize a `gs://` input locally; plain paths pass through.
async fn materialize_input(run_id: &str, input_path: &str) -> Result<PathBuf> {
    if !fleetflow_store::is_gcs_uri(input_path) {
        return Ok(PathBuf::from(input_path));
    }
    let (bucket, object) = fleetflow_store::parse_gcs_uri(input_path);
    let remote = GcsStore::new(&bucket, "");
    let bytes = ArtifactStore::read_bytes(&remote, &object).await?;
    let basename = Path::new(&object)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input.bin".to_string());
    let local = std::env::temp_dir().join(format!("fleetflow-{run_id}-{basename}"));
    tokio::fs::write(&local, &bytes).await?;
    Ok(local)
}

/// Full Core A entry point: preview, hash, persist the input copy,
/// orchestrate, then consult the recipe store for an automatic replay.
pub async fn run_from_file(
    store: &dyn ArtifactStore,
    run_id: &str,
    input_path: &str,
) -> Result<PuhemiesResponse> {
    let local_path = materialize_input(run_id, input_path).await?;
    let (preview_rows, sheet_name) = read_preview(&local_path)?;

    let bytes = tokio::fs::read(&local_path).await?;
    let file_hash = hash_bytes(&bytes);
    let basename = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let input_artifact_key = format!("{run_id}/input/{basename}");
    store.write_bytes(&input_artifact_key, &bytes).await?;
    info!(run_id, input = %local_path.display(), "input copied into run directory");

    let source = SourceInfo {
        file_path: local_path.clone(),
        source_uri: input_path.to_string(),
        input_artifact_key,
        file_hash,
        sheet_name,
    };
    let response = orchestrate(store, run_id, preview_rows.clone(), Some(source)).await?;

    let fingerprint = structural_hash(&preview_rows);
    if let Some(recalled) = lookup_recipe(store, &fingerprint).await? {
        copy_recalled_recipe(store, run_id, &recalled).await?;
        append_shadow(
            store,
            run_id,
            "manual_recipe_recalled",
            json_meta(json!({ "structural_hash": fingerprint })),
        )
        .await?;
        info!(run_id, "recalled recipe applied for matching fingerprint");
        return continue_run(store, run_id).await;
    }
    Ok(response)
}
