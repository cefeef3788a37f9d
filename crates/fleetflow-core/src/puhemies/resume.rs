//! Resume a suspended run: apply the highest-precedence human input and
//! extract the clean table.
//!
//! Input precedence (highest first): manual recipe, header override,
//! human confirmation. A file-hash guard re-verifies the source before
//! anything else; divergence suspends the run again.

use std::path::Path;

use serde_json::json;
use tracing::{info, warn};

use fleetflow_store::{append_shadow, read_json, write_json, ArtifactStore};

use crate::error::{FlowError, Result};
use crate::puhemies::recipe::{apply_manual_recipe, RecipeError};
use crate::puhemies::{
    hash_bytes, keys, AdapterSchema, EvidencePacket, HeaderCandidate, HeaderOverride, HeaderSpec,
    HumanConfirmation, NextStep, PuhemiesResponse, SaveManifest, SchemaField, SchemaFieldSet,
    SchemaSpec, TableRegion,
};
use crate::tabular::reader::read_grid;
use crate::tabular::{clean_date, clean_number_capture, infer_dtype, normalize_header};
use crate::util::json_meta;

/// Resume a run from its persisted state.
pub async fn continue_run(store: &dyn ArtifactStore, run_id: &str) -> Result<PuhemiesResponse> {
    let evidence: EvidencePacket = read_json(store, &keys::evidence(run_id)).await?;

    // Resume guard: the source must still be the file the evidence hashed.
    if let (Some(path), Some(expected)) = (&evidence.file_path, &evidence.file_hash) {
        let current = match tokio::fs::read(path).await {
            Ok(bytes) => hash_bytes(&bytes),
            Err(_) => "unavailable".to_string(),
        };
        if &current != expected {
            append_shadow(
                store,
                run_id,
                "resume_guard_file_changed",
                json_meta(json!({ "expected_hash": expected, "current_hash": current })),
            )
            .await?;
            warn!(run_id, "input file changed since the run started");
            return Ok(PuhemiesResponse::needs_confirmation(
                run_id,
                "Input file has changed since the run started.",
                Some("Please re-run with the updated file."),
                NextStep::RerunRequired,
            ));
        }
    }

    if store.exists(&keys::manual_recipe(run_id)).await? {
        let recipe: serde_json::Value = read_json(store, &keys::manual_recipe(run_id)).await?;
        match apply_manual_recipe(store, run_id, &recipe, &evidence).await {
            Ok(()) => {
                return Ok(PuhemiesResponse::ok(
                    run_id,
                    "Manual recipe applied and outputs saved.",
                    NextStep::ReviewArtifacts,
                ))
            }
            Err(RecipeError::Invalid(message)) => {
                return Ok(PuhemiesResponse::needs_confirmation(
                    run_id,
                    &message,
                    Some("Please fix manual_recipe.json and retry."),
                    NextStep::FixManualRecipe,
                ))
            }
            Err(RecipeError::Flow(e)) => return Err(e),
        }
    }

    let (headers, header_row) = if store.exists(&keys::header_override(run_id)).await? {
        let header_override: HeaderOverride =
            read_json(store, &keys::header_override(run_id)).await?;
        apply_header_override(store, run_id, &header_override, &evidence).await?
    } else {
        if !store.exists(&keys::confirmation(run_id)).await? {
            return Ok(PuhemiesResponse::needs_confirmation(
                run_id,
                "Missing human confirmation.",
                Some("Provide confirmed header candidate id."),
                NextStep::WriteHumanConfirmation,
            ));
        }
        let header_spec: HeaderSpec = read_json(store, &keys::header_spec(run_id)).await?;
        let confirmation: HumanConfirmation = read_json(store, &keys::confirmation(run_id)).await?;
        let selected = header_spec
            .candidates
            .iter()
            .find(|c| c.candidate_id == confirmation.confirmed_header_candidate);
        let Some(selected) = selected else {
            return Ok(PuhemiesResponse::needs_confirmation(
                run_id,
                "Confirmed header candidate not found.",
                Some("Provide a valid header candidate id."),
                NextStep::WriteHumanConfirmation,
            ));
        };
        append_shadow(
            store,
            run_id,
            "human_confirmation_received",
            json_meta(json!({
                "confirmed_header_candidate": confirmation.confirmed_header_candidate
            })),
        )
        .await?;
        (
            selected.normalized_headers.clone(),
            selected.header_rows.first().copied().unwrap_or(0),
        )
    };

    let data_rows = read_data_rows(&evidence, header_row)?;

    let adapter: Option<AdapterSchema> = if store.exists(&keys::adapter(run_id)).await? {
        Some(read_json(store, &keys::adapter(run_id)).await?)
    } else {
        None
    };
    let region: Option<TableRegion> = if store.exists(&keys::table_region(run_id)).await? {
        Some(read_json(store, &keys::table_region(run_id)).await?)
    } else {
        None
    };

    let (headers, data_rows) = apply_table_region(headers, data_rows, header_row, region.as_ref());
    write_schema_and_output(store, run_id, data_rows, headers, adapter.as_ref()).await?;
    info!(run_id, "schema created and output saved");

    Ok(PuhemiesResponse::ok(
        run_id,
        "Schema created and output saved.",
        NextStep::ReviewArtifacts,
    ))
}

/// Rows below the header row, from the full sheet when the run has a
/// source file, else from the preview.
fn read_data_rows(evidence: &EvidencePacket, header_row: usize) -> Result<Vec<Vec<String>>> {
    let rows = match &evidence.file_path {
        Some(path) => read_grid(Path::new(path), evidence.sheet_name.as_deref())?,
        None => evidence.preview_rows.clone(),
    };
    Ok(rows.into_iter().skip(header_row + 1).collect())
}

/// Derive final headers from a row index plus per-header edits, and write
/// a synthetic header spec with candidate id `manual`.
async fn apply_header_override(
    store: &dyn ArtifactStore,
    run_id: &str,
    header_override: &HeaderOverride,
    evidence: &EvidencePacket,
) -> Result<(Vec<String>, usize)> {
    let sheet_name = header_override
        .sheet_name
        .clone()
        .or_else(|| evidence.sheet_name.clone());
    let header_row_index = header_override.header_row_index;

    let raw_headers: Vec<String> = match &evidence.file_path {
        Some(path) => {
            let grid = read_grid(Path::new(path), sheet_name.as_deref())?;
            grid.get(header_row_index).cloned().unwrap_or_default()
        }
        None => evidence
            .preview_rows
            .get(header_row_index)
            .cloned()
            .unwrap_or_default(),
    };

    let final_headers: Vec<String> = raw_headers
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            let normalized = normalize_header(value, idx);
            header_override
                .edited_headers
                .get(&normalized)
                .cloned()
                .unwrap_or(normalized)
        })
        .collect();

    let header_spec = HeaderSpec {
        run_id: run_id.to_string(),
        artifact_key: keys::header_spec(run_id),
        selected_candidate_id: "manual".to_string(),
        candidates: vec![HeaderCandidate {
            candidate_id: "manual".to_string(),
            header_rows: vec![header_row_index],
            merge_strategy: "single".to_string(),
            normalized_headers: final_headers.clone(),
            confidence: 0.9,
            evidence_keys: vec![evidence.artifact_key.clone()],
        }],
        needs_human_confirmation: false,
        alternatives: Vec::new(),
        refusal_reason: None,
    };
    write_json(store, &keys::header_spec(run_id), &header_spec).await?;
    append_shadow(
        store,
        run_id,
        "header_override_applied",
        json_meta(json!({
            "header_row_index": header_row_index,
            "sheet_name": sheet_name,
        })),
    )
    .await?;
    Ok((final_headers, header_row_index))
}

/// Clip rows by absolute indices and filter columns by name.
fn apply_table_region(
    headers: Vec<String>,
    mut data_rows: Vec<Vec<String>>,
    header_row: usize,
    region: Option<&TableRegion>,
) -> (Vec<String>, Vec<Vec<String>>) {
    let Some(region) = region else {
        return (headers, data_rows);
    };

    let data_start_index = header_row + 1;
    let start_offset = region
        .start_row
        .map(|start| start.saturating_sub(data_start_index))
        .unwrap_or(0);
    let end_offset = region
        .end_row
        .map(|end| end.saturating_sub(data_start_index));

    data_rows = match end_offset {
        Some(end) if start_offset <= end => data_rows
            .into_iter()
            .skip(start_offset)
            .take(end - start_offset + 1)
            .collect(),
        Some(_) => Vec::new(),
        None => data_rows.into_iter().skip(start_offset).collect(),
    };

    let keep: Vec<usize> = if !region.include_columns.is_empty() {
        headers
            .iter()
            .enumerate()
            .filter(|(_, name)| region.include_columns.contains(name))
            .map(|(idx, _)| idx)
            .collect()
    } else if !region.exclude_columns.is_empty() {
        headers
            .iter()
            .enumerate()
            .filter(|(_, name)| !region.exclude_columns.contains(name))
            .map(|(idx, _)| idx)
            .collect()
    } else {
        (0..headers.len()).collect()
    };

    let headers = keep.iter().map(|&idx| headers[idx].clone()).collect();
    let data_rows = data_rows
        .into_iter()
        .map(|row| {
            keep.iter()
                .map(|&idx| row.get(idx).cloned().unwrap_or_default())
                .collect()
        })
        .collect();
    (headers, data_rows)
}

fn enforce_types(rows: Vec<Vec<String>>, types: &[String]) -> Vec<Vec<String>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(idx, value)| match types.get(idx).map(String::as_str) {
                    Some("number") => clean_number_capture(&value),
                    Some("date") => clean_date(&value),
                    _ => value,
                })
                .collect()
        })
        .collect()
}

fn column_values(rows: &[Vec<String>], idx: usize) -> Vec<String> {
    rows.iter()
        .map(|row| row.get(idx).cloned().unwrap_or_default())
        .collect()
}

fn csv_bytes(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))
}

/// Write `schema_spec.json`, `output/clean.csv`, and the save manifest.
/// The manifest is written last: its presence marks the run done.
async fn write_schema_and_output(
    store: &dyn ArtifactStore,
    run_id: &str,
    data_rows: Vec<Vec<String>>,
    headers: Vec<String>,
    adapter: Option<&AdapterSchema>,
) -> Result<()> {
    let (headers, rows, schema_fields, schema_layer, evidence_keys) = match adapter {
        Some(adapter) => {
            let mut output_headers: Vec<String> = adapter
                .canonical_fields
                .iter()
                .filter(|field| adapter.field_map.contains_key(*field))
                .cloned()
                .collect();
            if output_headers.is_empty() {
                output_headers = adapter.field_map.keys().cloned().collect();
            }
            let header_index: std::collections::BTreeMap<&str, usize> = headers
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.as_str(), idx))
                .collect();
            let mapped: Vec<Vec<String>> = data_rows
                .iter()
                .map(|row| {
                    output_headers
                        .iter()
                        .map(|canonical| {
                            adapter
                                .field_map
                                .get(canonical)
                                .and_then(|source| header_index.get(source.as_str()))
                                .and_then(|&idx| row.get(idx))
                                .cloned()
                                .unwrap_or_default()
                        })
                        .collect()
                })
                .collect();
            let types: Vec<String> = output_headers
                .iter()
                .map(|header| {
                    adapter
                        .types
                        .get(header)
                        .cloned()
                        .unwrap_or_else(|| "string".to_string())
                })
                .collect();
            let rows = enforce_types(mapped, &types);
            let schema_fields = output_headers
                .iter()
                .map(|canonical| SchemaField {
                    source: adapter.field_map.get(canonical).cloned().unwrap_or_default(),
                    canonical: canonical.clone(),
                    dtype: adapter
                        .types
                        .get(canonical)
                        .cloned()
                        .unwrap_or_else(|| "string".to_string()),
                    required: adapter.required_fields.contains(canonical),
                })
                .collect();
            let evidence_keys = if adapter.evidence_keys.is_empty() {
                vec![keys::header_spec(run_id)]
            } else {
                adapter.evidence_keys.clone()
            };
            (output_headers, rows, schema_fields, "adapter", evidence_keys)
        }
        None => {
            let schema_fields = headers
                .iter()
                .enumerate()
                .map(|(idx, header)| {
                    let values = column_values(&data_rows, idx);
                    let required =
                        !values.is_empty() && values.iter().all(|v| !v.trim().is_empty());
                    SchemaField {
                        source: header.clone(),
                        canonical: header.clone(),
                        dtype: infer_dtype(&values).to_string(),
                        required,
                    }
                })
                .collect();
            (
                headers,
                data_rows,
                schema_fields,
                "core",
                vec![keys::header_spec(run_id)],
            )
        }
    };

    let schema_spec = SchemaSpec {
        run_id: run_id.to_string(),
        artifact_key: keys::schema_spec(run_id),
        schema_layer: schema_layer.to_string(),
        schema_spec: SchemaFieldSet {
            fields: schema_fields,
            unmapped_columns: Vec::new(),
        },
        confidence: 0.7,
        alternatives: Vec::new(),
        evidence_keys,
        refusal_reason: None,
    };
    write_json(store, &keys::schema_spec(run_id), &schema_spec).await?;

    let output_key = keys::clean_csv(run_id);
    store
        .write_bytes(&output_key, &csv_bytes(&headers, &rows)?)
        .await?;

    let manifest = SaveManifest {
        run_id: run_id.to_string(),
        artifact_key: keys::save_manifest(run_id),
        saved_files: vec![output_key.clone()],
        saved_uris: vec![store.uri_for_key(&output_key)],
        report_paths: Vec::new(),
        confidence: 0.7,
        alternatives: Vec::new(),
        evidence_keys: vec![keys::schema_spec(run_id)],
        refusal_reason: None,
    };
    write_json(store, &keys::save_manifest(run_id), &manifest).await?;
    Ok(())
}
