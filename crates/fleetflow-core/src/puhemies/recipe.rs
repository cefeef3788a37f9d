//! Manual extraction recipes and the content-addressed recipe store.
//!
//! Recipes arrive as loose JSON; parsing happens once at the boundary and
//! accumulates warnings (`missing_target`, `invalid_metadata_pointer`,
//! ...) instead of failing. The only hard requirements are a readable
//! source file and at least one column field.
//!
//! A recipe that extracts successfully is stored under
//! `recipe_store/<structural_hash>/manual_recipe.json` and indexed by
//! fingerprint, so future runs over structurally identical files replay
//! it without human input. Last writer wins per fingerprint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use fleetflow_store::{append_shadow, read_json, write_json, ArtifactStore};

use crate::error::{FlowError, Result};
use crate::puhemies::{
    keys, EvidencePacket, SaveManifest, SchemaField, SchemaFieldSet, SchemaSpec,
};
use crate::tabular::reader::read_grid;
use crate::tabular::{clean_value, infer_dtype, normalize_label};
use crate::util::json_meta;

const RECIPE_INDEX_KEY: &str = "recipe_store/recipe_index.json";
const HEADER_SCAN_LIMIT: usize = 50;

/// Errors from applying a manual recipe. `Invalid` is the recoverable
/// kind surfaced as a `fix_manual_recipe` response.
#[derive(Debug)]
pub enum RecipeError {
    Invalid(String),
    Flow(FlowError),
}

impl From<FlowError> for RecipeError {
    fn from(err: FlowError) -> Self {
        RecipeError::Flow(err)
    }
}

impl From<fleetflow_store::StoreError> for RecipeError {
    fn from(err: fleetflow_store::StoreError) -> Self {
        RecipeError::Flow(FlowError::Store(err))
    }
}

/// Index entry pointing at a stored recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeIndexEntry {
    pub recipe_key: String,
    pub stored_at: String,
    pub source_run_id: String,
}

#[derive(Debug, Clone)]
struct MetadataField {
    target: String,
    row: i64,
    col: i64,
    data_type: Option<String>,
}

#[derive(Debug, Clone)]
struct ColumnField {
    target: String,
    column_name: Option<String>,
    column_index: Option<usize>,
    data_type: Option<String>,
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `{row, col}` with integer-coercible values.
fn parse_metadata_pointer(pointer: &Value) -> Option<(i64, i64)> {
    let obj = pointer.as_object()?;
    let row = value_as_i64(obj.get("row")?)?;
    let col = value_as_i64(obj.get("col")?)?;
    Some((row, col))
}

enum ColumnPointer {
    Name(String),
    Index(i64),
}

/// Column pointers come in several shapes: a bare name, a bare index, or
/// an object keyed `column`/`header`/`column_name`/`col`.
fn parse_column_pointer(pointer: &Value) -> Option<ColumnPointer> {
    match pointer {
        Value::String(s) => Some(ColumnPointer::Name(s.clone())),
        Value::Number(n) => n.as_i64().map(ColumnPointer::Index),
        Value::Object(obj) => {
            for key in ["column", "header", "column_name"] {
                if let Some(Value::String(s)) = obj.get(key) {
                    return Some(ColumnPointer::Name(s.clone()));
                }
            }
            if obj.contains_key("col") && !obj.contains_key("row") {
                return value_as_i64(obj.get("col")?).map(ColumnPointer::Index);
            }
            None
        }
        _ => None,
    }
}

fn field_str(field: &Value, key: &str) -> Option<String> {
    field.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Partition raw recipe fields into metadata and column sets, recording a
/// warning per malformed entry.
fn collect_fields(fields: &[Value]) -> (Vec<MetadataField>, Vec<ColumnField>, Vec<String>) {
    let mut metadata_fields = Vec::new();
    let mut column_fields = Vec::new();
    let mut warnings = Vec::new();

    for field in fields {
        let target = field_str(field, "target").or_else(|| field_str(field, "target_name"));
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            warnings.push("missing_target".to_string());
            continue;
        };
        let Some(source_pointer) = field.get("source_pointer") else {
            warnings.push(format!("missing_source_pointer:{target}"));
            continue;
        };
        let source_type = field_str(field, "source_type");
        let data_type = field_str(field, "data_type");

        match source_type.as_deref() {
            Some("metadata") => match parse_metadata_pointer(source_pointer) {
                Some((row, col)) => metadata_fields.push(MetadataField {
                    target,
                    row,
                    col,
                    data_type,
                }),
                None => warnings.push(format!("invalid_metadata_pointer:{target}")),
            },
            Some("column") => match parse_column_pointer(source_pointer) {
                Some(pointer) => column_fields.push(column_field(target, pointer, data_type)),
                None => warnings.push(format!("invalid_column_pointer:{target}")),
            },
            // Untyped fields: metadata pointer shape wins, then column.
            _ => {
                if let Some((row, col)) = parse_metadata_pointer(source_pointer) {
                    metadata_fields.push(MetadataField {
                        target,
                        row,
                        col,
                        data_type,
                    });
                } else if let Some(pointer) = parse_column_pointer(source_pointer) {
                    column_fields.push(column_field(target, pointer, data_type));
                } else {
                    warnings.push(format!("unsupported_source_pointer:{target}"));
                }
            }
        }
    }
    (metadata_fields, column_fields, warnings)
}

fn column_field(target: String, pointer: ColumnPointer, data_type: Option<String>) -> ColumnField {
    match pointer {
        ColumnPointer::Name(name) => ColumnField {
            target,
            column_name: Some(name),
            column_index: None,
            data_type,
        },
        ColumnPointer::Index(idx) => ColumnField {
            target,
            column_name: None,
            column_index: usize::try_from(idx).ok(),
            data_type,
        },
    }
}

/// Explicit `header_row_index` wins; otherwise pick the row in the first
/// 50 whose normalized cells best intersect the recipe's column names.
fn resolve_header_row(recipe: &Value, grid: &[Vec<String>], column_fields: &[ColumnField]) -> usize {
    let explicit = ["header_row_index", "header_row", "header_row_idx"]
        .iter()
        .find_map(|key| recipe.get(*key).filter(|v| !v.is_null()));
    if let Some(value) = explicit {
        return value_as_i64(value)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(0);
    }

    let wanted: std::collections::BTreeSet<String> = column_fields
        .iter()
        .filter_map(|f| f.column_name.as_deref())
        .filter(|name| !name.trim().is_empty())
        .map(normalize_label)
        .collect();
    if wanted.is_empty() {
        return 0;
    }

    let mut best_row = 0;
    let mut best_match: i64 = -1;
    for (idx, row) in grid.iter().take(HEADER_SCAN_LIMIT).enumerate() {
        let cells: std::collections::BTreeSet<String> = row
            .iter()
            .filter(|cell| !cell.trim().is_empty())
            .map(|cell| normalize_label(cell))
            .collect();
        let matches = wanted.intersection(&cells).count() as i64;
        if matches > best_match {
            best_match = matches;
            best_row = idx;
        }
    }
    best_row
}

/// Apply a manual recipe end to end: resolve columns, project rows, clean
/// types, extract metadata, merge, write outputs, store the recipe.
pub async fn apply_manual_recipe(
    store: &dyn ArtifactStore,
    run_id: &str,
    recipe: &Value,
    evidence: &EvidencePacket,
) -> std::result::Result<(), RecipeError> {
    let Some(file_path) = &evidence.file_path else {
        return Err(RecipeError::Invalid(
            "Manual recipe requires a file path in evidence.".to_string(),
        ));
    };

    let fields = recipe
        .get("fields")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let (metadata_fields, column_fields, warnings) = collect_fields(&fields);
    if metadata_fields.is_empty() && column_fields.is_empty() {
        return Err(RecipeError::Invalid(
            "Manual recipe has no usable fields.".to_string(),
        ));
    }
    if column_fields.is_empty() {
        return Err(RecipeError::Invalid(
            "Manual recipe must include at least one column field to build a table.".to_string(),
        ));
    }

    let grid = read_grid(
        std::path::Path::new(file_path),
        evidence.sheet_name.as_deref(),
    )
    .map_err(RecipeError::Flow)?;
    let header_row = resolve_header_row(recipe, &grid, &column_fields);

    let mut header_index: BTreeMap<String, usize> = BTreeMap::new();
    if let Some(header_cells) = grid.get(header_row) {
        for (idx, value) in header_cells.iter().enumerate() {
            let key = normalize_label(value);
            if !key.is_empty() {
                header_index.entry(key).or_insert(idx);
            }
        }
    }

    let resolved: Vec<ColumnField> = column_fields
        .into_iter()
        .map(|field| {
            let column_index = field.column_index.or_else(|| {
                field
                    .column_name
                    .as_deref()
                    .and_then(|name| header_index.get(&normalize_label(name)).copied())
            });
            ColumnField {
                column_index,
                ..field
            }
        })
        .collect();

    let data_rows: Vec<&Vec<String>> = grid.iter().skip(header_row + 1).collect();
    let mut output_rows: Vec<Vec<String>> = data_rows
        .iter()
        .map(|row| {
            resolved
                .iter()
                .map(|field| match field.column_index {
                    Some(idx) => row.get(idx).cloned().unwrap_or_default(),
                    None => String::new(),
                })
                .collect()
        })
        .collect();

    // Per-field type cleaning
    for row in &mut output_rows {
        for (idx, field) in resolved.iter().enumerate() {
            let dtype = field.data_type.as_deref().unwrap_or("string");
            row[idx] = clean_value(&row[idx], dtype);
        }
    }

    let mut extracted_metadata = serde_json::Map::new();
    for field in &metadata_fields {
        let value = grid
            .get(usize::try_from(field.row).unwrap_or(usize::MAX))
            .and_then(|row| row.get(usize::try_from(field.col).unwrap_or(usize::MAX)))
            .cloned()
            .unwrap_or_default();
        extracted_metadata.insert(field.target.clone(), Value::String(value));
    }

    let mut merge_fields: Vec<String> = recipe
        .get("merge_metadata_fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if merge_fields.is_empty()
        && recipe
            .get("merge_metadata")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    {
        merge_fields = metadata_fields.iter().map(|f| f.target.clone()).collect();
    }

    let metadata_types: BTreeMap<&str, &str> = metadata_fields
        .iter()
        .map(|f| (f.target.as_str(), f.data_type.as_deref().unwrap_or("string")))
        .collect();
    let mut merged_columns = resolved;
    if !merge_fields.is_empty() {
        for row in &mut output_rows {
            for field in &merge_fields {
                let raw = extracted_metadata
                    .get(field)
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let dtype = metadata_types.get(field.as_str()).copied().unwrap_or("string");
                row.push(clean_value(raw, dtype));
            }
        }
        for field in &merge_fields {
            merged_columns.push(ColumnField {
                target: field.clone(),
                column_name: Some(field.clone()),
                column_index: None,
                data_type: metadata_types
                    .get(field.as_str())
                    .map(|d| d.to_string()),
            });
        }
    }

    write_recipe_outputs(
        store,
        run_id,
        &merged_columns,
        &output_rows,
        &extracted_metadata,
    )
    .await?;
    append_shadow(
        store,
        run_id,
        "manual_recipe_applied",
        json_meta(json!({
            "header_row": header_row,
            "metadata_fields": metadata_fields.len(),
            "column_fields": merged_columns.len(),
            "warnings": warnings,
        })),
    )
    .await?;

    if let Some(fingerprint) = &evidence.structural_hash {
        store_recipe(store, fingerprint, recipe, run_id).await?;
        info!(run_id, fingerprint = %fingerprint, "recipe stored for recall");
    }
    Ok(())
}

async fn write_recipe_outputs(
    store: &dyn ArtifactStore,
    run_id: &str,
    columns: &[ColumnField],
    output_rows: &[Vec<String>],
    metadata: &serde_json::Map<String, Value>,
) -> std::result::Result<(), RecipeError> {
    let targets: Vec<String> = columns.iter().map(|f| f.target.clone()).collect();

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer
        .write_record(&targets)
        .map_err(|e| RecipeError::Flow(FlowError::Csv(e)))?;
    for row in output_rows {
        writer
            .write_record(row)
            .map_err(|e| RecipeError::Flow(FlowError::Csv(e)))?;
    }
    let csv_bytes = writer
        .into_inner()
        .map_err(|e| RecipeError::Flow(FlowError::Io(std::io::Error::other(e))))?;

    let data_key = keys::clean_data_csv(run_id);
    store.write_bytes(&data_key, &csv_bytes).await?;
    let metadata_key = keys::extracted_metadata(run_id);
    write_json(store, &metadata_key, metadata).await?;

    let schema_fields: Vec<SchemaField> = columns
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let values: Vec<String> = output_rows
                .iter()
                .map(|row| row.get(idx).cloned().unwrap_or_default())
                .collect();
            let dtype = field
                .data_type
                .clone()
                .unwrap_or_else(|| infer_dtype(&values).to_string());
            let required = !values.is_empty() && values.iter().all(|v| !v.trim().is_empty());
            SchemaField {
                source: field
                    .column_name
                    .clone()
                    .unwrap_or_else(|| format!("col_{}", field.column_index.unwrap_or(idx))),
                canonical: field.target.clone(),
                dtype,
                required,
            }
        })
        .collect();

    let schema_spec = SchemaSpec {
        run_id: run_id.to_string(),
        artifact_key: keys::schema_spec(run_id),
        schema_layer: "manual_recipe".to_string(),
        schema_spec: SchemaFieldSet {
            fields: schema_fields,
            unmapped_columns: Vec::new(),
        },
        confidence: 0.9,
        alternatives: Vec::new(),
        evidence_keys: vec![keys::manual_recipe(run_id)],
        refusal_reason: None,
    };
    write_json(store, &keys::schema_spec(run_id), &schema_spec).await?;

    let manifest = SaveManifest {
        run_id: run_id.to_string(),
        artifact_key: keys::save_manifest(run_id),
        saved_files: vec![data_key.clone(), metadata_key.clone()],
        saved_uris: vec![store.uri_for_key(&data_key), store.uri_for_key(&metadata_key)],
        report_paths: Vec::new(),
        confidence: 0.9,
        alternatives: Vec::new(),
        evidence_keys: vec![keys::schema_spec(run_id)],
        refusal_reason: None,
    };
    write_json(store, &keys::save_manifest(run_id), &manifest).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Recipe store
// ---------------------------------------------------------------------------

async fn load_index(
    store: &dyn ArtifactStore,
) -> Result<BTreeMap<String, RecipeIndexEntry>> {
    if !store.exists(RECIPE_INDEX_KEY).await? {
        return Ok(BTreeMap::new());
    }
    Ok(read_json(store, RECIPE_INDEX_KEY).await?)
}

/// Look up a stored recipe by structural fingerprint.
pub async fn lookup_recipe(
    store: &dyn ArtifactStore,
    structural_hash: &str,
) -> Result<Option<Value>> {
    let index = load_index(store).await?;
    let Some(entry) = index.get(structural_hash) else {
        return Ok(None);
    };
    if !store.exists(&entry.recipe_key).await? {
        return Ok(None);
    }
    Ok(Some(read_json(store, &entry.recipe_key).await?))
}

/// Store a recipe under its fingerprint and update the index. Last writer
/// wins per fingerprint.
pub async fn store_recipe(
    store: &dyn ArtifactStore,
    structural_hash: &str,
    recipe: &Value,
    run_id: &str,
) -> Result<String> {
    let recipe_key = format!("recipe_store/{structural_hash}/manual_recipe.json");
    write_json(store, &recipe_key, recipe).await?;
    let mut index = load_index(store).await?;
    index.insert(
        structural_hash.to_string(),
        RecipeIndexEntry {
            recipe_key: recipe_key.clone(),
            stored_at: chrono::Utc::now().to_rfc3339(),
            source_run_id: run_id.to_string(),
        },
    );
    write_json(store, RECIPE_INDEX_KEY, &index).await?;
    Ok(recipe_key)
}

/// Drop a recalled recipe into a run directory so the resume path picks
/// it up.
pub async fn copy_recalled_recipe(
    store: &dyn ArtifactStore,
    run_id: &str,
    recipe: &Value,
) -> Result<()> {
    write_json(store, &keys::manual_recipe(run_id), recipe).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|row| row.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_collect_fields_partitions_and_warns() {
        let fields = vec![
            json!({"target": "report_date", "source_type": "metadata",
                   "source_pointer": {"row": 0, "col": 1}}),
            json!({"target": "product_code", "source_type": "column",
                   "source_pointer": {"column": "Product Code"}}),
            json!({"source_type": "column", "source_pointer": "Qty"}),
            json!({"target": "broken", "source_type": "metadata",
                   "source_pointer": "not-a-pointer"}),
        ];
        let (metadata, columns, warnings) = collect_fields(&fields);
        assert_eq!(metadata.len(), 1);
        assert_eq!(columns.len(), 1);
        assert_eq!(
            warnings,
            vec!["missing_target", "invalid_metadata_pointer:broken"]
        );
    }

    #[test]
    fn test_untyped_field_prefers_metadata_shape() {
        let fields = vec![
            json!({"target": "a", "source_pointer": {"row": 1, "col": 2}}),
            json!({"target": "b", "source_pointer": "Qty"}),
            json!({"target": "c", "source_pointer": 3}),
        ];
        let (metadata, columns, warnings) = collect_fields(&fields);
        assert_eq!(metadata.len(), 1);
        assert_eq!(columns.len(), 2);
        assert!(warnings.is_empty());
        assert_eq!(columns[1].column_index, Some(3));
    }

    #[test]
    fn test_column_pointer_shapes() {
        assert!(matches!(
            parse_column_pointer(&json!("Qty")),
            Some(ColumnPointer::Name(_))
        ));
        assert!(matches!(
            parse_column_pointer(&json!(2)),
            Some(ColumnPointer::Index(2))
        ));
        assert!(matches!(
            parse_column_pointer(&json!({"header": "Amount"})),
            Some(ColumnPointer::Name(_))
        ));
        assert!(matches!(
            parse_column_pointer(&json!({"col": 4})),
            Some(ColumnPointer::Index(4))
        ));
        assert!(parse_column_pointer(&json!({"row": 1, "col": 4})).is_none());
        assert!(parse_column_pointer(&json!(null)).is_none());
    }

    #[test]
    fn test_resolve_header_row_explicit() {
        let recipe = json!({"header_row_index": 2});
        assert_eq!(resolve_header_row(&recipe, &grid(&[&["a"]]), &[]), 2);
        let alias = json!({"header_row": "1"});
        assert_eq!(resolve_header_row(&alias, &grid(&[&["a"]]), &[]), 1);
    }

    #[test]
    fn test_resolve_header_row_by_intersection() {
        let rows = grid(&[
            &["Report Date", "2025-01-01"],
            &["", "Product Code", "Qty"],
            &["row1", "X100", "3"],
        ]);
        let columns = vec![
            ColumnField {
                target: "product_code".to_string(),
                column_name: Some("Product Code".to_string()),
                column_index: None,
                data_type: None,
            },
            ColumnField {
                target: "qty".to_string(),
                column_name: Some("Qty".to_string()),
                column_index: None,
                data_type: None,
            },
        ];
        assert_eq!(resolve_header_row(&json!({}), &rows, &columns), 1);
    }

    #[tokio::test]
    async fn test_recipe_store_roundtrip_last_writer_wins() {
        let store = fleetflow_store::MemoryStore::new();
        let first = json!({"fields": [], "note": "first"});
        let second = json!({"fields": [], "note": "second"});

        store_recipe(&store, "hash-1", &first, "run_1").await.unwrap();
        store_recipe(&store, "hash-1", &second, "run_2").await.unwrap();

        let recalled = lookup_recipe(&store, "hash-1").await.unwrap().unwrap();
        assert_eq!(recalled["note"], "second");
        assert_eq!(lookup_recipe(&store, "hash-2").await.unwrap(), None);
    }
}
