//! JSON-Schema validation of run artifacts.
//!
//! The five schemas ship embedded in the binary (draft 2020-12) and are
//! compiled once per process. For a run, validation covers every
//! snapshot, every ticket, the incidents embedded in each timeline, the
//! fleet summary, and the run manifest when present. Any failure is
//! fatal for Core B: the lifecycle records `run_status.failure`.

use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::Value;

use fleetflow_store::ArtifactStore;

use crate::error::{FlowError, Result};

const SNAPSHOT_SCHEMA: &str = include_str!("../schemas/snapshot.schema.json");
const TICKET_SCHEMA: &str = include_str!("../schemas/ticket.schema.json");
const INCIDENT_SCHEMA: &str = include_str!("../schemas/incident.schema.json");
const FLEET_SUMMARY_SCHEMA: &str = include_str!("../schemas/fleet_summary.schema.json");
const RUN_MANIFEST_SCHEMA: &str = include_str!("../schemas/run_manifest.schema.json");

fn compile(source: &str) -> Validator {
    let schema: Value = serde_json::from_str(source).expect("embedded schema is valid JSON");
    jsonschema::validator_for(&schema).expect("embedded schema compiles")
}

fn snapshot_validator() -> &'static Validator {
    static V: OnceLock<Validator> = OnceLock::new();
    V.get_or_init(|| compile(SNAPSHOT_SCHEMA))
}

fn ticket_validator() -> &'static Validator {
    static V: OnceLock<Validator> = OnceLock::new();
    V.get_or_init(|| compile(TICKET_SCHEMA))
}

fn incident_validator() -> &'static Validator {
    static V: OnceLock<Validator> = OnceLock::new();
    V.get_or_init(|| compile(INCIDENT_SCHEMA))
}

fn fleet_summary_validator() -> &'static Validator {
    static V: OnceLock<Validator> = OnceLock::new();
    V.get_or_init(|| compile(FLEET_SUMMARY_SCHEMA))
}

fn run_manifest_validator() -> &'static Validator {
    static V: OnceLock<Validator> = OnceLock::new();
    V.get_or_init(|| compile(RUN_MANIFEST_SCHEMA))
}

async fn validate_documents(
    store: &dyn ArtifactStore,
    keys: &[String],
    validator: &Validator,
    label: &str,
    errors: &mut Vec<String>,
) {
    for key in keys {
        match fleetflow_store::read_json::<Value>(store, key).await {
            Ok(payload) => {
                if let Err(err) = validator.validate(&payload) {
                    errors.push(format!("{label} {key}: {err}"));
                }
            }
            Err(err) => errors.push(format!("{label} {key}: {err}")),
        }
    }
}

/// Validate a run's artifacts; returns the full error list (empty when
/// clean).
pub async fn validate_run(store: &dyn ArtifactStore, run_id: &str) -> Result<Vec<String>> {
    let mut errors = Vec::new();

    let snapshot_keys: Vec<String> = store
        .list(&format!("{run_id}/snapshots"))
        .await?
        .into_iter()
        .filter(|k| k.ends_with(".json"))
        .collect();
    let ticket_keys: Vec<String> = store
        .list(&format!("{run_id}/tickets"))
        .await?
        .into_iter()
        .filter(|k| k.ends_with(".json"))
        .collect();
    let timeline_keys: Vec<String> = store
        .list(&format!("{run_id}/hosts"))
        .await?
        .into_iter()
        .filter(|k| k.ends_with("timeline.json"))
        .collect();

    validate_documents(store, &snapshot_keys, snapshot_validator(), "snapshot", &mut errors).await;
    validate_documents(store, &ticket_keys, ticket_validator(), "ticket", &mut errors).await;

    for key in &timeline_keys {
        match fleetflow_store::read_json::<Value>(store, key).await {
            Ok(timeline) => {
                let incidents = timeline
                    .get("incidents")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for incident in incidents {
                    if let Err(err) = incident_validator().validate(&incident) {
                        errors.push(format!("timeline {key}: {err}"));
                    }
                }
            }
            Err(err) => errors.push(format!("timeline {key}: {err}")),
        }
    }

    let fleet_key = format!("{run_id}/fleet_summary.json");
    if store.exists(&fleet_key).await? {
        validate_documents(
            store,
            &[fleet_key],
            fleet_summary_validator(),
            "fleet_summary",
            &mut errors,
        )
        .await;
    }
    let manifest_key = format!("{run_id}/run_manifest.json");
    if store.exists(&manifest_key).await? {
        validate_documents(
            store,
            &[manifest_key],
            run_manifest_validator(),
            "run_manifest",
            &mut errors,
        )
        .await;
    }
    Ok(errors)
}

/// Validate a run and fail on the first error list.
pub async fn validate_or_raise(store: &dyn ArtifactStore, run_id: &str) -> Result<()> {
    let errors = validate_run(store, run_id).await?;
    if !errors.is_empty() {
        return Err(FlowError::SchemaValidation(errors.join("; ")));
    }
    Ok(())
}
