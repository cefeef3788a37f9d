//! Small internal helpers shared across modules.

use serde_json::{Map, Value};

/// Turn a `json!({..})` object literal into the metadata map the shadow
/// log expects. Non-object values yield an empty map.
pub(crate) fn json_meta(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Round to three decimals (candidate confidences).
pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
