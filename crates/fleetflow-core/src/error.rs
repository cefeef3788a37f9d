//! Domain-level error taxonomy for Fleetflow.
//!
//! Expected, recoverable Core A conditions (ambiguous headers, missing
//! confirmation, invalid recipe) are not errors — they are
//! `needs_human_confirmation` responses. Everything here is fatal for the
//! current invocation.

/// Fleetflow domain errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("unsupported input type: {0}")]
    UnsupportedInput(String),

    #[error("invalid artifact {key}: {reason}")]
    InvalidArtifact { key: String, reason: String },

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("scenario checks failed: {0}")]
    ScenarioChecks(String),

    #[error("worker lock held; exiting")]
    LockHeld,

    #[error("storage error: {0}")]
    Store(#[from] fleetflow_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("workbook error: {0}")]
    Workbook(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Fleetflow domain operations.
pub type Result<T> = std::result::Result<T, FlowError>;
