//! Fleetflow Core Library
//!
//! Two batch pipelines over the shared artifact store:
//!
//! - [`puhemies`] — resumable tabular ingestion: preview, header
//!   candidates, human confirmation gate, manual recipes with
//!   content-addressed recall, clean-table extraction.
//! - [`incident`] — fleet incident detection: snapshot selection,
//!   redaction, rule-based detectors, signature clustering, fleet summary
//!   with per-host actions, lock-guarded run lifecycle with retention.

pub mod config;
pub mod error;
pub mod incident;
pub mod puhemies;
pub mod schema;
pub mod tabular;
pub mod telemetry;
pub(crate) mod util;

pub use config::{Config, RedactionMode};
pub use error::{FlowError, Result};
pub use telemetry::init_tracing;

/// Fleetflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
