//! Fleetflow artifact store
//!
//! Key/value blob layer shared by both pipeline cores. Keys are logical,
//! forward-slash-delimited paths relative to the store root
//! (e.g. `run_id/header_spec.json`), stable across backends:
//!
//! - `LocalStore`: filesystem rooted at a directory
//! - `GcsStore`: object storage under `gs://bucket/prefix`
//! - `MemoryStore`: in-memory fake for tests
//!
//! `create_if_absent` is the only atomic primitive and the basis of the
//! worker lock. All other operations assume a single writer per key.

pub mod error;
pub mod gcs;
pub mod local;
pub mod memory;
pub mod pointer;
pub mod shadow;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use gcs::GcsStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use pointer::{latest_run_id, read_latest, write_latest, LATEST_KEY};
pub use shadow::{append_shadow, read_shadow_events, ShadowEvent};
pub use store::{build_store, is_gcs_uri, parse_gcs_uri, read_json, write_json, ArtifactStore};
