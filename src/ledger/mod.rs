//! Append-only, per-run event ledger.
//!
//! The ledger is the only source of truth for a run. Materialized state is
//! derived from it by the projector in [`crate::state`] and cached beside the
//! events as `state.json`.

mod event;
mod lock;
mod run_id;
mod store;

pub use event::{Event, EventSource, EventType, NewEvent};
pub use lock::FileLock;
pub use run_id::{
    derive_scope, parse_remote_url, AutonomyLevel, InvalidRunId, Lineage, RunId, RunMetadata,
};
pub use store::{Ledger, LedgerError};
pub(crate) use store::write_json_atomic;
