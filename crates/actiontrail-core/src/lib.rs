//! Shared vocabulary for the actiontrail agent: the `Action` and `Change`
//! records, trace identifiers, error types, sensitive-key masking and the
//! storage-engine seam.

pub mod action;
pub mod change;
pub mod errors;
pub mod ids;
pub mod mask;
pub mod path;
pub mod storage;

pub use action::{Action, ActionKind, Actor, Framework, ResponseSnapshot};
pub use change::{Change, Operation};
pub use ids::TraceId;
pub use storage::StorageEngine;
