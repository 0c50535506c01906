//! SQLite storage engine for tracked actions.

pub mod actions;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;

pub use actions::{ActionQuery, SqliteActionStore, StoredAction, StoredChange};
pub use database::Database;
pub use error::StoreError;
