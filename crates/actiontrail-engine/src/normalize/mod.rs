//! Turns raw mutation signals into `Change` records.
//!
//! Failures here never reach the host: a signal that cannot be interpreted
//! is logged at debug level and produces no change.

pub mod record;
pub mod statement;

use serde_json::{Map, Value};
use tracing::debug;

use actiontrail_core::Change;

pub use record::{change_from_record, RecordSnapshot};
pub use statement::Mutation;

/// Change for a SQL statement, or `None` for reads and unparseable input.
/// `meta` carries the statement text and its bound values.
pub fn statement_change(sql: &str, values: &[Value]) -> Option<Change> {
    let mutation = match statement::parse(sql, values) {
        Ok(Some(mutation)) => mutation,
        Ok(None) => return None,
        Err(e) => {
            debug!(error = %e, sql, "statement not normalized");
            return None;
        }
    };

    let mut change = Change::new(mutation.table, mutation.operation);
    if !mutation.after.is_empty() {
        change = change.with_after(mutation.after);
    }
    let mut meta = Map::new();
    meta.insert("sql".into(), Value::String(sql.to_owned()));
    if !values.is_empty() {
        meta.insert("values".into(), Value::Array(values.to_vec()));
    }
    Some(change.with_meta(meta))
}

/// Change for an ORM save, or `None` when the record names no model.
pub fn record_change(record: &RecordSnapshot) -> Option<Change> {
    match change_from_record(record) {
        Ok(change) => Some(change),
        Err(e) => {
            debug!(error = %e, "record not normalized");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actiontrail_core::Operation;
    use serde_json::json;

    #[test]
    fn update_statement_becomes_change() {
        let change = statement_change("UPDATE users SET name='Bob' WHERE id=1", &[]).unwrap();
        assert_eq!(change.model, "users");
        assert_eq!(change.operation, Operation::Update);
        assert_eq!(Value::Object(change.after.unwrap()), json!({"name": "Bob"}));
        let meta = change.meta.unwrap();
        assert_eq!(meta["sql"], "UPDATE users SET name='Bob' WHERE id=1");
        assert!(meta.get("values").is_none());
    }

    #[test]
    fn delete_has_no_after_but_keeps_values() {
        let change = statement_change("DELETE FROM users WHERE id = ?", &[json!(9)]).unwrap();
        assert_eq!(change.operation, Operation::Delete);
        assert!(change.after.is_none());
        assert_eq!(change.meta.unwrap()["values"], json!([9]));
    }

    #[test]
    fn reads_and_garbage_yield_nothing() {
        assert!(statement_change("SELECT * FROM users", &[]).is_none());
        assert!(statement_change("DROP", &[]).is_none());
        assert!(statement_change("not sql at all ((", &[]).is_none());
        assert!(statement_change("", &[]).is_none());
    }

    #[test]
    fn record_without_model_yields_nothing() {
        assert!(record_change(&RecordSnapshot::default()).is_none());
    }
}
