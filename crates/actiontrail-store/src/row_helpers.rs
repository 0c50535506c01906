use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Deserialize a JSON text column, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(raw: &str, table: &'static str, column: &'static str) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actiontrail_core::Operation;

    #[test]
    fn parse_enum_success() {
        let op: Operation = parse_enum("delete", "action_changes", "operation").unwrap();
        assert_eq!(op, Operation::Delete);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<Operation, _> = parse_enum("INVALID", "action_changes", "operation");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow {
                table: "action_changes",
                column: "operation",
                ..
            })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not valid json", "actions", "payload");
        assert!(matches!(result, Err(StoreError::CorruptRow { table: "actions", column: "payload", .. })));
    }
}
