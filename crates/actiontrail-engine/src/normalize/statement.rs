//! Mutation extraction from SQL text.
//!
//! Statements are parsed with `sqlparser`, trying the SQLite, MySQL and
//! generic dialects in turn. Only `INSERT`/`REPLACE`, `UPDATE` and `DELETE`
//! are interpreted; every other statement is `None`.

use serde_json::{Map, Number, Value};
use sqlparser::ast::{
    AssignmentTarget, Delete, Expr, FromTable, Insert, ObjectName, SetExpr, Statement, TableFactor, TableWithJoins,
    UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use actiontrail_core::errors::NormalizeError;
use actiontrail_core::Operation;

/// The part of a mutation statement that becomes a `Change`.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub operation: Operation,
    pub table: String,
    /// Column values written by the statement, literal values only.
    pub after: Map<String, Value>,
}

/// Parse `sql`, resolving placeholders against `values`.
///
/// `Ok(None)` means the statement is valid but not a mutation.
pub fn parse(sql: &str, values: &[Value]) -> Result<Option<Mutation>, NormalizeError> {
    let statement = parse_first(sql)?;
    let values = Placeholders(values);
    match statement {
        Statement::Insert(insert) => insert_mutation(&insert, &values).map(Some),
        Statement::Update { table, assignments, .. } => {
            let mut after = Map::new();
            for assignment in &assignments {
                // Tuple targets (`(a, b) = (...)`) carry no single column.
                let AssignmentTarget::ColumnName(column) = &assignment.target else {
                    continue;
                };
                if let Some(value) = values.eval(&assignment.value) {
                    after.insert(last_part(column)?, value);
                }
            }
            Ok(Some(Mutation {
                operation: Operation::Update,
                table: relation_name(&table)?,
                after,
            }))
        }
        Statement::Delete(delete) => Ok(Some(Mutation {
            operation: Operation::Delete,
            table: delete_target(&delete)?,
            after: Map::new(),
        })),
        _ => Ok(None),
    }
}

fn parse_first(sql: &str) -> Result<Statement, NormalizeError> {
    let dialects: [&dyn Dialect; 3] = [&SQLiteDialect {}, &MySqlDialect {}, &GenericDialect {}];
    let mut first_error = None;
    for dialect in dialects {
        match parse_with(dialect, sql) {
            Ok(statements) => return statements.into_iter().next().ok_or(NormalizeError::Empty),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    Err(NormalizeError::Syntax(first_error.unwrap_or_default()))
}

/// Anonymous `?` placeholders are numbered in text order before parsing so
/// each one keeps its position in the AST.
fn parse_with(dialect: &dyn Dialect, sql: &str) -> Result<Vec<Statement>, String> {
    let mut position = 0;
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|token| match token {
            Token::Placeholder(p) if p == "?" => {
                position += 1;
                Token::Placeholder(format!("?{position}"))
            }
            other => other,
        })
        .collect();
    Parser::new(dialect)
        .with_tokens(tokens)
        .parse_statements()
        .map_err(|e| e.to_string())
}

fn insert_mutation(insert: &Insert, values: &Placeholders<'_>) -> Result<Mutation, NormalizeError> {
    let mut after = Map::new();
    let first_row = insert.source.as_deref().and_then(|query| match query.body.as_ref() {
        SetExpr::Values(rows) => rows.rows.first(),
        _ => None,
    });
    if let Some(row) = first_row {
        for (column, expr) in insert.columns.iter().zip(row) {
            if let Some(value) = values.eval(expr) {
                after.insert(column.value.clone(), value);
            }
        }
    }
    Ok(Mutation {
        operation: Operation::Create,
        table: last_part(&insert.table_name)?,
        after,
    })
}

/// `DELETE t1 FROM t1 JOIN ...` names its target before `FROM`; plain
/// deletes name it after.
fn delete_target(delete: &Delete) -> Result<String, NormalizeError> {
    if let Some(name) = delete.tables.first() {
        return last_part(name);
    }
    let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) = &delete.from;
    from.first()
        .ok_or_else(|| NormalizeError::Unrecognized("DELETE without a table".into()))
        .and_then(relation_name)
}

fn relation_name(table: &TableWithJoins) -> Result<String, NormalizeError> {
    match &table.relation {
        TableFactor::Table { name, .. } => last_part(name),
        other => Err(NormalizeError::Unrecognized(format!("target is not a table: {other}"))),
    }
}

/// `name`, `schema.name` or `db.schema.name`; the last part.
fn last_part(name: &ObjectName) -> Result<String, NormalizeError> {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .ok_or_else(|| NormalizeError::Unrecognized(format!("empty name: {name}")))
}

struct Placeholders<'a>(&'a [Value]);

impl Placeholders<'_> {
    /// Value of a literal or placeholder expression. Anything computed
    /// (functions, arithmetic, subqueries) yields `None`.
    fn eval(&self, expr: &Expr) -> Option<Value> {
        match expr {
            Expr::Value(value) => self.literal(value),
            Expr::Nested(inner) => self.eval(inner),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match self.eval(expr)? {
                Value::Number(n) => negate(&n),
                _ => None,
            },
            _ => None,
        }
    }

    fn literal(&self, value: &SqlValue) -> Option<Value> {
        match value {
            SqlValue::Number(text, _) => number(text),
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => Some(Value::String(s.clone())),
            SqlValue::Boolean(b) => Some(Value::Bool(*b)),
            SqlValue::Null => Some(Value::Null),
            SqlValue::Placeholder(p) => self.resolve(p),
            _ => None,
        }
    }

    /// `?N` and `$N` are 1-based; named placeholders never resolve.
    fn resolve(&self, placeholder: &str) -> Option<Value> {
        let index: usize = placeholder
            .strip_prefix('?')
            .or_else(|| placeholder.strip_prefix('$'))?
            .parse()
            .ok()?;
        self.0.get(index.checked_sub(1)?).cloned()
    }
}

fn number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn negate(n: &Number) -> Option<Value> {
    if let Some(i) = n.as_i64() {
        return Some(Value::Number((-i).into()));
    }
    n.as_f64().and_then(|f| Number::from_f64(-f)).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(sql: &str, values: &[Value]) -> Mutation {
        parse(sql, values).unwrap().unwrap()
    }

    #[test]
    fn update_with_literal_assignment() {
        let m = mutation("UPDATE users SET name='Bob' WHERE id=1", &[]);
        assert_eq!(m.operation, Operation::Update);
        assert_eq!(m.table, "users");
        assert_eq!(Value::Object(m.after), json!({"name": "Bob"}));
    }

    #[test]
    fn insert_maps_columns_to_first_row() {
        let m = mutation(
            "INSERT INTO `shop`.`orders` (id, total, note, paid) VALUES (7, -12.5, 'it''s', TRUE), (8, 1, 'x', FALSE)",
            &[],
        );
        assert_eq!(m.operation, Operation::Create);
        assert_eq!(m.table, "orders");
        assert_eq!(
            Value::Object(m.after),
            json!({"id": 7, "total": -12.5, "note": "it's", "paid": true})
        );
    }

    #[test]
    fn placeholders_resolve_positionally() {
        let values = [json!("Ann"), json!("ann@example.com"), json!(3)];
        let m = mutation("insert into users (name, email) values (?, ?)", &values);
        assert_eq!(Value::Object(m.after), json!({"name": "Ann", "email": "ann@example.com"}));

        let m = mutation("UPDATE users SET name = ?, visits = visits + ? WHERE id = ?", &values);
        assert_eq!(Value::Object(m.after), json!({"name": "Ann"}));
    }

    #[test]
    fn numbered_placeholders() {
        let values = [json!(1), json!("Zed")];
        let m = mutation("UPDATE users SET name = ?2 WHERE id = ?1", &values);
        assert_eq!(Value::Object(m.after), json!({"name": "Zed"}));
    }

    #[test]
    fn compound_expressions_are_skipped_but_counted() {
        let values = [json!(5), json!("late")];
        let m = mutation("INSERT INTO t (a, b, c) VALUES (coalesce(?, 0), NOW(), ?)", &values);
        assert_eq!(Value::Object(m.after), json!({"c": "late"}));
    }

    #[test]
    fn insert_without_columns_has_empty_after() {
        let m = mutation("INSERT INTO logs VALUES (1, 'x')", &[]);
        assert_eq!(m.table, "logs");
        assert!(m.after.is_empty());
    }

    #[test]
    fn insert_from_select_has_empty_after() {
        let m = mutation("INSERT INTO archive (id) SELECT id FROM users", &[]);
        assert_eq!(m.table, "archive");
        assert!(m.after.is_empty());
    }

    #[test]
    fn sqlite_conflict_clause_and_replace() {
        let m = mutation("INSERT OR REPLACE INTO kv (k, v) VALUES ('a', 'b')", &[]);
        assert_eq!(m.table, "kv");
        assert_eq!(Value::Object(m.after), json!({"k": "a", "v": "b"}));

        let m = mutation("REPLACE INTO kv (k) VALUES ('z')", &[]);
        assert_eq!(m.operation, Operation::Create);
        assert_eq!(m.table, "kv");
    }

    #[test]
    fn delete_forms() {
        let m = mutation("DELETE FROM sessions WHERE expires < 10", &[]);
        assert_eq!(m.operation, Operation::Delete);
        assert_eq!(m.table, "sessions");
        assert!(m.after.is_empty());

        let m = mutation("DELETE t1 FROM t1 JOIN t2 ON t1.id = t2.id", &[]);
        assert_eq!(m.table, "t1");
    }

    #[test]
    fn update_with_alias_and_qualified_columns() {
        let m = mutation("UPDATE users u SET u.name = 'Eve' WHERE u.id = 2", &[]);
        assert_eq!(m.table, "users");
        assert_eq!(Value::Object(m.after), json!({"name": "Eve"}));
    }

    #[test]
    fn comments_are_ignored() {
        let m = mutation("/* audit */ UPDATE users -- trailing\n SET active = NULL", &[]);
        assert_eq!(Value::Object(m.after), json!({"active": null}));
    }

    #[test]
    fn reads_and_ddl_are_noops() {
        assert_eq!(parse("SELECT * FROM users", &[]).unwrap(), None);
        assert_eq!(parse("  select 1;", &[]).unwrap(), None);
        assert_eq!(parse("CREATE TABLE t (id INT)", &[]).unwrap(), None);
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert_eq!(parse("", &[]), Err(NormalizeError::Empty));
        assert_eq!(parse("  -- nothing\n", &[]), Err(NormalizeError::Empty));
        for sql in [
            "UPDATE users SET name = 'open",
            "hello world",
            "UPDATE users WHERE id = 1",
            "INSERT INTO users (a, b",
        ] {
            assert!(matches!(parse(sql, &[]), Err(NormalizeError::Syntax(_))), "{sql}");
        }
    }
}
