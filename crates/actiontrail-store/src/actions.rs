use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use actiontrail_core::errors::StorageError;
use actiontrail_core::ids::ActionId;
use actiontrail_core::{Action, Operation, StorageEngine, TraceId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A persisted action with its row metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAction {
    pub id: ActionId,
    pub created_at: String,
    pub action: Action,
}

/// One entry of the change index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredChange {
    pub action_id: ActionId,
    pub model: String,
    pub operation: Operation,
    pub record_id: Option<String>,
}

/// Filter for [`SqliteActionStore::list`]. Newest first.
#[derive(Clone, Debug)]
pub struct ActionQuery {
    pub company_id: Option<String>,
    pub action_type: Option<String>,
    pub verb: Option<String>,
    pub trace_id: Option<TraceId>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ActionQuery {
    fn default() -> Self {
        Self {
            company_id: None,
            action_type: None,
            verb: None,
            trace_id: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Stores whole actions as JSON, indexed by identity, type and touched models.
#[derive(Clone)]
pub struct SqliteActionStore {
    db: Database,
}

impl SqliteActionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a batch in one transaction.
    #[instrument(skip_all, fields(batch_size = actions.len()))]
    pub fn insert_batch(&self, actions: &[Action]) -> Result<Vec<ActionId>, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = Utc::now().to_rfc3339();
            let mut ids = Vec::with_capacity(actions.len());
            {
                let mut insert_action = tx.prepare_cached(
                    "INSERT INTO actions (id, company_id, client_id, app, environment, action_type, verb,
                                          object, timestamp, trace_ids, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )?;
                let mut insert_change = tx.prepare_cached(
                    "INSERT INTO action_changes (action_id, position, model, operation, record_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;

                for action in actions {
                    let id = ActionId::new();
                    insert_action.execute(params![
                        id.as_str(),
                        action.company_id,
                        action.client_id,
                        action.app,
                        action.environment,
                        action.kind(),
                        action.verb(),
                        action.action.object,
                        action.timestamp,
                        serde_json::to_string(&action.trace_ids)?,
                        serde_json::to_string(action)?,
                        now,
                    ])?;
                    for (position, change) in action.changes.iter().enumerate() {
                        insert_change.execute(params![
                            id.as_str(),
                            position as i64,
                            change.model,
                            change.operation.as_str(),
                            change.id,
                        ])?;
                    }
                    ids.push(id);
                }
            }
            tx.commit()?;
            debug!(inserted = ids.len(), "actions stored");
            Ok(ids)
        })
    }

    pub fn get(&self, id: &ActionId) -> Result<Option<StoredAction>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, created_at, payload FROM actions WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(stored_action(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn list(&self, query: &ActionQuery) -> Result<Vec<StoredAction>, StoreError> {
        let mut clauses = Vec::new();
        let mut params: Vec<String> = Vec::new();
        // `{}` in a template marks where the bound parameter goes.
        let mut push = |template: &str, value: String| {
            params.push(value);
            clauses.push(template.replace("{}", &format!("?{}", params.len())));
        };
        if let Some(company) = &query.company_id {
            push("company_id = {}", company.clone());
        }
        if let Some(kind) = &query.action_type {
            push("action_type = {}", kind.clone());
        }
        if let Some(verb) = &query.verb {
            push("verb = {}", verb.clone());
        }
        if let Some(trace) = &query.trace_id {
            push(
                "EXISTS (SELECT 1 FROM json_each(actions.trace_ids) WHERE json_each.value = {})",
                trace.as_str().to_owned(),
            );
        }

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, created_at, payload FROM actions {filter}
             ORDER BY rowid DESC LIMIT {} OFFSET {}",
            query.limit, query.offset
        );

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(stored_action(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM actions", [], |row| row.get::<_, i64>(0))? as u64))
    }

    /// Changes recorded against `model`, optionally for one record, oldest first.
    pub fn changes_for(&self, model: &str, record_id: Option<&str>) -> Result<Vec<StoredChange>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.action_id, c.model, c.operation, c.record_id
                 FROM action_changes c JOIN actions a ON a.id = c.action_id
                 WHERE c.model = ?1 AND (?2 IS NULL OR c.record_id = ?2)
                 ORDER BY a.rowid, c.position",
            )?;
            let mut rows = stmt.query(params![model, record_id])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let action_id: String = row_helpers::get(row, 0, "action_changes", "action_id")?;
                let operation: String = row_helpers::get(row, 2, "action_changes", "operation")?;
                results.push(StoredChange {
                    action_id: ActionId::from_raw(action_id),
                    model: row_helpers::get(row, 1, "action_changes", "model")?,
                    operation: row_helpers::parse_enum(&operation, "action_changes", "operation")?,
                    record_id: row_helpers::get(row, 3, "action_changes", "record_id")?,
                });
            }
            Ok(results)
        })
    }
}

fn stored_action(row: &rusqlite::Row<'_>) -> Result<StoredAction, StoreError> {
    let id: String = row_helpers::get(row, 0, "actions", "id")?;
    let payload: String = row_helpers::get(row, 2, "actions", "payload")?;
    Ok(StoredAction {
        id: ActionId::from_raw(id),
        created_at: row_helpers::get(row, 1, "actions", "created_at")?,
        action: row_helpers::parse_json(&payload, "actions", "payload")?,
    })
}

#[async_trait]
impl StorageEngine for SqliteActionStore {
    async fn create_many_actions(&self, actions: Vec<Action>) -> Result<usize, StorageError> {
        let store = self.clone();
        let ids = tokio::task::spawn_blocking(move || store.insert_batch(&actions))
            .await
            .map_err(|e| StorageError::Unavailable(format!("store task failed: {e}")))??;
        Ok(ids.len())
    }
}
