//! A small users API wired through the agent.
//!
//! Mutations go through the instrumented `rusqlite` `execute` member so the
//! statements they issue show up as changes on the recorded action.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as RoutePath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use actiontrail_engine::hooks::Exports;
use actiontrail_engine::plugins::sql::{DriverError, DriverFuture, Execute, EXECUTE};
use actiontrail_engine::Agent;
use actiontrail_server::{force_track, ignore, instrument, TrackControl, TrackedUser};
use actiontrail_store::{ActionQuery, SqliteActionStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    name     TEXT NOT NULL,
    email    TEXT NOT NULL UNIQUE,
    password TEXT
);
";

#[derive(Clone)]
pub struct UsersDb {
    conn: Arc<Mutex<Connection>>,
}

impl UsersDb {
    pub fn open(path: Option<&Path>) -> rusqlite::Result<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The driver surface handed to the agent at load time.
    fn exports(&self) -> Exports {
        let conn = Arc::clone(&self.conn);
        let execute: Arc<Execute> = Arc::new(move |sql: String, values: Vec<Value>| {
            let conn = Arc::clone(&conn);
            Box::pin(async move {
                tokio::task::spawn_blocking(move || {
                    let params: Vec<SqlValue> = values.into_iter().map(sql_value).collect();
                    conn.lock()
                        .execute(&sql, rusqlite::params_from_iter(params))
                        .map(|rows| rows as u64)
                        .map_err(|e| DriverError(e.to_string()))
                })
                .await
                .map_err(|e| DriverError(e.to_string()))?
            }) as DriverFuture
        });
        Exports::new("rusqlite").with_member(EXECUTE, execute)
    }

    async fn list(&self) -> Result<Vec<Value>, ApiError> {
        let conn = Arc::clone(&self.conn);
        let users = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT id, name, email FROM users ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(json!({
                    "id": row.get::<_, i64>(0)?,
                    "name": row.get::<_, String>(1)?,
                    "email": row.get::<_, String>(2)?,
                }))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
        users.map_err(|e| ApiError::internal(e.to_string()))
    }
}

fn sql_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s),
        other => SqlValue::Text(other.to_string()),
    }
}

#[derive(Clone)]
struct AppState {
    db: UsersDb,
    driver: Arc<Exports>,
    audit: Option<SqliteActionStore>,
}

impl AppState {
    async fn execute(&self, sql: &str, values: Vec<Value>) -> Result<u64, ApiError> {
        let execute = self
            .driver
            .get::<Execute>(EXECUTE)
            .ok_or_else(|| ApiError::internal("driver has no execute member"))?;
        execute(sql.to_owned(), values).await.map_err(ApiError::from)
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<DriverError> for ApiError {
    fn from(e: DriverError) -> Self {
        let status = if e.0.contains("UNIQUE") {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self { status, message: e.0 }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(status = %self.status, error = %self.message, "request failed");
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Build the demo router with every route instrumented by `agent`.
pub fn router(agent: &Agent, db: UsersDb, audit: Option<SqliteActionStore>) -> Router {
    let driver = agent.load_module("rusqlite", rusqlite::version(), Arc::new(db.exports()));
    agent.load_module("axum", "0.8.0", Arc::new(Exports::new("axum")));

    let state = AppState { db, driver, audit };
    let routes = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", put(rename_user).delete(delete_user))
        .route("/sessions", post(login).layer(force_track(["password"])))
        .route("/actions", get(list_actions).layer(ignore()))
        .route("/health", get(|| async { "ok" }).layer(ignore()));

    instrument(routes, agent)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Deserialize)]
struct NewUser {
    name: String,
    email: String,
    password: Option<String>,
}

#[derive(Deserialize)]
struct Rename {
    name: String,
}

#[derive(Deserialize)]
struct Login {
    email: String,
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(Value::Array(state.db.list().await?)))
}

async fn create_user(
    State(state): State<AppState>,
    Json(user): Json<NewUser>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state
        .execute(
            "INSERT INTO users (name, email, password) VALUES (?, ?, ?)",
            vec![json!(user.name), json!(user.email), json!(user.password)],
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "name": user.name, "email": user.email }))))
}

async fn rename_user(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<i64>,
    Json(body): Json<Rename>,
) -> Result<StatusCode, ApiError> {
    let rows = state
        .execute("UPDATE users SET name = ? WHERE id = ?", vec![json!(body.name), json!(id)])
        .await?;
    Ok(if rows == 0 { StatusCode::NOT_FOUND } else { StatusCode::NO_CONTENT })
}

async fn delete_user(State(state): State<AppState>, RoutePath(id): RoutePath<i64>) -> Result<StatusCode, ApiError> {
    let rows = state.execute("DELETE FROM users WHERE id = ?", vec![json!(id)]).await?;
    Ok(if rows == 0 { StatusCode::NOT_FOUND } else { StatusCode::NO_CONTENT })
}

async fn login(Extension(control): Extension<TrackControl>, Json(body): Json<Login>) -> Json<Value> {
    control.set_user(TrackedUser {
        user: Some(json!({ "email": body.email })),
        ..Default::default()
    });
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
struct ActionsQuery {
    trace_id: Option<String>,
    limit: Option<u32>,
}

async fn list_actions(
    State(state): State<AppState>,
    Query(query): Query<ActionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(audit) = state.audit else {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "actions are delivered to the collector, not stored locally".into(),
        });
    };
    let query = ActionQuery {
        trace_id: query.trace_id.map(actiontrail_core::TraceId::from_raw),
        limit: query.limit.unwrap_or(50),
        ..Default::default()
    };
    let actions = tokio::task::spawn_blocking(move || audit.list(&query))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let actions = serde_json::to_value(actions).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(actions))
}
