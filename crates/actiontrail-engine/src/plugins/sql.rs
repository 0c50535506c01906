//! Statement-level change capture for SQL drivers.

use std::sync::Arc;

use futures::future::BoxFuture;
use semver::VersionReq;
use serde_json::Value;
use tracing::debug;

use actiontrail_core::errors::PluginError;

use super::check_version;
use crate::agent::Agent;
use crate::context;
use crate::hooks::{Exports, Plugin};
use crate::normalize::statement_change;

/// Error reported by a driver. Passed through untouched by the wrapper.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

pub type DriverFuture = BoxFuture<'static, Result<u64, DriverError>>;

/// Shape of a driver's `execute` member: statement text and bound values in,
/// affected row count out.
pub type Execute = dyn Fn(String, Vec<Value>) -> DriverFuture + Send + Sync;

pub const EXECUTE: &str = "execute";

/// Wraps `execute` so successful mutations land in the operation that issued
/// them.
pub struct SqlPlugin {
    supported: VersionReq,
}

impl Default for SqlPlugin {
    fn default() -> Self {
        Self {
            supported: VersionReq::STAR,
        }
    }
}

impl SqlPlugin {
    pub fn with_supported(supported: VersionReq) -> Self {
        Self { supported }
    }
}

impl Plugin for SqlPlugin {
    fn name(&self) -> &str {
        "sql"
    }

    fn import_paths(&self) -> Vec<String> {
        vec!["rusqlite".into(), "mysql".into(), "sqlx".into()]
    }

    fn bootstrap(&self, _agent: &Agent, exports: Arc<Exports>, version: &str) -> Result<Arc<Exports>, PluginError> {
        check_version(&self.supported, exports.module(), version)?;
        if !exports.contains(EXECUTE) {
            return Err(PluginError::MissingMember {
                module: exports.module().to_owned(),
                member: EXECUTE.to_owned(),
            });
        }
        if let Some(handle) = exports.wrap::<Execute>(EXECUTE, wrap_execute) {
            handle.forget();
        }
        Ok(exports)
    }
}

fn wrap_execute(original: Arc<Execute>) -> Arc<Execute> {
    Arc::new(move |sql: String, values: Vec<Value>| {
        // Captured now: the driver may complete on another task.
        let span = context::current();
        let change = span.as_ref().and_then(|_| statement_change(&sql, &values));
        let call = original(sql, values);
        Box::pin(async move {
            let result = call.await;
            match (&result, span, change) {
                (Ok(_), Some(span), Some(change)) => span.track_change(change),
                (Err(e), _, Some(change)) => {
                    debug!(model = %change.model, error = %e, "statement failed; change not recorded");
                }
                _ => {}
            }
            result
        }) as DriverFuture
    })
}
