//! Change capture for ORMs that report saved records.

use std::sync::Arc;

use futures::future::BoxFuture;

use actiontrail_core::errors::PluginError;

use super::sql::DriverError;
use crate::agent::Agent;
use crate::context;
use crate::hooks::{Exports, Plugin};
use crate::normalize::{record_change, RecordSnapshot};

pub type SaveFuture = BoxFuture<'static, Result<RecordSnapshot, DriverError>>;

/// Shape of a model's `save` member: the record as saved comes back.
pub type Save = dyn Fn(RecordSnapshot) -> SaveFuture + Send + Sync;

pub const SAVE: &str = "save";

pub struct RecordPlugin;

impl Plugin for RecordPlugin {
    fn name(&self) -> &str {
        "record"
    }

    fn import_paths(&self) -> Vec<String> {
        vec!["orm".into()]
    }

    fn bootstrap(&self, _agent: &Agent, exports: Arc<Exports>, _version: &str) -> Result<Arc<Exports>, PluginError> {
        if let Some(handle) = exports.wrap::<Save>(SAVE, wrap_save) {
            handle.forget();
        }
        Ok(exports)
    }
}

fn wrap_save(original: Arc<Save>) -> Arc<Save> {
    Arc::new(move |record: RecordSnapshot| {
        let span = context::current();
        let call = original(record);
        Box::pin(async move {
            let saved = call.await?;
            if let Some(span) = span {
                if let Some(change) = record_change(&saved) {
                    span.track_change(change);
                }
            }
            Ok(saved)
        }) as SaveFuture
    })
}
