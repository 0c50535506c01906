//! Authentication-provider adapter.
//!
//! Nothing is wrapped. Loading the provider is the signal that requests carry
//! an authenticated user, so its id is added to every `USER` agent.

use std::sync::Arc;

use actiontrail_core::errors::PluginError;

use super::http::{Extractor, FrameworkOptions, FRAMEWORK};
use crate::agent::Agent;
use crate::hooks::{Exports, Plugin};

pub struct AuthPlugin;

impl Plugin for AuthPlugin {
    fn name(&self) -> &str {
        "auth"
    }

    fn import_paths(&self) -> Vec<String> {
        vec!["auth".into()]
    }

    fn bootstrap(&self, agent: &Agent, exports: Arc<Exports>, _version: &str) -> Result<Arc<Exports>, PluginError> {
        agent.set_framework_options(
            FRAMEWORK,
            FrameworkOptions::default().with_user_meta("authUserId", Extractor::Path("auth.userId".into())),
        );
        Ok(exports)
    }
}
