use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use actiontrail_core::errors::PluginError;

use super::exports::Exports;
use crate::agent::Agent;

/// Teaches the agent how to instrument one kind of host module.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Module names this plugin handles.
    fn import_paths(&self) -> Vec<String>;

    /// Instrument `exports` and return them. Runs once per load notification;
    /// wrapping must go through [`Exports::wrap`] so repeats are harmless.
    fn bootstrap(
        &self,
        agent: &Agent,
        exports: Arc<Exports>,
        version: &str,
    ) -> Result<Arc<Exports>, PluginError>;
}

/// How a registration selects module names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Matcher {
    Exact(String),
    /// Matches the name itself and any `name/...` sub-path.
    Prefix(String),
}

impl Matcher {
    pub fn matches(&self, module: &str) -> bool {
        match self {
            Self::Exact(name) => name == module,
            Self::Prefix(prefix) => module
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
        }
    }
}

struct Registration {
    matcher: Matcher,
    plugin: Arc<dyn Plugin>,
}

/// Registry of plugins keyed by the module names they instrument.
/// The first matching registration wins.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under each of the plugin's import paths.
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let mut entries = self.entries.write();
        for path in plugin.import_paths() {
            entries.push(Registration {
                matcher: Matcher::Exact(path),
                plugin: Arc::clone(&plugin),
            });
        }
    }

    pub fn register_matcher(&self, matcher: Matcher, plugin: Arc<dyn Plugin>) {
        self.entries.write().push(Registration { matcher, plugin });
    }

    pub fn resolve(&self, module: &str) -> Option<Arc<dyn Plugin>> {
        self.entries
            .read()
            .iter()
            .find(|r| r.matcher.matches(module))
            .map(|r| Arc::clone(&r.plugin))
    }

    /// Every module name with a registration, sorted and unique.
    pub fn import_paths(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|r| match &r.matcher {
                Matcher::Exact(name) | Matcher::Prefix(name) => name.clone(),
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Run the matching plugin over a freshly loaded module.
    ///
    /// Never fails: an unmatched module, a plugin error or a plugin panic all
    /// hand back the exports the caller passed in.
    pub fn instrument(
        &self,
        agent: &Agent,
        module: &str,
        version: &str,
        exports: Arc<Exports>,
    ) -> Arc<Exports> {
        let Some(plugin) = self.resolve(module) else {
            return exports;
        };
        debug!(plugin = plugin.name(), module, version, "instrumenting module");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            plugin.bootstrap(agent, Arc::clone(&exports), version)
        }));

        match outcome {
            Ok(Ok(instrumented)) => instrumented,
            Ok(Err(PluginError::UnsupportedVersion { module, version })) => {
                info!(plugin = plugin.name(), module = %module, version = %version, "unsupported version; not instrumenting");
                exports
            }
            Ok(Err(e)) => {
                error!(plugin = plugin.name(), module, error = %e, "plugin failed; module left as loaded");
                exports
            }
            Err(panic) => {
                let e = PluginError::Panicked(panic_message(panic.as_ref()));
                error!(plugin = plugin.name(), module, error = %e, "plugin failed; module left as loaded");
                exports
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
