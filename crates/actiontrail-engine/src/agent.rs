//! The agent handle shared by adapters, middleware and the host.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use actiontrail_core::errors::ConfigError;
use actiontrail_core::{Action, Framework, StorageEngine};

use crate::builder::ActionBuilder;
use crate::hooks::{Exports, Plugin, PluginRegistry};
use crate::plugins::{self, FrameworkOptions};
use crate::settings::{AgentSettings, TrackOptions};
use crate::sink::{ActionSink, HttpSink, StorageSink};
use crate::stream::{ActionStream, StreamOptions, StreamStats, TryWriteError};

struct AgentInner {
    settings: AgentSettings,
    builder: ActionBuilder,
    stream: ActionStream,
    registry: PluginRegistry,
    frameworks: RwLock<BTreeMap<String, FrameworkOptions>>,
}

/// Cheap to clone; every clone drives the same stream and registry.
#[derive(Clone)]
pub struct Agent(Arc<AgentInner>);

pub struct AgentBuilder {
    settings: AgentSettings,
    store: Option<Arc<dyn StorageEngine>>,
    sink: Option<Arc<dyn ActionSink>>,
    builtin_plugins: bool,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl AgentBuilder {
    /// Deliver into an in-process storage engine instead of the collector.
    pub fn store(mut self, store: Arc<dyn StorageEngine>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deliver into a custom sink. Takes precedence over a store.
    pub fn sink(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn without_builtin_plugins(mut self) -> Self {
        self.builtin_plugins = false;
        self
    }

    /// Validate settings and start the delivery worker. Must run inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Agent, ConfigError> {
        let in_process = self.store.is_some() || self.sink.is_some();
        self.settings.validate(in_process)?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "runtime",
                reason: "agent must be built inside a tokio runtime".into(),
            });
        }
        let settings = self.settings.resolved();

        let sink: Arc<dyn ActionSink> = match (self.sink, self.store) {
            (Some(sink), _) => sink,
            (None, Some(store)) => Arc::new(StorageSink::new(store, settings.company_id.clone())),
            (None, None) => Arc::new(HttpSink::from_settings(&settings)?),
        };

        let registry = PluginRegistry::new();
        if self.builtin_plugins {
            plugins::register_builtin(&registry);
        }
        for plugin in self.plugins {
            registry.register(plugin);
        }

        let frameworks = settings
            .frameworks
            .iter()
            .map(|(name, fw)| (name.clone(), FrameworkOptions::from(fw)))
            .collect();

        info!(
            application_id = %settings.application_id,
            environment = %settings.environment,
            sink = sink.name(),
            high_water_mark = settings.stream.high_water_mark,
            "agent started"
        );

        Ok(Agent(Arc::new(AgentInner {
            builder: ActionBuilder::new(&settings),
            stream: ActionStream::new(sink, StreamOptions::from(&settings.stream)),
            registry,
            frameworks: RwLock::new(frameworks),
            settings,
        })))
    }
}

impl Agent {
    pub fn builder(settings: AgentSettings) -> AgentBuilder {
        AgentBuilder {
            settings,
            store: None,
            sink: None,
            builtin_plugins: true,
            plugins: Vec::new(),
        }
    }

    /// Agent posting to the collector with the built-in plugins.
    pub fn new(settings: AgentSettings) -> Result<Self, ConfigError> {
        Self::builder(settings).build()
    }

    pub fn application_id(&self) -> &str {
        &self.0.settings.application_id
    }

    /// Settings with derived defaults filled in.
    pub fn settings(&self) -> &AgentSettings {
        &self.0.settings
    }

    /// Mask and stamp a draft without queueing it.
    pub fn create_action(&self, draft: Action) -> Action {
        self.0.builder.create_action(draft)
    }

    pub fn should_track_action(&self, action: &Action) -> bool {
        self.0.builder.should_track(action)
    }

    /// Finish a draft and queue it for delivery. Waits while the queue is
    /// full; never fails.
    pub async fn track_action(&self, draft: Action) {
        let action = self.create_action(draft);
        debug!(
            action_type = action.kind(),
            verb = action.verb(),
            object = action.action.object.as_deref().unwrap_or_default(),
            changes = action.changes.len(),
            "tracking action"
        );
        if let Err(e) = self.0.stream.write(action).await {
            warn!(error = %e, "action dropped");
        }
    }

    /// Finish a draft and queue it without holding up the caller. When the
    /// queue is full the write continues on a background task.
    pub fn enqueue_action(&self, draft: Action) {
        let action = self.create_action(draft);
        match self.0.stream.try_write(action) {
            Ok(()) => {}
            Err(TryWriteError::Full(action)) => {
                debug!("delivery queue full; writing in the background");
                let agent = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = agent.0.stream.write(*action).await {
                        warn!(error = %e, "action dropped");
                    }
                });
            }
            Err(TryWriteError::Closed) => warn!("delivery stream closed; action dropped"),
        }
    }

    pub fn set_framework(&self, framework: Framework) {
        self.0.builder.set_framework(framework);
    }

    pub fn framework(&self) -> Option<Framework> {
        self.0.builder.framework()
    }

    pub fn set_track_defaults(&self, defaults: &TrackOptions) {
        self.0.builder.set_track_defaults(defaults);
    }

    pub fn track_options(&self) -> TrackOptions {
        self.0.builder.track_options()
    }

    pub fn framework_options(&self, framework: &str) -> FrameworkOptions {
        self.0.frameworks.read().get(framework).cloned().unwrap_or_default()
    }

    /// Merge `options` into what is already set for `framework`.
    pub fn set_framework_options(&self, framework: &str, options: FrameworkOptions) {
        self.0
            .frameworks
            .write()
            .entry(framework.to_owned())
            .or_default()
            .merge(options);
    }

    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.0.registry.register(plugin);
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.0.registry
    }

    /// Announce a freshly loaded module. The matching plugin instruments it;
    /// the exports come back either way.
    pub fn load_module(&self, name: &str, version: &str, exports: Arc<Exports>) -> Arc<Exports> {
        self.0.registry.instrument(self, name, version, exports)
    }

    /// Deliver everything queued so far.
    pub async fn flush(&self) {
        if let Err(e) = self.0.stream.flush().await {
            warn!(error = %e, "flush skipped");
        }
    }

    pub fn stream_stats(&self) -> &StreamStats {
        self.0.stream.stats()
    }

    /// Flush and stop the delivery worker. Later actions are dropped.
    pub async fn shutdown(&self) {
        self.0.stream.close().await;
        info!(
            delivered = self.0.stream.stats().delivered(),
            failed_batches = self.0.stream.stats().failed_batches(),
            "agent stopped"
        );
    }

    /// Forget registered plugins so later loads pass through untouched.
    /// Wrappers already installed stay in place.
    pub fn destroy(&self) {
        self.0.registry.clear();
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("application_id", &self.0.settings.application_id)
            .field("environment", &self.0.settings.environment)
            .field("plugins", &self.0.registry.len())
            .finish_non_exhaustive()
    }
}
