use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Output encoding for the stdout log layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Pretty => f.write_str("pretty"),
        }
    }
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "actiontrail_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

/// Handle to the installed subscriber.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    ///
    /// Takes effect immediately unless RUST_LOG was set at startup or another
    /// subscriber was already installed; the override is still recorded.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };

        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Whether this call installed the global subscriber.
    pub fn is_installed(&self) -> bool {
        self.reload.is_some()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the existing subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_locked = from_env.is_some();
    let env_filter = from_env.unwrap_or_else(|| EnvFilter::new(&filter_str));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let (json_layer, pretty_layer) = match config.format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .is_ok();

    if !installed {
        tracing::debug!("tracing subscriber already installed; keeping it");
    }

    TelemetryGuard {
        base_level: config.log_level,
        level_filter,
        reload: (installed && !env_locked).then_some(handle),
    }
}

/// Render an EnvFilter directive string such as `info,actiontrail_engine=debug`.
pub fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}
