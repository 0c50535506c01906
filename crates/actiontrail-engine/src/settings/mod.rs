//! Agent configuration.
//!
//! Settings are plain serde data in the collector's camelCase shape. Values
//! that depend on other fields (collector URL, app name, HTTP verb filter)
//! are filled in by [`AgentSettings::resolved`] when the agent is built.

mod loader;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use actiontrail_core::errors::ConfigError;
use actiontrail_core::mask::MaskOptions;

pub use loader::{apply_env_overrides, apply_overrides, deep_merge, load_settings_from_path, parse_usize_range};

pub const DEFAULT_COLLECTOR_URL: &str = "https://collector.actiontrail.io";
pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_HIGH_WATER_MARK: usize = 10;
pub const DEFAULT_HTTP_METHODS: &[&str] = &["POST", "PATCH", "PUT", "DELETE"];

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub application_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Overrides the per-batch `user-agent` derived from app and framework.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Tenant stamped on actions handed to a storage engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    pub track: TrackOptions,
    pub stream: StreamSettings,
    pub mask: MaskOptions,
    pub frameworks: BTreeMap<String, FrameworkSettings>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            secret: None,
            app: None,
            environment: DEFAULT_ENVIRONMENT.to_owned(),
            url: None,
            user_agent: None,
            company_id: None,
            track: TrackOptions::default(),
            stream: StreamSettings::default(),
            mask: MaskOptions::default(),
            frameworks: BTreeMap::new(),
        }
    }
}

// Keeps the secret out of logs.
impl fmt::Debug for AgentSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSettings")
            .field("application_id", &self.application_id)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("app", &self.app)
            .field("environment", &self.environment)
            .field("url", &self.url)
            .field("company_id", &self.company_id)
            .field("track", &self.track)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl AgentSettings {
    pub fn for_application(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Check what the agent cannot run without. A storage engine replaces
    /// the collector, so the secret is only required without one.
    pub fn validate(&self, has_store: bool) -> Result<(), ConfigError> {
        if self.application_id.trim().is_empty() {
            return Err(ConfigError::MissingApplicationId);
        }
        if !has_store && self.secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(ConfigError::MissingSecret);
        }
        if self.stream.high_water_mark == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stream.highWaterMark",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Fill derived defaults: app name, collector URL and the HTTP verb filter.
    pub fn resolved(mut self) -> Self {
        if self.app.as_deref().map_or(true, str::is_empty) {
            self.app = default_app_name();
        }
        if self.url.is_none() {
            self.url = Some(collector_url(&self.environment, &self.application_id));
        }
        let http = self.track.actions.entry("HTTP".to_owned()).or_default();
        if http.methods.is_none() {
            http.methods = Some(DEFAULT_HTTP_METHODS.iter().map(|m| (*m).to_owned()).collect());
        }
        self
    }
}

/// Collector endpoint for an application. Every environment currently
/// shares one collector.
pub fn collector_url(_environment: &str, application_id: &str) -> String {
    format!("{DEFAULT_COLLECTOR_URL}/{application_id}/actions")
}

/// Package name when run under cargo, else the executable's file stem.
fn default_app_name() -> Option<String> {
    std::env::var("CARGO_PKG_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            std::env::current_exe()
                .ok()?
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
}

/// What to track.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackOptions {
    /// Per action type verb allow-lists, e.g. `{"HTTP": {"methods": ["POST"]}}`.
    pub actions: BTreeMap<String, ActionFilter>,
    /// Request sections to keep, e.g. `{"body": false}`.
    pub request: BTreeMap<String, bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

impl TrackOptions {
    /// Copy entries from `defaults` that are not configured here.
    pub fn fill_defaults(&mut self, defaults: &TrackOptions) {
        for (kind, filter) in &defaults.actions {
            let entry = self.actions.entry(kind.clone()).or_default();
            if entry.methods.is_none() {
                entry.methods = filter.methods.clone();
            }
        }
        for (field, enabled) in &defaults.request {
            self.request.entry(field.clone()).or_insert(*enabled);
        }
    }

    /// `false` only when the action type has a verb allow-list without `verb`.
    pub fn allows(&self, kind: &str, verb: &str) -> bool {
        match self.actions.get(kind).and_then(|f| f.methods.as_ref()) {
            Some(methods) => methods.iter().any(|m| m == verb),
            None => true,
        }
    }

    /// Request sections are kept unless explicitly disabled.
    pub fn request_field_enabled(&self, field: &str) -> bool {
        self.request.get(field) != Some(&false)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Queue capacity before writers wait, and the largest batch per flush.
    pub high_water_mark: usize,
    /// Extra attempts for a batch that failed with a transient error.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Upper bound on one wait between attempts, server hints included.
    pub max_retry_delay_ms: u64,
    /// Total time a batch may spend waiting on retries before it is dropped.
    pub max_retry_elapsed_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_retries: 2,
            retry_delay_ms: 250,
            max_retry_delay_ms: 2_000,
            max_retry_elapsed_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Configured request data for one framework adapter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameworkSettings {
    /// Dotted path into the request view holding the user id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Static values added to the user agent's meta.
    pub user_meta: BTreeMap<String, Value>,
}
