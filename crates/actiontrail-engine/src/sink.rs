//! Batch destinations for the delivery stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use actiontrail_core::errors::{ConfigError, DeliveryError, StorageError};
use actiontrail_core::{Action, StorageEngine};

use crate::settings::AgentSettings;

/// Where flushed batches go. One call per batch; the batch succeeds or fails
/// as a unit.
#[async_trait]
pub trait ActionSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, batch: &[Action]) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    actions: &'a [Action],
}

/// Posts batches to the collector as `{"actions": [...]}`.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    secret: SecretString,
    user_agent: Option<String>,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, secret: SecretString) -> Self {
        let timeout = Duration::from_secs(10);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url: url.into(),
            secret,
            user_agent: None,
            timeout,
        }
    }

    /// Build from resolved settings. Requires a secret and a URL.
    pub fn from_settings(settings: &AgentSettings) -> Result<Self, ConfigError> {
        let secret = settings
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret)?;
        let url = settings.url.clone().ok_or_else(|| ConfigError::InvalidValue {
            field: "url",
            reason: "collector url not resolved".into(),
        })?;
        let mut sink = Self::new(url, SecretString::from(secret))
            .with_timeout(Duration::from_millis(settings.stream.request_timeout_ms));
        sink.user_agent = settings.user_agent.clone();
        Ok(sink)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The configured user agent, else one derived from the batch's app and
    /// framework.
    fn user_agent_for(&self, batch: &[Action]) -> String {
        if let Some(ua) = &self.user_agent {
            return ua.clone();
        }
        let first = batch.first();
        let app = first.and_then(|a| a.app.as_deref()).unwrap_or("actiontrail");
        let framework = first.and_then(|a| a.framework.as_ref());
        derive_user_agent(
            app,
            framework.and_then(|f| f.name.as_deref()),
            framework.and_then(|f| f.version.as_deref()),
        )
    }
}

/// `"{app} ({framework} @ {version})"`, with missing parts left blank.
pub fn derive_user_agent(app: &str, framework: Option<&str>, version: Option<&str>) -> String {
    format!(
        "{app} ({} @ {})",
        framework.unwrap_or_default(),
        version.unwrap_or_default()
    )
}

#[async_trait]
impl ActionSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, batch: &[Action]) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&Envelope { actions: batch })
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.secret.expose_secret()))
            .header(reqwest::header::USER_AGENT, self.user_agent_for(batch))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %self.url, batch_size = batch.len(), status = status.as_u16(), "batch delivered");
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        match DeliveryError::from_status(status.as_u16(), text) {
            DeliveryError::RateLimited { .. } => Err(DeliveryError::RateLimited { retry_after }),
            other => Err(other),
        }
    }
}

/// Hands batches to an in-process storage engine, stamping the tenant first.
pub struct StorageSink {
    engine: Arc<dyn StorageEngine>,
    company_id: Option<String>,
}

impl StorageSink {
    pub fn new(engine: Arc<dyn StorageEngine>, company_id: Option<String>) -> Self {
        Self { engine, company_id }
    }
}

#[async_trait]
impl ActionSink for StorageSink {
    fn name(&self) -> &str {
        "storage"
    }

    async fn deliver(&self, batch: &[Action]) -> Result<(), DeliveryError> {
        let stamped: Vec<Action> = batch
            .iter()
            .cloned()
            .map(|mut action| {
                if action.company_id.is_none() {
                    action.company_id = self.company_id.clone();
                }
                action
            })
            .collect();
        let stored = self.engine.create_many_actions(stamped).await?;
        debug!(batch_size = batch.len(), stored, "batch stored");
        Ok(())
    }
}

/// Keeps delivered batches in memory. Used by tests and by hosts that read
/// actions back directly.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Action>>>,
    failing: AtomicBool,
}

impl MemorySink {
    /// A sink that rejects every batch until [`MemorySink::set_failing`] clears it.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<Action>> {
        self.batches.lock().clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ActionSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, batch: &[Action]) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Storage(StorageError::Rejected("sink failing".into())));
        }
        self.batches.lock().push(batch.to_vec());
        Ok(())
    }
}
