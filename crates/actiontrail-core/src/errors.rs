use std::time::Duration;

/// Raised while building an agent. The only error class that reaches the
/// host application.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("applicationId is required")]
    MissingApplicationId,
    #[error("secret is required when no storage engine is configured")]
    MissingSecret,
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Raised by an adapter while instrumenting a freshly loaded module.
/// Always recovered by the registry; the module is handed back untouched.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unsupported version {version} of {module}")]
    UnsupportedVersion { module: String, version: String },
    #[error("module {module} has no member {member}")]
    MissingMember { module: String, member: String },
    #[error("plugin panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

/// Raised when a mutation signal cannot be interpreted. Treated as a noop.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("empty statement")]
    Empty,
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("expected {expected}, found {found}")]
    Expected { expected: String, found: String },
    #[error("unrecognized statement: {0}")]
    Unrecognized(String),
}

/// Raised by a storage engine's batch create.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage rejected batch: {0}")]
    Rejected(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failure of one flush attempt.
/// Classified so the stream can retry transient failures before dropping.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DeliveryError {
    // Fatal for this batch
    #[error("collector rejected credentials: {0}")]
    Unauthorized(String),
    #[error("collector rejected batch: {0}")]
    Rejected(String),
    #[error("failed to encode batch: {0}")]
    Encode(String),

    // Retryable
    #[error("collector rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("collector error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::Storage(StorageError::Unavailable(_))
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Rejected(_) => "rejected",
            Self::Encode(_) => "encode",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Storage(StorageError::Rejected(_)) => "storage_rejected",
            Self::Storage(StorageError::Unavailable(_)) => "storage_unavailable",
        }
    }

    /// Classify a non-success collector response.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::Rejected(format!("status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            DeliveryError::from_status(401, "no".into()),
            DeliveryError::Unauthorized(_)
        ));
        assert!(matches!(
            DeliveryError::from_status(429, String::new()),
            DeliveryError::RateLimited { .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(503, "busy".into()),
            DeliveryError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(422, "bad".into()),
            DeliveryError::Rejected(_)
        ));
    }

    #[test]
    fn retryable_classification() {
        assert!(DeliveryError::Network("reset".into()).is_retryable());
        assert!(DeliveryError::ServerError { status: 500, body: String::new() }.is_retryable());
        assert!(DeliveryError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(DeliveryError::Storage(StorageError::Unavailable("locked".into())).is_retryable());

        assert!(!DeliveryError::Unauthorized("key".into()).is_retryable());
        assert!(!DeliveryError::Rejected("schema".into()).is_retryable());
        assert!(!DeliveryError::Storage(StorageError::Rejected("constraint".into())).is_retryable());
    }

    #[test]
    fn rate_limit_carries_delay() {
        let err = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(2)));
        assert_eq!(err.error_kind(), "rate_limited");
        assert_eq!(DeliveryError::Network("x".into()).suggested_delay(), None);
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::MissingApplicationId.to_string(),
            "applicationId is required"
        );
        let err = ConfigError::InvalidValue {
            field: "stream.highWaterMark",
            reason: "must be at least 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for stream.highWaterMark: must be at least 1"
        );
    }
}
