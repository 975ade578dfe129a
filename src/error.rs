//! Error types for inbox-drafter.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors (durable ledger).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox request failed (status {status:?}): {reason}")]
    RequestFailed { status: Option<u16>, reason: String },

    #[error("Mailbox rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Mailbox resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Mailbox authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Mailbox rejected the request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid response from mailbox: {reason}")]
    InvalidResponse { reason: String },
}

impl MailboxError {
    /// Map an HTTP status from the mailbox provider to an error.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        let reason: String = body.chars().take(300).collect();
        match status {
            401 | 403 => Self::AuthFailed { reason },
            404 => Self::NotFound { resource: reason },
            429 => Self::RateLimited { retry_after },
            408 | 500..=599 => Self::RequestFailed {
                status: Some(status),
                reason,
            },
            _ => Self::InvalidRequest {
                reason: format!("HTTP {status}: {reason}"),
            },
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::InvalidResponse { .. }
        )
    }

    /// Server-provided hint for when to retry.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MailboxError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::InvalidResponse {
                reason: e.to_string(),
            };
        }
        Self::RequestFailed {
            status: e.status().map(|s| s.as_u16()),
            reason: e.to_string(),
        }
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Map an HTTP status from an LLM provider to an error.
    pub fn from_status(
        provider: &str,
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
    ) -> Self {
        let provider = provider.to_string();
        let reason: String = body.chars().take(300).collect();
        match status {
            401 | 403 => Self::AuthFailed { provider },
            429 => Self::RateLimited {
                provider,
                retry_after,
            },
            408 | 500..=599 => Self::RequestFailed {
                provider,
                reason: format!("HTTP {status}: {reason}"),
            },
            _ => Self::InvalidRequest {
                provider,
                reason: format!("HTTP {status}: {reason}"),
            },
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Unparseable model output counts as transient: sampling again usually fixes it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. }
                | Self::RateLimited { .. }
                | Self::InvalidResponse { .. }
                | Self::Json(_)
        )
    }

    /// Server-provided hint for when to retry.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of a stage that talks to more than one collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Mailbox(e) => e.is_transient(),
            Self::Llm(e) => e.is_transient(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Mailbox(e) => e.retry_after(),
            Self::Llm(e) => e.retry_after(),
        }
    }
}

/// Pipeline-related errors.
///
/// Stage failures are not errors at this level: they end the run with a
/// `FailureKind` outcome. These cover the cases where no run could be started.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ledger unavailable: {0}")]
    Ledger(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_status_mapping() {
        assert!(matches!(
            MailboxError::from_status(401, None, ""),
            MailboxError::AuthFailed { .. }
        ));
        assert!(matches!(
            MailboxError::from_status(404, None, "gone"),
            MailboxError::NotFound { .. }
        ));
        assert!(MailboxError::from_status(503, None, "").is_transient());
        assert!(MailboxError::from_status(408, None, "").is_transient());
        assert!(!MailboxError::from_status(400, None, "bad").is_transient());
        assert!(!MailboxError::from_status(403, None, "").is_transient());
    }

    #[test]
    fn mailbox_rate_limit_carries_retry_after() {
        let err = MailboxError::from_status(429, Some(Duration::from_secs(7)), "");
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn llm_status_mapping() {
        assert!(LlmError::from_status("anthropic", 529, None, "overloaded").is_transient());
        assert!(LlmError::from_status("anthropic", 429, None, "").is_transient());
        assert!(!LlmError::from_status("anthropic", 401, None, "").is_transient());
        assert!(!LlmError::from_status("openai", 400, None, "bad").is_transient());
    }

    #[test]
    fn llm_invalid_response_is_transient() {
        let err = LlmError::InvalidResponse {
            provider: "mock".into(),
            reason: "empty".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn external_error_delegates() {
        let e: ExternalError = MailboxError::from_status(500, None, "").into();
        assert!(e.is_transient());
        let e: ExternalError = LlmError::AuthFailed {
            provider: "x".into(),
        }
        .into();
        assert!(!e.is_transient());
    }

    #[test]
    fn error_display_includes_context() {
        let err = ConfigError::InvalidValue {
            key: "PIPELINE_RETRY_ATTEMPTS".into(),
            message: "must be at least 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PIPELINE_RETRY_ATTEMPTS"));
        assert!(msg.contains("at least 1"));
    }
}
