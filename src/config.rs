//! Configuration types.
//!
//! Everything is read from the environment once at startup. Loaders take a
//! variable lookup function so tests never have to touch the process
//! environment.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::retry::RetryPolicy;

/// Source of configuration variables (`std::env::var` in production).
pub type VarLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// A variable that is set and not blank.
pub(crate) fn optional_var(vars: VarLookup<'_>, key: &str) -> Option<String> {
    vars(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` when unset.
pub(crate) fn parse_var<T>(vars: VarLookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional_var(vars, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn parse_bool(vars: VarLookup<'_>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_var(vars, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{v:?} is not a boolean"),
        }),
    }
}

fn at_least<T: PartialOrd + fmt::Display>(key: &str, value: T, min: T) -> Result<T, ConfigError> {
    if value < min {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at least {min}, got {value}"),
        });
    }
    Ok(value)
}

// ── Pipeline ────────────────────────────────────────────────────────

/// What to do when the review loop runs out of redrafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewExhaustedPolicy {
    /// Save the last candidate for a human to edit.
    #[default]
    SaveBestEffort,
    /// End the run with `FAILED:REVIEW_EXHAUSTED`.
    Fail,
}

impl FromStr for ReviewExhaustedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "save_best_effort" => Ok(Self::SaveBestEffort),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "unknown policy '{other}', expected save_best_effort or fail"
            )),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Redrafts allowed after the initial draft.
    pub max_redraft_attempts: u32,
    pub review_exhausted_policy: ReviewExhaustedPolicy,
    /// Retry policy for classify, context, generate and review.
    pub retry: RetryPolicy,
    /// Retry policy for saving the draft. Larger budget, same backoff.
    pub save_retry: RetryPolicy,
    /// Per-attempt timeout for any external call.
    pub attempt_timeout: Duration,
    /// Bound on the condensed thread summary.
    pub summary_max_chars: usize,
    /// Runs dispatched concurrently from a notification source.
    pub max_concurrent_runs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_redraft_attempts: 2,
            review_exhausted_policy: ReviewExhaustedPolicy::SaveBestEffort,
            save_retry: RetryPolicy {
                max_attempts: 8,
                ..retry.clone()
            },
            retry,
            attempt_timeout: Duration::from_secs(60),
            summary_max_chars: 1500,
            max_concurrent_runs: 16,
        }
    }
}

impl PipelineConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backoff_base = Duration::from_millis(parse_var(
            vars,
            "PIPELINE_RETRY_BACKOFF_BASE_MS",
            defaults.retry.backoff_base.as_millis() as u64,
        )?);
        let max_backoff = Duration::from_millis(parse_var(
            vars,
            "PIPELINE_RETRY_BACKOFF_MAX_MS",
            defaults.retry.max_backoff.as_millis() as u64,
        )?);
        if max_backoff < backoff_base {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_RETRY_BACKOFF_MAX_MS".into(),
                message: "must not be below PIPELINE_RETRY_BACKOFF_BASE_MS".into(),
            });
        }

        let retry_attempts = at_least(
            "PIPELINE_RETRY_ATTEMPTS",
            parse_var(vars, "PIPELINE_RETRY_ATTEMPTS", defaults.retry.max_attempts)?,
            1,
        )?;
        let save_attempts = at_least(
            "PIPELINE_SAVE_RETRY_ATTEMPTS",
            parse_var(
                vars,
                "PIPELINE_SAVE_RETRY_ATTEMPTS",
                defaults.save_retry.max_attempts,
            )?,
            1,
        )?;

        Ok(Self {
            max_redraft_attempts: parse_var(
                vars,
                "PIPELINE_MAX_REDRAFT_ATTEMPTS",
                defaults.max_redraft_attempts,
            )?,
            review_exhausted_policy: parse_var(
                vars,
                "PIPELINE_REVIEW_EXHAUSTED_POLICY",
                defaults.review_exhausted_policy,
            )?,
            retry: RetryPolicy {
                max_attempts: retry_attempts,
                backoff_base,
                max_backoff,
            },
            save_retry: RetryPolicy {
                max_attempts: save_attempts,
                backoff_base,
                max_backoff,
            },
            attempt_timeout: Duration::from_secs(at_least(
                "PIPELINE_ATTEMPT_TIMEOUT_SECS",
                parse_var(
                    vars,
                    "PIPELINE_ATTEMPT_TIMEOUT_SECS",
                    defaults.attempt_timeout.as_secs(),
                )?,
                1,
            )?),
            summary_max_chars: parse_var(
                vars,
                "PIPELINE_SUMMARY_MAX_CHARS",
                defaults.summary_max_chars,
            )?,
            max_concurrent_runs: at_least(
                "PIPELINE_MAX_CONCURRENT_RUNS",
                parse_var(
                    vars,
                    "PIPELINE_MAX_CONCURRENT_RUNS",
                    defaults.max_concurrent_runs,
                )?,
                1,
            )?,
        })
    }
}

// ── Ledger ──────────────────────────────────────────────────────────

/// Dedup ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a FAILED id stays non-admittable.
    pub failed_cooldown: Duration,
    /// An IN_PROGRESS entry older than this is treated as abandoned.
    pub in_progress_lease: Duration,
    /// libSQL file for a durable ledger; in-memory when `None`.
    pub db_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            failed_cooldown: Duration::from_secs(300),
            in_progress_lease: Duration::from_secs(1800),
            db_path: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            failed_cooldown: Duration::from_secs(parse_var(
                vars,
                "LEDGER_FAILED_COOLDOWN_SECS",
                defaults.failed_cooldown.as_secs(),
            )?),
            in_progress_lease: Duration::from_secs(at_least(
                "LEDGER_IN_PROGRESS_LEASE_SECS",
                parse_var(
                    vars,
                    "LEDGER_IN_PROGRESS_LEASE_SECS",
                    defaults.in_progress_lease.as_secs(),
                )?,
                1,
            )?),
            db_path: optional_var(vars, "LEDGER_DB_PATH").map(PathBuf::from),
        })
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Webhook server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Shared secret the subscription was created with.
    pub client_state: Option<String>,
    /// Capacity of the hand-off queue between endpoint and pipeline.
    pub queue_capacity: usize,
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            client_state: None,
            queue_capacity: 1024,
            cors_permissive: false,
        }
    }
}

impl ServerConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind: parse_var(vars, "WEBHOOK_BIND", defaults.bind)?,
            client_state: optional_var(vars, "WEBHOOK_CLIENT_STATE"),
            queue_capacity: at_least(
                "WEBHOOK_QUEUE_CAPACITY",
                parse_var(vars, "WEBHOOK_QUEUE_CAPACITY", defaults.queue_capacity)?,
                1,
            )?,
            cors_permissive: parse_bool(vars, "WEBHOOK_CORS_PERMISSIVE", defaults.cors_permissive)?,
        })
    }
}

// ── Logging ─────────────────────────────────────────────────────────

/// Log output configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for the rolling `app.log`; stdout only when `None`.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("logs")),
        }
    }
}

impl LogConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Self {
        match vars("LOG_DIR") {
            None => Self::default(),
            Some(dir) if dir.trim().is_empty() => Self { dir: None },
            Some(dir) => Self {
                dir: Some(PathBuf::from(dir.trim())),
            },
        }
    }
}
