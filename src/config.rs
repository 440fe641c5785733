//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::workflow::approval::ApprovalPolicy;

/// Default database location.
pub const DEFAULT_DB_PATH: &str = "./data/mail-steward.db";

/// Default model used when an LLM backend is configured.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// How many recent triage corrections are considered for override promotion.
pub const DEFAULT_CORRECTION_WINDOW: usize = 10;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path of the libSQL database holding memory and checkpoints.
    pub db_path: PathBuf,
    /// How long the interactive façade waits for a human decision before
    /// treating the workflow as denied.
    pub approval_timeout: Duration,
    /// Bounded retry for rate-limited tool and LLM calls.
    pub retry: RetryPolicy,
    /// Which action types suspend for approval.
    pub approval: ApprovalPolicy,
    /// Number of recent corrections inspected when promoting a triage override.
    pub correction_window: usize,
    /// LLM model name.
    pub model: String,
    /// LLM API key. `None` selects the offline rules classifier and template drafter.
    pub api_key: Option<SecretString>,
    /// Directory for rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            approval_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            approval: ApprovalPolicy::default(),
            correction_window: DEFAULT_CORRECTION_WINDOW,
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            log_dir: None,
        }
    }
}

impl AgentConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("MAIL_STEWARD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let approval_timeout = Duration::from_secs(parse_env(
            "MAIL_STEWARD_APPROVAL_TIMEOUT_SECS",
            defaults.approval_timeout.as_secs(),
        )?);

        let retry = RetryPolicy {
            max_retries: parse_env("MAIL_STEWARD_RATE_LIMIT_RETRIES", defaults.retry.max_retries)?,
            backoff: Duration::from_millis(parse_env(
                "MAIL_STEWARD_RATE_LIMIT_BACKOFF_MS",
                defaults.retry.backoff.as_millis() as u64,
            )?),
        };

        let mut approval = defaults.approval;
        if let Ok(list) = std::env::var("MAIL_STEWARD_DANGEROUS_ACTIONS") {
            approval = ApprovalPolicy::new(split_list(&list), approval.safe_actions());
        }
        if let Ok(list) = std::env::var("MAIL_STEWARD_SAFE_ACTIONS") {
            approval = ApprovalPolicy::new(approval.dangerous_actions(), split_list(&list));
        }

        let correction_window =
            parse_env("MAIL_STEWARD_CORRECTION_WINDOW", defaults.correction_window)?;
        if correction_window < 3 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_STEWARD_CORRECTION_WINDOW".into(),
                message: "must be at least 3".into(),
            });
        }

        let model = std::env::var("MAIL_STEWARD_MODEL").unwrap_or(defaults.model);
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        let log_dir = std::env::var("MAIL_STEWARD_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            db_path,
            approval_timeout,
            retry,
            approval,
            correction_window,
            model,
            api_key,
            log_dir,
        })
    }
}

/// SMTP settings for the outbound mailer.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build from environment variables.
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (outbox-only mode).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_SMTP_HOST").ok()?;
        let port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
