//! Runtime configuration read from `BMS_*` environment variables.

use crate::batch::Strategy;
use crate::error::ConfigError;
use crate::mailer::RetryPolicy;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Worker threads for the threaded strategy, at least 1.
    pub worker_count: usize,
    pub strategy: Strategy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            worker_count: default_worker_count(),
            strategy: Strategy::Threaded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailerConfig {
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub retry: RetryPolicy,
    pub drain_deadline: Duration,
    pub from_address: String,
    /// Recipient for batch summaries; summaries are not sent when unset.
    pub notify_to: Option<String>,
    /// Mail server to deliver through; messages are only logged when unset.
    pub smtp: Option<SmtpConfig>,
}

impl Default for MailerConfig {
    fn default() -> Self {
        MailerConfig {
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            drain_deadline: Duration::from_secs(5),
            from_address: "no-reply@example.com".to_string(),
            notify_to: None,
            smtp: None,
        }
    }
}

/// SMTP relay settings, read from `BMS_SMTP_*`.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    /// 587 for Gmail, 1025 (a local dev server) otherwise.
    pub port: u16,
    /// Login name; the sender address is used when unset.
    pub username: Option<String>,
    /// No login is attempted without a password.
    pub password: Option<String>,
    /// Upgrade the connection with STARTTLS. Defaults to on for Gmail only.
    pub use_tls: bool,
    pub timeout: Duration,
}

impl SmtpConfig {
    const GMAIL: &'static str = "smtp.gmail.com";

    /// Defaults for `host`, as applied when only `BMS_SMTP_HOST` is set.
    pub fn for_host(host: impl Into<String>) -> Self {
        let host = host.into();
        let gmail = host == Self::GMAIL;
        SmtpConfig {
            port: if gmail { 587 } else { 1025 },
            username: None,
            password: None,
            use_tls: gmail,
            timeout: Duration::from_secs(10),
            host,
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_tls", &self.use_tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub batch: BatchConfig,
    pub mailer: MailerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Unset or empty
    /// variables fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let defaults = Config::default();

        let worker_count = parse_or(&get, "BMS_WORKERS", defaults.batch.worker_count)?.max(1);
        let strategy = match get("BMS_STRATEGY") {
            Some(raw) => raw.parse::<Strategy>().map_err(|_| ConfigError::InvalidValue {
                var: "BMS_STRATEGY".to_string(),
                value: raw.clone(),
                reason: "expected threaded or cooperative".to_string(),
            })?,
            None => defaults.batch.strategy,
        };

        let mailer = defaults.mailer;
        let retry = RetryPolicy {
            max_retries: parse_or(&get, "BMS_MAX_RETRIES", mailer.retry.max_retries)?,
            base_delay: millis_or(&get, "BMS_RETRY_BASE_MS", mailer.retry.base_delay)?,
            max_delay: millis_or(&get, "BMS_RETRY_MAX_MS", mailer.retry.max_delay)?,
        };
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::InvalidValue {
                var: "BMS_RETRY_MAX_MS".to_string(),
                value: retry.max_delay.as_millis().to_string(),
                reason: "must not be below BMS_RETRY_BASE_MS".to_string(),
            });
        }

        Ok(Config {
            batch: BatchConfig {
                worker_count,
                strategy,
            },
            mailer: MailerConfig {
                queue_capacity: parse_or(&get, "BMS_QUEUE_CAPACITY", mailer.queue_capacity)?.max(1),
                enqueue_timeout: millis_or(&get, "BMS_ENQUEUE_TIMEOUT_MS", mailer.enqueue_timeout)?,
                retry,
                drain_deadline: millis_or(&get, "BMS_DRAIN_DEADLINE_MS", mailer.drain_deadline)?,
                from_address: get("BMS_SMTP_FROM").unwrap_or(mailer.from_address),
                notify_to: get("BMS_NOTIFY_TO"),
                smtp: smtp_from(&get)?,
            },
        })
    }
}

fn smtp_from<G>(get: &G) -> Result<Option<SmtpConfig>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(host) = get("BMS_SMTP_HOST") else {
        return Ok(None);
    };
    let defaults = SmtpConfig::for_host(host.trim());

    let use_tls = match get("BMS_SMTP_TLS") {
        Some(raw) => parse_flag(&raw).ok_or_else(|| ConfigError::InvalidValue {
            var: "BMS_SMTP_TLS".to_string(),
            value: raw.clone(),
            reason: "expected true or false".to_string(),
        })?,
        None => defaults.use_tls,
    };

    Ok(Some(SmtpConfig {
        port: parse_or(get, "BMS_SMTP_PORT", defaults.port)?,
        username: get("BMS_SMTP_USER"),
        password: get("BMS_SMTP_PASS"),
        use_tls,
        timeout: millis_or(get, "BMS_SMTP_TIMEOUT_MS", defaults.timeout)?,
        host: defaults.host,
    }))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Available parallelism, or 1 when it cannot be determined.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

fn parse_or<G, T>(get: &G, var: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, var: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(get, var, default_ms).map(Duration::from_millis)
}
