//! Broker connection settings.
//!
//! Built in code or read from `REDIS_*` environment variables via
//! [`BrokerConfig::from_env`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay before reconnect attempt `n` (1-indexed).
pub type RetryDelay = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Connection and resilience settings for the broker.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Namespace for every key the broker writes.
    pub key_prefix: String,
    pub connect_timeout: Duration,
    /// Read/write timeout per command, and the per-wait bound while a command
    /// waits for the connection to become ready.
    pub command_timeout: Duration,
    /// How many reconnect rounds a command may wait through before failing.
    /// `None` waits indefinitely (bounded only by shutdown).
    pub max_retries_per_request: Option<u32>,
    /// Run a readiness handshake after connecting, before reporting `Ready`.
    pub enable_ready_check: bool,
    /// Buffer enqueues while disconnected instead of rejecting them.
    pub enable_offline_queue: bool,
    pub offline_queue_limit: usize,
    /// Attempts made by [`BrokerConnection::connect`](crate::broker::BrokerConnection::connect)
    /// before giving up on the initial connection.
    pub connect_attempts: u32,
    pub retry_delay: RetryDelay,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: 0,
            key_prefix: "pdfgen".to_string(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            max_retries_per_request: None,
            enable_ready_check: false,
            enable_offline_queue: true,
            offline_queue_limit: 10_000,
            connect_attempts: 10,
            retry_delay: linear_retry(Duration::from_millis(50), Duration::from_secs(2)),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_max_retries_per_request(mut self, max: Option<u32>) -> Self {
        self.max_retries_per_request = max;
        self
    }

    pub fn with_ready_check(mut self, enabled: bool) -> Self {
        self.enable_ready_check = enabled;
        self
    }

    pub fn with_offline_queue(mut self, enabled: bool) -> Self {
        self.enable_offline_queue = enabled;
        self
    }

    pub fn with_offline_queue_limit(mut self, limit: usize) -> Self {
        self.offline_queue_limit = limit;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.retry_delay = Arc::new(delay);
        self
    }

    /// Delay before reconnect attempt `attempt`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        (self.retry_delay)(attempt)
    }

    /// `redis://host:port/db`, without credentials.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset keys keep their defaults.
    ///
    /// | key | default |
    /// |---|---|
    /// | `REDIS_HOST` | `localhost` |
    /// | `REDIS_PORT` | `6379` |
    /// | `REDIS_PASSWORD` | none |
    /// | `REDIS_DB` | `0` |
    /// | `REDIS_KEY_PREFIX` | `pdfgen` |
    /// | `REDIS_CONNECT_TIMEOUT_MS` | `10000` |
    /// | `REDIS_COMMAND_TIMEOUT_MS` | `5000` |
    /// | `REDIS_MAX_RETRIES_PER_REQUEST` | unbounded (`null` or empty also mean unbounded) |
    /// | `REDIS_ENABLE_READY_CHECK` | `false` |
    /// | `REDIS_ENABLE_OFFLINE_QUEUE` | `true` |
    /// | `REDIS_OFFLINE_QUEUE_LIMIT` | `10000` |
    /// | `REDIS_CONNECT_ATTEMPTS` | `10` |
    /// | `REDIS_RETRY_STEP_MS` / `REDIS_RETRY_MAX_MS` | `50` / `2000` |
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let host = get("REDIS_HOST")
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let port = parse_or(&get, "REDIS_PORT", 6379u16)?;
        let mut config = Self::new(host, port);

        config.password = get("REDIS_PASSWORD").filter(|p| !p.is_empty());
        config.db = parse_or(&get, "REDIS_DB", 0i64)?;
        if let Some(prefix) = get("REDIS_KEY_PREFIX").filter(|p| !p.is_empty()) {
            config.key_prefix = prefix;
        }
        config.connect_timeout =
            Duration::from_millis(parse_or(&get, "REDIS_CONNECT_TIMEOUT_MS", 10_000u64)?);
        config.command_timeout =
            Duration::from_millis(parse_or(&get, "REDIS_COMMAND_TIMEOUT_MS", 5_000u64)?);

        config.max_retries_per_request = match get("REDIS_MAX_RETRIES_PER_REQUEST") {
            None => None,
            Some(v) if v.is_empty() || v.eq_ignore_ascii_case("null") => None,
            Some(v) => Some(parse_value("REDIS_MAX_RETRIES_PER_REQUEST", &v)?),
        };

        config.enable_ready_check = parse_bool_or(&get, "REDIS_ENABLE_READY_CHECK", false)?;
        config.enable_offline_queue = parse_bool_or(&get, "REDIS_ENABLE_OFFLINE_QUEUE", true)?;
        config.offline_queue_limit = parse_or(&get, "REDIS_OFFLINE_QUEUE_LIMIT", 10_000usize)?;
        config.connect_attempts = parse_or(&get, "REDIS_CONNECT_ATTEMPTS", 10u32)?.max(1);

        let step = parse_or(&get, "REDIS_RETRY_STEP_MS", 50u64)?;
        let max = parse_or(&get, "REDIS_RETRY_MAX_MS", 2_000u64)?;
        config.retry_delay = linear_retry(Duration::from_millis(step), Duration::from_millis(max));

        Ok(config)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("localhost", 6379)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("key_prefix", &self.key_prefix)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_retries_per_request", &self.max_retries_per_request)
            .field("enable_ready_check", &self.enable_ready_check)
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("offline_queue_limit", &self.offline_queue_limit)
            .field("connect_attempts", &self.connect_attempts)
            .finish_non_exhaustive()
    }
}

/// `min(attempt * step, max)`.
pub fn linear_retry(step: Duration, max: Duration) -> RetryDelay {
    Arc::new(move |attempt| step.saturating_mul(attempt).min(max))
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(v) if !v.is_empty() => parse_value(key, &v),
        _ => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: v,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = BrokerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6379);
        assert_eq!(config.max_retries_per_request, None);
        assert!(!config.enable_ready_check);
        assert!(config.enable_offline_queue);
        assert_eq!(config.retry_delay(1), Duration::from_millis(50));
        assert_eq!(config.retry_delay(1000), Duration::from_secs(2));
    }

    #[test]
    fn reads_every_key() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("REDIS_HOST", "redis.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_DB", "2"),
            ("REDIS_KEY_PREFIX", "docs"),
            ("REDIS_COMMAND_TIMEOUT_MS", "750"),
            ("REDIS_MAX_RETRIES_PER_REQUEST", "3"),
            ("REDIS_ENABLE_READY_CHECK", "true"),
            ("REDIS_ENABLE_OFFLINE_QUEUE", "0"),
            ("REDIS_RETRY_STEP_MS", "100"),
            ("REDIS_RETRY_MAX_MS", "300"),
        ]))
        .unwrap();

        assert_eq!(config.host, "redis.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.db, 2);
        assert_eq!(config.key_prefix, "docs");
        assert_eq!(config.command_timeout, Duration::from_millis(750));
        assert_eq!(config.max_retries_per_request, Some(3));
        assert!(config.enable_ready_check);
        assert!(!config.enable_offline_queue);
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(9), Duration::from_millis(300));
        assert_eq!(config.redis_url(), "redis://redis.internal:6380/2");
    }

    #[test]
    fn null_max_retries_means_unbounded() {
        let config =
            BrokerConfig::from_lookup(lookup(&[("REDIS_MAX_RETRIES_PER_REQUEST", "null")]))
                .unwrap();
        assert_eq!(config.max_retries_per_request, None);
    }

    #[test]
    fn rejects_garbage() {
        let err = BrokerConfig::from_lookup(lookup(&[("REDIS_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "REDIS_PORT"));

        let err = BrokerConfig::from_lookup(lookup(&[("REDIS_ENABLE_READY_CHECK", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn debug_hides_password() {
        let config = BrokerConfig::default().with_password("hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
