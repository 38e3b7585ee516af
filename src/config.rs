//! Manager configuration and per-transaction options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, as used in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], " ").as_str() {
            "read uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(Error::Config(format!("unknown isolation level '{other}'"))),
        }
    }
}

/// Options passed to the backend when a physical transaction begins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// `None` keeps the server default.
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

/// Configuration for [`TransactionManager`](crate::TransactionManager).
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use sqlx_transaction_engine::TransactionConfig;
///
/// let config = TransactionConfig::default()
///     .with_max_retry_attempts(5)
///     .with_initial_delay(Duration::from_millis(20))
///     .with_max_tx_connections(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionConfig {
    /// Overall budget for a root call when the caller context has no deadline.
    /// `Duration::ZERO` disables it.
    pub default_timeout: Duration,
    /// Retries after the first attempt (3 means 4 tries in total).
    pub max_retry_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// When false, nested calls fail with [`Error::NestingDisabled`].
    pub enable_savepoints: bool,
    /// Wraps attempts and nested calls in `tracing` spans.
    pub enable_tracing: bool,
    /// Ceiling on concurrently bound root transactions.
    pub max_tx_connections: usize,
    /// How long a released connection may sit idle before cleanup reclaims it.
    pub idle_timeout: Duration,
    /// Re-bind idle connections to new transactions instead of opening fresh ones.
    pub connection_reuse: bool,
    pub tx_options: TxOptions,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            enable_savepoints: true,
            enable_tracing: false,
            max_tx_connections: 10,
            idle_timeout: Duration::from_secs(300),
            connection_reuse: true,
            tx_options: TxOptions::default(),
        }
    }
}

impl TransactionConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_savepoints(mut self, enabled: bool) -> Self {
        self.enable_savepoints = enabled;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    pub fn with_max_tx_connections(mut self, max: usize) -> Self {
        self.max_tx_connections = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connection_reuse(mut self, enabled: bool) -> Self {
        self.connection_reuse = enabled;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.tx_options.isolation = Some(level);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.tx_options.read_only = read_only;
        self
    }

    /// Checks invariants the manager relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the pool ceiling is zero, the backoff factor is
    /// below 1 or not finite, or the initial delay exceeds the maximum delay.
    pub fn validate(&self) -> Result<()> {
        if self.max_tx_connections == 0 {
            return Err(Error::Config("max_tx_connections must be at least 1".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::Config(
                "initial_delay must not exceed max_delay".into(),
            ));
        }
        Ok(())
    }

    /// Loads overrides from `TX_*` environment variables on top of the defaults.
    ///
    /// Recognized variables: `TX_DEFAULT_TIMEOUT_MS`, `TX_MAX_RETRY_ATTEMPTS`,
    /// `TX_INITIAL_DELAY_MS`, `TX_BACKOFF_FACTOR`, `TX_MAX_DELAY_MS`,
    /// `TX_ENABLE_SAVEPOINTS`, `TX_ENABLE_TRACING`, `TX_MAX_CONNECTIONS`,
    /// `TX_IDLE_TIMEOUT_MS`, `TX_CONNECTION_REUSE`, `TX_ISOLATION_LEVEL`, `TX_READ_ONLY`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable cannot be parsed or the result fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "TX_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "TX_MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TX_INITIAL_DELAY_MS")? {
            config.initial_delay = Duration::from_millis(ms);
        }
        if let Some(factor) = parse_var(&lookup, "TX_BACKOFF_FACTOR")? {
            config.backoff_factor = factor;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TX_MAX_DELAY_MS")? {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_flag(&lookup, "TX_ENABLE_SAVEPOINTS")? {
            config.enable_savepoints = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "TX_ENABLE_TRACING")? {
            config.enable_tracing = flag;
        }
        if let Some(n) = parse_var(&lookup, "TX_MAX_CONNECTIONS")? {
            config.max_tx_connections = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TX_IDLE_TIMEOUT_MS")? {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_flag(&lookup, "TX_CONNECTION_REUSE")? {
            config.connection_reuse = flag;
        }
        if let Some(level) = parse_var::<IsolationLevel, _>(&lookup, "TX_ISOLATION_LEVEL")? {
            config.tx_options.isolation = Some(level);
        }
        if let Some(flag) = parse_flag(&lookup, "TX_READ_ONLY")? {
            config.tx_options.read_only = flag;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::Config(format!("{key}={raw:?}: expected a boolean"))),
        },
    }
}
