//! Failure classification and backoff policy for the root retry loop.

use std::fmt;
use std::time::Duration;

use crate::config::TransactionConfig;
use crate::error::Error;

/// Coarse failure categories derived from backend status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection dropped or could not be established.
    ConnectionLoss,
    /// Server ran out of connections, memory or similar.
    ResourceExhausted,
    /// Serialization failure or deadlock.
    Conflict,
    /// Statement timed out or lock wait expired on the server. Retried only while
    /// the caller's context is still live; the caller's own cancellation or
    /// deadline is [`Cancelled`](Self::Cancelled) and never retried.
    QueryTimeout,
    /// Constraint or data validity violation.
    Integrity,
    /// Malformed statement or insufficient privileges.
    SyntaxOrPermission,
    /// Pool backpressure.
    Capacity,
    /// A Before* hook rejected the transition.
    Hook,
    /// Savepoint misuse.
    Savepoint,
    /// Caller cancellation or deadline.
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::ConnectionLoss
                | ErrorCategory::ResourceExhausted
                | ErrorCategory::Conflict
                | ErrorCategory::QueryTimeout
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::ConnectionLoss => "connection_loss",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::QueryTimeout => "query_timeout",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::SyntaxOrPermission => "syntax_or_permission",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::Hook => "hook",
            ErrorCategory::Savepoint => "savepoint",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub category: ErrorCategory,
}

impl From<ErrorCategory> for Classification {
    fn from(category: ErrorCategory) -> Self {
        Self {
            retryable: category.is_retryable(),
            category,
        }
    }
}

/// Classifies an error for the retry loop.
///
/// Wrapping variants (`Hook`, `RetriesExhausted`) are classified by what they are,
/// not by the error they carry: a hook that fails with a deadlock is still a hook
/// failure and is not retried.
pub fn classify(err: &Error) -> Classification {
    let category = match err {
        Error::Database(e) => classify_sqlx(e),
        Error::Backend { code, .. } => code
            .as_deref()
            .map(category_for_sqlstate)
            .unwrap_or(ErrorCategory::Unknown),
        Error::Capacity { .. } | Error::PoolClosed => ErrorCategory::Capacity,
        Error::Hook { .. } => ErrorCategory::Hook,
        Error::SavepointExists(_)
        | Error::SavepointNotFound(_)
        | Error::InvalidSavepointName(_)
        | Error::NestingDisabled => ErrorCategory::Savepoint,
        Error::Cancelled | Error::DeadlineExceeded => ErrorCategory::Cancelled,
        Error::Application(inner) => match inner.downcast_ref::<sqlx::Error>() {
            Some(e) => classify_sqlx(e),
            None => match inner.downcast_ref::<Error>() {
                Some(e) => return classify(e),
                None => ErrorCategory::Unknown,
            },
        },
        Error::SessionNotActive { .. }
        | Error::UnknownTransaction(_)
        | Error::AlreadyConsumed
        | Error::RetriesExhausted { .. }
        | Error::Cleanup(_)
        | Error::Config(_) => ErrorCategory::Unknown,
    };
    category.into()
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorCategory {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorCategory::ConnectionLoss,
        sqlx::Error::Database(db) => {
            // MySQL reports many transient conditions under the generic HY000 state,
            // so the vendor error number takes precedence.
            if let Some(mysql) = db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                if let Some(category) = category_for_mysql_number(mysql.number()) {
                    return category;
                }
            }
            db.code()
                .as_deref()
                .map(category_for_sqlstate)
                .unwrap_or(ErrorCategory::Unknown)
        }
        _ => ErrorCategory::Unknown,
    }
}

/// Maps a SQLSTATE code to a category by class (first two characters).
pub fn category_for_sqlstate(code: &str) -> ErrorCategory {
    match code {
        "40001" | "40P01" => return ErrorCategory::Conflict,
        "57014" => return ErrorCategory::QueryTimeout,
        "57P01" | "57P02" | "57P03" => return ErrorCategory::ConnectionLoss,
        _ => {}
    }
    match code.get(..2) {
        Some("08") => ErrorCategory::ConnectionLoss,
        Some("53") => ErrorCategory::ResourceExhausted,
        Some("40") => ErrorCategory::Conflict,
        Some("22") | Some("23") => ErrorCategory::Integrity,
        Some("42") | Some("28") | Some("0A") => ErrorCategory::SyntaxOrPermission,
        _ => ErrorCategory::Unknown,
    }
}

fn category_for_mysql_number(number: u16) -> Option<ErrorCategory> {
    let category = match number {
        1213 => ErrorCategory::Conflict,
        1205 | 3024 => ErrorCategory::QueryTimeout,
        1040 | 1203 | 1041 => ErrorCategory::ResourceExhausted,
        2006 | 2013 | 1927 => ErrorCategory::ConnectionLoss,
        _ => return None,
    };
    Some(category)
}

/// Exponential backoff bounded by an attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total tries is this plus one.
    pub max_retry_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransactionConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            initial_delay: config.initial_delay,
            backoff_factor: config.backoff_factor,
            max_delay: config.max_delay,
        }
    }

    /// Total number of attempts the loop may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_attempts.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransactionConfig::default())
    }
}

/// Bookkeeping for one root `execute_in_transaction` call.
#[derive(Debug, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub cumulative_delay: Duration,
    pub last_error: Option<String>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_failure(&mut self, err: &Error, delay: Duration) {
        self.cumulative_delay += delay;
        self.last_error = Some(err.to_string());
    }
}
