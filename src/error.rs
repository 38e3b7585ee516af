use crate::hooks::LifecycleStage;

/// Error types for transaction management
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Error reported by a backend that is not SQLx, optionally carrying a SQLSTATE code
    #[error("Backend error{}: {message}", code_suffix(.code))]
    Backend {
        code: Option<String>,
        message: String,
    },

    /// The connection pool refused a new transaction because it is at capacity
    #[error("Connection pool at capacity ({active}/{max} transactions bound)")]
    Capacity { active: usize, max: usize },

    /// No pooled connection is bound to this transaction id
    #[error("No connection bound to transaction {0}")]
    UnknownTransaction(String),

    /// The pool has been closed and hands out no further connections
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A lifecycle hook aborted the transition
    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: LifecycleStage,
        #[source]
        source: Box<Error>,
    },

    /// A savepoint with this name is already active
    #[error("Savepoint '{0}' already exists")]
    SavepointExists(String),

    /// No active savepoint with this name
    #[error("Savepoint '{0}' not found")]
    SavepointNotFound(String),

    /// Savepoint names must be plain SQL identifiers
    #[error("Invalid savepoint name '{0}'")]
    InvalidSavepointName(String),

    /// A nested call was made while savepoints are disabled
    #[error("Nested transactions are disabled (savepoints off)")]
    NestingDisabled,

    /// The session is not in a state that allows this operation
    #[error("Session {id} is not active (state: {state})")]
    SessionNotActive { id: String, state: String },

    /// Transaction has already been consumed (committed or rolled back)
    #[error("Transaction has already been consumed")]
    AlreadyConsumed,

    /// The caller cancelled the call context
    #[error("Operation cancelled")]
    Cancelled,

    /// The call context deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The root transaction kept failing and the retry budget ran out
    #[error("Transaction failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Errors collected while tearing down a session
    #[error("{} error(s) during cleanup: {}", .0.len(), join_errors(.0))]
    Cleanup(Vec<Error>),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error raised by caller-supplied work
    #[error("Application error: {0}")]
    Application(#[source] Box<dyn std::error::Error + Send + Sync>),
}

fn code_suffix(code: &Option<String>) -> String {
    match code {
        Some(code) => format!(" [{code}]"),
        None => String::new(),
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Builds a backend error with a SQLSTATE code.
    pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Wraps an arbitrary caller error.
    pub fn application<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Application(err.into())
    }

    /// Whether the retry loop may re-run the transaction after this error.
    pub fn is_retryable(&self) -> bool {
        crate::retry::classify(self).retryable
    }

    /// Number of attempts made, if this error ended a retry loop.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub(crate) fn hook(stage: LifecycleStage, source: Error) -> Self {
        Self::Hook {
            stage,
            source: Box::new(source),
        }
    }
}

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, Error>;
