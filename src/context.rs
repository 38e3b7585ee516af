use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::session::Session;

/// Cancellable call context threaded through every transaction operation.
///
/// Besides cancellation and an optional deadline, the context carries the session
/// the caller is currently running in. Work passed to
/// [`TransactionManager::execute_in_transaction`](crate::TransactionManager::execute_in_transaction)
/// receives a child context carrying its own session; handing that context back to
/// the manager is what makes a call nested. There is no implicit lookup.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use sqlx_transaction_engine::CallContext;
///
/// let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
/// assert!(ctx.session().is_none());
/// assert!(ctx.check().is_ok());
///
/// ctx.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    session: Option<Session>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an existing token, e.g. one tied to a request or shutdown signal.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets the deadline to `now + timeout`, keeping an earlier existing deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping an earlier existing deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub(crate) fn with_session(&self, session: Session) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            session: Some(session),
        }
    }

    /// The session this context runs in, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails if the context is cancelled or past its deadline.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] or [`Error::DeadlineExceeded`].
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_expired() {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes, yielding the
    /// corresponding error. Never resolves for a context with neither.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Error::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                Error::Cancelled
            }
        }
    }

    /// Sleeps for `delay` unless the context finishes first.
    pub(crate) async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            err = self.done() => Err(err),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}
