//! `execute_in_transaction`: the root retry loop and savepoint nesting.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::hooks::{AfterStage, BeforeStage};
use crate::manager::{ManagerInner, TransactionManager};
use crate::pool::PooledConnection;
use crate::retry::{classify, RetryContext};
use crate::session::{Session, SessionState};

impl TransactionManager {
    /// Runs `f` inside a managed transaction.
    ///
    /// `f` receives a child [`CallContext`] carrying the [`Session`] it runs in. Passing
    /// that context back into `execute_in_transaction` makes the call nested:
    ///
    /// - A **root** call (no session in `ctx`) binds a pooled connection under a fresh
    ///   transaction id, runs the `BeforeBegin` hooks, begins a transaction and runs `f`.
    ///   Success commits (`BeforeCommit`, commit, `AfterCommit`); failure rolls back
    ///   (`BeforeRollback`, rollback, `AfterRollback`). A retryable failure re-runs the
    ///   whole attempt with a new transaction id after an exponential backoff.
    /// - A **nested** call shares the root's transaction. It runs `f` under a new
    ///   savepoint, releasing it on success and rolling back to it on failure. Nested
    ///   calls never retry and do not run lifecycle hooks.
    ///
    /// Without a deadline on `ctx`, the configured `default_timeout` bounds the whole
    /// root call, retries and backoff included. Cancelling `ctx` aborts the current
    /// attempt (rolling back) and stops further retries.
    ///
    /// Because retries re-run `f` from the start, `f` must be safe to run more than
    /// once: side effects outside the transaction are the caller's responsibility.
    ///
    /// # Errors
    ///
    /// - The first attempt's error, unchanged, when it is not retryable.
    /// - [`Error::RetriesExhausted`] wrapping the last attempt's error once retries
    ///   have been made or the budget, deadline or cancellation stops the loop.
    /// - [`Error::Capacity`] when the pool has no room for another transaction.
    /// - [`Error::NestingDisabled`] for a nested call with savepoints disabled.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use sqlx_transaction_engine::backend::memory::MemoryConnector;
    /// use sqlx_transaction_engine::{CallContext, TransactionConfig, TransactionManager};
    ///
    /// # async fn example() -> sqlx_transaction_engine::Result<()> {
    /// let backend = MemoryConnector::new();
    /// let manager = TransactionManager::new(Arc::new(backend.clone()), TransactionConfig::default())?;
    ///
    /// manager
    ///     .execute_in_transaction(&CallContext::new(), |ctx, session| {
    ///         let manager = manager.clone();
    ///         Box::pin(async move {
    ///             session.execute(ctx, "INSERT INTO users (name) VALUES ('Alice')", &[]).await?;
    ///
    ///             // Failure here only undoes the audit insert.
    ///             let audited = manager
    ///                 .execute_in_transaction(ctx, |ctx, nested| {
    ///                     Box::pin(async move {
    ///                         nested.execute(ctx, "INSERT INTO audit_log (action) VALUES ('created')", &[]).await?;
    ///                         Ok(())
    ///                     })
    ///                 })
    ///                 .await;
    ///             if audited.is_err() {
    ///                 eprintln!("audit failed, user still committed");
    ///             }
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    ///
    /// assert_eq!(backend.stats().commits, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_in_transaction<F, T>(&self, ctx: &CallContext, f: F) -> Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        match ctx.session() {
            Some(parent) => {
                let parent = parent.clone();
                self.run_nested(ctx, &parent, &f).await
            }
            None => self.run_root(ctx, &f).await,
        }
    }

    async fn run_root<F, T>(&self, ctx: &CallContext, f: &F) -> Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        let inner = &self.inner;
        let default_timeout = inner.config.default_timeout;
        let ctx = if ctx.deadline().is_none() && !default_timeout.is_zero() {
            ctx.clone().with_timeout(default_timeout)
        } else {
            ctx.clone()
        };
        let max_attempts = inner.policy.max_attempts();
        let mut retry = RetryContext::new();

        loop {
            retry.attempt += 1;
            let tx_id = Uuid::new_v4().to_string();

            let attempt = self.run_attempt(&ctx, &tx_id, f);
            let outcome = if inner.config.enable_tracing {
                let span = info_span!("tx_attempt", tx_id = %tx_id, attempt = retry.attempt);
                attempt.instrument(span).await
            } else {
                attempt.await
            };

            let err = match outcome {
                Ok(value) => {
                    if retry.attempt > 1 {
                        debug!(
                            attempts = retry.attempt,
                            waited_ms = retry.cumulative_delay.as_millis() as u64,
                            "transaction succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classify(&err);
            if !class.retryable {
                debug!(attempt = retry.attempt, category = %class.category, error = %err, "transaction failed");
                return Err(exhausted(err, retry.attempt));
            }
            if retry.attempt >= max_attempts {
                warn!(attempts = retry.attempt, error = %err, "retry budget exhausted");
                return Err(exhausted(err, retry.attempt));
            }

            let delay = inner.policy.delay_for(retry.attempt);
            if ctx.remaining().is_some_and(|left| left <= delay) {
                warn!(attempts = retry.attempt, error = %err, "no time left for another attempt");
                return Err(exhausted(err, retry.attempt));
            }
            retry.record_failure(&err, delay);
            warn!(
                attempt = retry.attempt,
                category = %class.category,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying transaction"
            );
            if let Err(stop) = ctx.sleep(delay).await {
                debug!(reason = %stop, "backoff interrupted");
                return Err(exhausted(err, retry.attempt));
            }
        }
    }

    async fn run_attempt<F, T>(&self, ctx: &CallContext, tx_id: &str, f: &F) -> Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        let inner = &self.inner;
        let conn = inner.pool.acquire(ctx, tx_id, 0).await?;
        let session = Session::root(tx_id.to_string());
        let mut guard = SessionGuard::new(inner, &session);

        let result = self.drive_root(ctx, &conn, &session, f).await;

        guard.disarm();
        drop(conn);
        let released = if session.state() == SessionState::Failed {
            inner.pool.release_and_discard(tx_id).await
        } else {
            inner.pool.release(tx_id).await
        };
        if let Err(e) = released {
            warn!(transaction_id = tx_id, error = %e, "failed to release connection");
        }
        result
    }

    async fn drive_root<F, T>(
        &self,
        ctx: &CallContext,
        conn: &PooledConnection,
        session: &Session,
        f: &F,
    ) -> Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        let inner = &self.inner;
        if let Err(e) = inner.run_before(BeforeStage::Begin, ctx, session) {
            session.set_state(SessionState::RolledBack);
            return Err(e);
        }

        let tx = match conn.begin(&inner.config.tx_options).await {
            Ok(tx) => tx,
            Err(e) => {
                session.set_state(SessionState::Failed);
                return Err(e);
            }
        };
        session.physical().attach(tx).await;
        session.set_state(SessionState::Active);

        let child = ctx.with_session(session.clone());
        let outcome = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            result = f(&child, session) => result,
        };

        match outcome.and_then(|value| ctx.check().map(|()| value)) {
            Ok(value) => {
                self.commit_root(ctx, session).await?;
                Ok(value)
            }
            Err(err) => {
                self.rollback_root(ctx, session).await;
                Err(err)
            }
        }
    }

    async fn commit_root(&self, ctx: &CallContext, session: &Session) -> Result<()> {
        let inner = &self.inner;
        if let Err(e) = inner.run_before(BeforeStage::Commit, ctx, session) {
            self.rollback_root(ctx, session).await;
            return Err(e);
        }

        session.set_state(SessionState::Committing);
        if !session.savepoints().is_empty() {
            if let Err(e) = session.savepoints().cleanup_all().await {
                warn!(session_id = session.id(), error = %e, "savepoint cleanup before commit failed");
            }
        }

        let Some(tx) = session.physical().take().await else {
            session.set_state(SessionState::Failed);
            return Err(Error::AlreadyConsumed);
        };
        match tx.commit().await {
            Ok(()) => {
                session.set_state(SessionState::Committed);
                inner.run_after(AfterStage::Commit, ctx, session);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = session.id(), error = %e, "commit failed");
                session.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Best effort: failures are logged, never returned, so the error that caused
    /// the rollback is what the caller sees.
    async fn rollback_root(&self, ctx: &CallContext, session: &Session) {
        let inner = &self.inner;
        session.set_state(SessionState::RollingBack);
        if let Err(e) = inner.run_before(BeforeStage::Rollback, ctx, session) {
            warn!(session_id = session.id(), error = %e, "before_rollback hook failed, rolling back anyway");
        }

        session.savepoints().clear();
        let rolled_back = match session.physical().take().await {
            Some(tx) => tx.rollback().await,
            None => Err(Error::AlreadyConsumed),
        };
        match rolled_back {
            Ok(()) => session.set_state(SessionState::RolledBack),
            Err(e) => {
                warn!(session_id = session.id(), error = %e, "rollback failed");
                session.set_state(SessionState::Failed);
            }
        }
        inner.run_after(AfterStage::Rollback, ctx, session);
    }

    async fn run_nested<F, T>(&self, ctx: &CallContext, parent: &Session, f: &F) -> Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        let inner = &self.inner;
        if !inner.config.enable_savepoints {
            return Err(Error::NestingDisabled);
        }
        parent.ensure_active()?;

        let tx_id = parent.transaction_id();
        let conn = inner
            .pool
            .acquire(ctx, tx_id, parent.nest_level() + 1)
            .await?;
        let session = Session::nested(parent);
        let mut guard = SessionGuard::new(inner, &session);

        let nested = self.drive_nested(ctx, &session, f);
        let result = if inner.config.enable_tracing {
            let span = info_span!(
                "tx_nested",
                tx_id = %tx_id,
                session_id = %session.id(),
                nest_level = session.nest_level()
            );
            nested.instrument(span).await
        } else {
            nested.await
        };

        guard.disarm();
        drop(conn);
        if let Err(e) = inner.pool.release(tx_id).await {
            warn!(transaction_id = tx_id, error = %e, "failed to release nested connection");
        }
        result
    }

    async fn drive_nested<F, T>(&self, ctx: &CallContext, session: &Session, f: &F) -> Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        let savepoint = session.savepoint_name().unwrap_or_default().to_string();
        let savepoints = session.savepoints();
        if let Err(e) = savepoints.create(ctx, &savepoint, session.nest_level()).await {
            session.set_state(SessionState::Failed);
            return Err(e);
        }

        let child = ctx.with_session(session.clone());
        let outcome = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            result = f(&child, session) => result,
        };

        match outcome {
            Ok(value) => match savepoints.release(ctx, &savepoint).await {
                Ok(()) => {
                    session.set_state(SessionState::Committed);
                    Ok(value)
                }
                Err(e) => {
                    session.set_state(SessionState::Failed);
                    Err(e)
                }
            },
            Err(err) => {
                session.set_state(SessionState::RollingBack);
                // The caller's context may be what failed; teardown must still run.
                let teardown = CallContext::new();
                let undone = match savepoints.rollback_to(&teardown, &savepoint).await {
                    Ok(()) => savepoints.release(&teardown, &savepoint).await,
                    Err(e) => Err(e),
                };
                match undone {
                    Ok(()) => session.set_state(SessionState::RolledBack),
                    Err(e) => {
                        warn!(savepoint = %savepoint, error = %e, "failed to undo nested savepoint");
                        session.set_state(SessionState::Failed);
                    }
                }
                Err(err)
            }
        }
    }
}

/// Wraps the final error of a root call once more than one attempt was made, or
/// when a retryable error could not be retried.
fn exhausted(err: Error, attempts: u32) -> Error {
    if attempts == 1 && !err.is_retryable() {
        return err;
    }
    Error::RetriesExhausted {
        attempts,
        source: Box::new(err),
    }
}

/// Keeps a session registered with the manager while it runs.
///
/// If the call's future is dropped before teardown, the pool binding is released
/// and the connection discarded, since it may hold an open transaction.
struct SessionGuard<'a> {
    inner: &'a ManagerInner,
    session_id: String,
    transaction_id: String,
    armed: bool,
}

impl<'a> SessionGuard<'a> {
    fn new(inner: &'a ManagerInner, session: &Session) -> Self {
        inner.register(session);
        Self {
            inner,
            session_id: session.id().to_string(),
            transaction_id: session.transaction_id().to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.inner.unregister(&self.session_id);
        if self.armed {
            warn!(
                session_id = %self.session_id,
                transaction_id = %self.transaction_id,
                "transaction abandoned before completion"
            );
            self.inner.pool.release_detached(&self.transaction_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{FailPoint, MemoryConnector};
    use crate::config::TransactionConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(backend: &MemoryConnector, config: TransactionConfig) -> TransactionManager {
        TransactionManager::new(Arc::new(backend.clone()), config).unwrap()
    }

    #[tokio::test]
    async fn test_root_session_is_visible_while_running() {
        let backend = MemoryConnector::new();
        let manager = manager(&backend, TransactionConfig::default());
        let observer = manager.clone();

        let seen = manager
            .execute_in_transaction(&CallContext::new(), |_ctx, session| {
                let observer = observer.clone();
                let id = session.id().to_string();
                Box::pin(async move {
                    let running = observer.active_transactions();
                    assert_eq!(running.len(), 1);
                    assert_eq!(running[0].id, id);
                    assert_eq!(running[0].state, SessionState::Active);
                    Ok(running.len())
                })
            })
            .await
            .unwrap();

        assert_eq!(seen, 1);
        assert!(manager.active_transactions().is_empty());
        assert_eq!(manager.connection_stats().bound_transactions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_bounds_root_call() {
        let backend = MemoryConnector::new();
        let manager = manager(
            &backend,
            TransactionConfig::default().with_default_timeout(Duration::from_millis(50)),
        );

        let err = manager
            .execute_in_transaction(&CallContext::new(), |_ctx, _session| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(backend.stats().rollbacks, 1);
        assert_eq!(backend.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_zero_default_timeout_means_no_deadline() {
        let backend = MemoryConnector::new();
        let manager = manager(
            &backend,
            TransactionConfig::default().with_default_timeout(Duration::ZERO),
        );

        let deadline = manager
            .execute_in_transaction(&CallContext::new(), |ctx, _session| {
                let deadline = ctx.deadline();
                Box::pin(async move { Ok(deadline) })
            })
            .await
            .unwrap();

        assert_eq!(deadline, None);
        assert_eq!(backend.stats().begins, 1);
        assert_eq!(backend.stats().commits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_releases_binding() {
        let backend = MemoryConnector::new();
        let manager = manager(&backend, TransactionConfig::default());

        let root = CallContext::new();
        let call = manager.execute_in_transaction(&root, |_ctx, _session| {
            Box::pin(async move {
                std::future::pending::<()>().await;
                Ok(())
            })
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), call).await;

        assert!(timed_out.is_err());
        assert!(manager.active_transactions().is_empty());
        let stats = manager.connection_stats();
        assert_eq!(stats.bound_transactions, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[tokio::test]
    async fn test_begin_failure_discards_connection() {
        let backend = MemoryConnector::new();
        backend.fail_times(FailPoint::Begin, 1, "42000", "access denied");
        let manager = manager(&backend, TransactionConfig::default());

        let err = manager
            .execute_in_transaction(&CallContext::new(), |_ctx, _session| {
                Box::pin(async move { Ok(()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Backend { .. }));
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(manager.connection_stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_tracing_spans_do_not_change_outcome() {
        let backend = MemoryConnector::new();
        let manager = manager(&backend, TransactionConfig::default().with_tracing(true));
        let nested_manager = manager.clone();

        manager
            .execute_in_transaction(&CallContext::new(), |ctx, _session| {
                let nested_manager = nested_manager.clone();
                Box::pin(async move {
                    nested_manager
                        .execute_in_transaction(ctx, |ctx, nested| {
                            Box::pin(async move {
                                nested.execute(ctx, "UPDATE t SET x = 1", &[]).await?;
                                Ok(())
                            })
                        })
                        .await
                })
            })
            .await
            .unwrap();

        assert_eq!(backend.stats().commits, 1);
    }

    #[test]
    fn test_single_fatal_attempt_is_not_wrapped() {
        let err = exhausted(Error::backend("23505", "duplicate"), 1);
        assert!(matches!(err, Error::Backend { .. }));

        let err = exhausted(Error::backend("40001", "conflict"), 1);
        assert_eq!(err.attempts(), Some(1));

        let err = exhausted(Error::backend("23505", "duplicate"), 3);
        assert_eq!(err.attempts(), Some(3));
    }
}
