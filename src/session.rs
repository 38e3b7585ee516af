//! Managed transaction sessions.
//!
//! A root session (nest level 0) owns the physical backend transaction. Nested
//! sessions share the root's transaction, savepoint stack and session hooks, and
//! each owns exactly one savepoint.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Row, Transaction, Value};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::hooks::HookRegistry;
use crate::savepoint::SavepointStack;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Pending,
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::RolledBack | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Committing => "committing",
            SessionState::Committed => "committed",
            SessionState::RollingBack => "rolling_back",
            SessionState::RolledBack => "rolled_back",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of a session's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: String,
    pub transaction_id: String,
    pub nest_level: u32,
    pub parent_id: Option<String>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub savepoints: usize,
}

/// The backend transaction handle shared by a root session and its nested sessions.
///
/// Empty until the root begins, and again once it has been committed or rolled back.
pub(crate) struct PhysicalTransaction {
    tx: tokio::sync::Mutex<Option<Box<dyn Transaction>>>,
}

impl PhysicalTransaction {
    pub(crate) fn new(tx: Box<dyn Transaction>) -> Self {
        Self {
            tx: tokio::sync::Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            tx: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn attach(&self, tx: Box<dyn Transaction>) {
        *self.tx.lock().await = Some(tx);
    }

    pub(crate) async fn take(&self) -> Option<Box<dyn Transaction>> {
        self.tx.lock().await.take()
    }

    pub(crate) async fn execute(&self, statement: &str, args: &[Value]) -> Result<u64> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(Error::AlreadyConsumed)?;
        tx.execute(statement, args).await
    }

    pub(crate) async fn query(&self, statement: &str, args: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(Error::AlreadyConsumed)?;
        tx.query(statement, args).await
    }
}

struct SessionInner {
    id: String,
    transaction_id: String,
    nest_level: u32,
    parent_id: Option<String>,
    savepoint: Option<String>,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    tx: Arc<PhysicalTransaction>,
    savepoints: Arc<SavepointStack>,
    hooks: Arc<HookRegistry>,
}

/// Handle through which caller work runs statements inside a managed transaction.
///
/// Cheap to clone; clones refer to the same session.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use sqlx_transaction_engine::backend::memory::MemoryConnector;
/// use sqlx_transaction_engine::{CallContext, TransactionConfig, TransactionManager};
///
/// # async fn example() -> sqlx_transaction_engine::Result<()> {
/// let manager = TransactionManager::new(
///     Arc::new(MemoryConnector::new()),
///     TransactionConfig::default(),
/// )?;
///
/// manager
///     .execute_in_transaction(&CallContext::new(), |ctx, session| {
///         Box::pin(async move {
///             assert_eq!(session.nest_level(), 0);
///             session
///                 .execute(ctx, "INSERT INTO users (name) VALUES (?)", &["Alice".into()])
///                 .await?;
///             Ok(())
///         })
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A root session in the `Pending` state, not yet holding a transaction.
    pub(crate) fn root(transaction_id: String) -> Self {
        let tx = Arc::new(PhysicalTransaction::empty());
        Self {
            inner: Arc::new(SessionInner {
                id: transaction_id.clone(),
                transaction_id,
                nest_level: 0,
                parent_id: None,
                savepoint: None,
                started_at: Utc::now(),
                state: Mutex::new(SessionState::Pending),
                savepoints: Arc::new(SavepointStack::new(Arc::clone(&tx))),
                tx,
                hooks: Arc::new(HookRegistry::new()),
            }),
        }
    }

    /// An active child of `parent` sharing its transaction.
    pub(crate) fn nested(parent: &Session) -> Self {
        let id = Uuid::new_v4();
        let p = &parent.inner;
        Self {
            inner: Arc::new(SessionInner {
                id: id.to_string(),
                transaction_id: p.transaction_id.clone(),
                nest_level: p.nest_level + 1,
                parent_id: Some(p.id.clone()),
                savepoint: Some(format!("sp_{}", id.simple())),
                started_at: Utc::now(),
                state: Mutex::new(SessionState::Active),
                tx: Arc::clone(&p.tx),
                savepoints: Arc::clone(&p.savepoints),
                hooks: Arc::clone(&p.hooks),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: &str) -> Self {
        Self::root(id.to_string())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Identity of the root transaction; the pool key shared by nested sessions.
    pub fn transaction_id(&self) -> &str {
        &self.inner.transaction_id
    }

    pub fn nest_level(&self) -> u32 {
        self.inner.nest_level
    }

    pub fn is_root(&self) -> bool {
        self.inner.nest_level == 0
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent_id.as_deref()
    }

    /// The savepoint this nested session runs under.
    pub fn savepoint_name(&self) -> Option<&str> {
        self.inner.savepoint.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Hooks scoped to this root transaction, run after the manager's global hooks.
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn savepoints(&self) -> &SavepointStack {
        &self.inner.savepoints
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.inner.id.clone(),
            transaction_id: self.inner.transaction_id.clone(),
            nest_level: self.inner.nest_level,
            parent_id: self.inner.parent_id.clone(),
            state: self.state(),
            started_at: self.inner.started_at,
            savepoints: self.inner.savepoints.len(),
        }
    }

    /// Executes a statement in the session's transaction, returning affected rows.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotActive`] outside the `Active` state, the context's
    /// cancellation error, or the backend error.
    pub async fn execute(&self, ctx: &CallContext, statement: &str, args: &[Value]) -> Result<u64> {
        self.ensure_active()?;
        ctx.check()?;
        self.inner.tx.execute(statement, args).await
    }

    /// Runs a query in the session's transaction.
    pub async fn query(&self, ctx: &CallContext, statement: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.ensure_active()?;
        ctx.check()?;
        self.inner.tx.query(statement, args).await
    }

    pub async fn create_savepoint(&self, ctx: &CallContext, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.inner
            .savepoints
            .create(ctx, name, self.inner.nest_level)
            .await
    }

    pub async fn rollback_to_savepoint(&self, ctx: &CallContext, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.inner.savepoints.rollback_to(ctx, name).await
    }

    pub async fn release_savepoint(&self, ctx: &CallContext, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.inner.savepoints.release(ctx, name).await
    }

    pub(crate) fn physical(&self) -> &Arc<PhysicalTransaction> {
        &self.inner.tx
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = self.inner.state.lock();
        let from = *current;
        debug!(session_id = %self.inner.id, %from, to = %state, "session state");
        *current = state;
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            state => Err(Error::SessionNotActive {
                id: self.inner.id.clone(),
                state: state.to_string(),
            }),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("transaction_id", &self.inner.transaction_id)
            .field("nest_level", &self.inner.nest_level)
            .field("state", &self.state())
            .finish()
    }
}
