//! The transaction manager: shared state behind `execute_in_transaction`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Connector;
use crate::config::TransactionConfig;
use crate::context::CallContext;
use crate::error::Result;
use crate::hooks::{AfterStage, BeforeStage, HookRegistry};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionSnapshot};

/// Runs caller work inside managed transactions.
///
/// Cheap to clone; clones share the pool, hooks and session registry. See
/// [`execute_in_transaction`](Self::execute_in_transaction) for the execution model.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sqlx::MySqlPool;
/// use sqlx_transaction_engine::backend::mysql::MySqlConnector;
/// use sqlx_transaction_engine::{CallContext, TransactionConfig, TransactionManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MySqlPool::connect("mysql://localhost/test").await?;
/// let manager = TransactionManager::new(
///     Arc::new(MySqlConnector::new(pool)),
///     TransactionConfig::default().with_max_retry_attempts(5),
/// )?;
///
/// manager
///     .execute_in_transaction(&CallContext::new(), |ctx, tx| {
///         Box::pin(async move {
///             tx.execute(ctx, "UPDATE accounts SET balance = balance - 10 WHERE id = ?", &[1.into()])
///                 .await?;
///             tx.execute(ctx, "UPDATE accounts SET balance = balance + 10 WHERE id = ?", &[2.into()])
///                 .await?;
///             Ok(())
///         })
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransactionManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(crate) config: TransactionConfig,
    pub(crate) policy: RetryPolicy,
    pub(crate) pool: Arc<ConnectionPool>,
    hooks: HookRegistry,
    /// Sessions currently running, root and nested, keyed by session id.
    sessions: RwLock<HashMap<String, Session>>,
}

impl TransactionManager {
    /// Creates a manager that opens connections through `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration is invalid.
    pub fn new(connector: Arc<dyn Connector>, config: TransactionConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(connector, PoolConfig::from(&config)));
        Ok(Self {
            inner: Arc::new(ManagerInner {
                policy: RetryPolicy::from_config(&config),
                config,
                pool,
                hooks: HookRegistry::new(),
                sessions: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Global hooks, run before any session-scoped hooks for the same stage.
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// The transaction-scoped connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Snapshots of running sessions, oldest first, parents before children.
    pub fn active_transactions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .inner
            .sessions
            .read()
            .values()
            .map(Session::snapshot)
            .collect();
        snapshots.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.nest_level.cmp(&b.nest_level))
        });
        snapshots
    }

    pub fn connection_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl ManagerInner {
    pub(crate) fn register(&self, session: &Session) {
        self.sessions
            .write()
            .insert(session.id().to_string(), session.clone());
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    pub(crate) fn run_before(
        &self,
        stage: BeforeStage,
        ctx: &CallContext,
        session: &Session,
    ) -> Result<()> {
        self.hooks.run_before(stage, ctx, session)?;
        session.hooks().run_before(stage, ctx, session)
    }

    pub(crate) fn run_after(&self, stage: AfterStage, ctx: &CallContext, session: &Session) {
        self.hooks.run_after(stage, ctx, session);
        session.hooks().run_after(stage, ctx, session);
    }
}
