//! # sqlx-transaction-engine
//!
//! Transaction execution for SQLx with automatic retry, savepoint nesting, lifecycle
//! hooks and transaction-scoped connection pooling.
//!
//! ## Features
//!
//! - **Automatic Retry**: Deadlocks, serialization conflicts and lost connections re-run
//!   the whole transaction with exponential backoff
//! - **Nested Transactions**: Nested calls run under savepoints on the root's connection
//! - **Lifecycle Hooks**: Before-hooks can veto begin/commit/rollback; after-hooks observe
//! - **Transaction-Scoped Pooling**: One connection per logical transaction, capped, with
//!   idle reuse and reclamation
//! - **Cancellation**: Every call takes a [`CallContext`] with a cancellation token and deadline
//! - **Pluggable Backends**: MySQL through SQLx, plus an in-memory recording backend for tests
//!
//! ## Quick Start
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! sqlx = { version = "0.8", features = ["mysql", "runtime-tokio"] }
//! sqlx-transaction-engine = "0.3"
//! ```
//!
//! ## Examples
//!
//! ### Basic Transaction
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sqlx::MySqlPool;
//! use sqlx_transaction_engine::backend::mysql::MySqlConnector;
//! use sqlx_transaction_engine::{CallContext, TransactionConfig, TransactionManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = MySqlPool::connect("mysql://localhost/test").await?;
//! let manager = TransactionManager::new(
//!     Arc::new(MySqlConnector::new(pool)),
//!     TransactionConfig::default(),
//! )?;
//!
//! manager
//!     .execute_in_transaction(&CallContext::new(), |ctx, tx| {
//!         Box::pin(async move {
//!             tx.execute(ctx, "INSERT INTO users (name) VALUES (?)", &["Alice".into()])
//!                 .await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Nested Transactions
//!
//! Hand the context you were given back to the manager to nest. A failing nested call
//! only rolls back to its own savepoint:
//!
//! ```rust
//! use std::sync::Arc;
//! use sqlx_transaction_engine::backend::memory::{FailPoint, MemoryConnector};
//! use sqlx_transaction_engine::prelude::*;
//!
//! # async fn example() -> sqlx_transaction_engine::Result<()> {
//! let backend = MemoryConnector::new();
//! backend.fail_always(FailPoint::statement("INSERT INTO audit_log"), "23000", "duplicate");
//! let manager = TransactionManager::new(Arc::new(backend.clone()), TransactionConfig::default())?;
//!
//! manager
//!     .execute_in_transaction(&CallContext::new(), |ctx, tx| {
//!         let manager = manager.clone();
//!         Box::pin(async move {
//!             tx.execute(ctx, "INSERT INTO users (name) VALUES ('Bob')", &[]).await?;
//!
//!             let audit = manager
//!                 .execute_in_transaction(ctx, |ctx, nested| {
//!                     Box::pin(async move {
//!                         nested.execute(ctx, "INSERT INTO audit_log (action) VALUES ('signup')", &[]).await?;
//!                         Ok(())
//!                     })
//!                 })
//!                 .await;
//!             assert!(audit.is_err());
//!             Ok(())
//!         })
//!     })
//!     .await?;
//!
//! assert_eq!(backend.stats().commits, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ### Hooks
//!
//! ```rust
//! use std::sync::Arc;
//! use sqlx_transaction_engine::backend::memory::MemoryConnector;
//! use sqlx_transaction_engine::prelude::*;
//!
//! # fn example() -> sqlx_transaction_engine::Result<()> {
//! let manager = TransactionManager::new(
//!     Arc::new(MemoryConnector::new()),
//!     TransactionConfig::default(),
//! )?;
//!
//! manager.hooks().add_after_hook(AfterStage::Commit, |_ctx, session| {
//!     println!("committed {}", session.transaction_id());
//! });
//! # Ok(())
//! # }
//! ```
//!
//! ## How It Works
//!
//! 1. **TransactionManager**: Binds a pooled connection to a fresh transaction id,
//!    begins, runs your closure, then commits or rolls back
//! 2. **Retry**: Failures are classified by SQLSTATE / MySQL error number; transient
//!    ones re-run the closure from the top under a new transaction id
//! 3. **Sessions**: The closure receives a [`Session`] for running statements and a child
//!    [`CallContext`] that identifies it when nesting
//! 4. **Savepoints**: Nested calls share the root's physical transaction and savepoint stack
//!
//! ## Limitations
//!
//! - The bundled SQL backend is MySQL only
//! - Retried closures must be safe to run more than once
//! - Hooks run for root transactions only, not for nested calls
//!
//! ## License
//!
//! Licensed under either of Apache License, Version 2.0 or MIT license at your option.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
mod executor;
pub mod hooks;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod savepoint;
pub mod session;

#[cfg(feature = "anyhow")]
pub mod anyhow_compat;

pub use config::{IsolationLevel, TransactionConfig, TxOptions};
pub use context::CallContext;
pub use error::{Error, Result};
pub use hooks::{AfterStage, BeforeStage, Hook, HookRegistry, LifecycleStage};
pub use manager::TransactionManager;
pub use pool::{ConnectionPool, PoolStats};
pub use retry::{classify, Classification, ErrorCategory, RetryPolicy};
pub use savepoint::SavepointStack;
pub use session::{Session, SessionSnapshot, SessionState};

/// Convenience re-exports for common use cases
pub mod prelude {
    pub use crate::config::TransactionConfig;
    pub use crate::context::CallContext;
    pub use crate::error::{Error, Result};
    pub use crate::hooks::{AfterStage, BeforeStage};
    pub use crate::manager::TransactionManager;
    pub use crate::session::Session;
}
