//! Named savepoints on one physical transaction.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::session::PhysicalTransaction;

/// One active savepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointEntry {
    pub name: String,
    pub created_by_nest_level: u32,
}

/// Ordered set of active savepoints, shared by a root session and its nested sessions.
///
/// Names are unique within a stack. Rolling back to or releasing a savepoint drops
/// every savepoint created after it, as the backend does. Statements are issued without holding the list lock;
/// a stack is only ever driven by the single task running its root attempt.
pub struct SavepointStack {
    tx: Arc<PhysicalTransaction>,
    entries: Mutex<Vec<SavepointEntry>>,
}

impl SavepointStack {
    pub(crate) fn new(tx: Arc<PhysicalTransaction>) -> Self {
        Self {
            tx,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Issues `SAVEPOINT name` and records it.
    ///
    /// # Errors
    ///
    /// [`Error::SavepointExists`] if the name is already active,
    /// [`Error::InvalidSavepointName`] if it is not a plain identifier, or the
    /// backend error if the statement fails.
    pub async fn create(&self, ctx: &CallContext, name: &str, nest_level: u32) -> Result<()> {
        validate_name(name)?;
        if self.position(name).is_some() {
            return Err(Error::SavepointExists(name.to_string()));
        }
        ctx.check()?;
        self.tx.execute(&format!("SAVEPOINT {name}"), &[]).await?;
        self.entries.lock().push(SavepointEntry {
            name: name.to_string(),
            created_by_nest_level: nest_level,
        });
        debug!(savepoint = name, nest_level, "savepoint created");
        Ok(())
    }

    /// Issues `ROLLBACK TO SAVEPOINT name`. The savepoint stays active; every
    /// savepoint created after it is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::SavepointNotFound`] if the name is not active, or the backend error.
    pub async fn rollback_to(&self, ctx: &CallContext, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.position(name).is_none() {
            return Err(Error::SavepointNotFound(name.to_string()));
        }
        ctx.check()?;
        self.tx
            .execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.name == name) {
            entries.truncate(pos + 1);
        }
        debug!(savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    /// Issues `RELEASE SAVEPOINT name` and forgets it along with every savepoint
    /// created after it. Earlier savepoints stay active.
    ///
    /// # Errors
    ///
    /// [`Error::SavepointNotFound`] if the name is not active, or the backend error.
    pub async fn release(&self, ctx: &CallContext, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.position(name).is_none() {
            return Err(Error::SavepointNotFound(name.to_string()));
        }
        ctx.check()?;
        self.tx
            .execute(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await?;
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.name == name) {
            entries.truncate(pos);
        }
        debug!(savepoint = name, "savepoint released");
        Ok(())
    }

    /// Releases every remaining savepoint, most recent first.
    ///
    /// Keeps going past individual failures; the stack is empty afterwards.
    ///
    /// # Errors
    ///
    /// [`Error::Cleanup`] carrying every failure.
    pub async fn cleanup_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let mut entries = self.entries.lock();
            entries.drain(..).rev().map(|e| e.name).collect()
        };
        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self
                .tx
                .execute(&format!("RELEASE SAVEPOINT {name}"), &[])
                .await
            {
                warn!(savepoint = %name, error = %e, "failed to release savepoint during cleanup");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(errors))
        }
    }

    /// Forgets all savepoints without issuing statements, after the whole
    /// transaction has been rolled back or committed.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name.clone()).collect()
    }

    pub fn entries(&self) -> Vec<SavepointEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.name == name)
    }
}

/// Savepoint names are spliced into SQL, so only plain identifiers are accepted.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 64;
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSavepointName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{FailPoint, MemoryConnector};
    use crate::backend::Connector;
    use crate::config::TxOptions;

    async fn stack() -> (MemoryConnector, SavepointStack) {
        let backend = MemoryConnector::new();
        let mut conn = backend.connect().await.unwrap();
        let tx = conn.begin(&TxOptions::default()).await.unwrap();
        let stack = SavepointStack::new(Arc::new(PhysicalTransaction::new(tx)));
        (backend, stack)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let (backend, stack) = stack().await;
        let ctx = CallContext::new();
        stack.create(&ctx, "a", 1).await.unwrap();
        let err = stack.create(&ctx, "a", 2).await.unwrap_err();
        assert!(matches!(err, Error::SavepointExists(name) if name == "a"));
        assert_eq!(backend.statements(), vec!["SAVEPOINT a"]);
    }

    #[tokio::test]
    async fn test_rollback_to_pops_later_savepoints() {
        let (backend, stack) = stack().await;
        let ctx = CallContext::new();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            stack.create(&ctx, name, i as u32 + 1).await.unwrap();
        }
        stack.rollback_to(&ctx, "b").await.unwrap();
        assert_eq!(stack.names(), vec!["a", "b"]);
        assert!(backend
            .statements()
            .contains(&"ROLLBACK TO SAVEPOINT b".to_string()));

        let err = stack.rollback_to(&ctx, "c").await.unwrap_err();
        assert!(matches!(err, Error::SavepointNotFound(_)));
    }

    #[tokio::test]
    async fn test_release_pops_later_savepoints() {
        let (_backend, stack) = stack().await;
        let ctx = CallContext::new();
        stack.create(&ctx, "a", 1).await.unwrap();
        stack.create(&ctx, "b", 2).await.unwrap();
        stack.create(&ctx, "c", 3).await.unwrap();
        stack.release(&ctx, "b").await.unwrap();
        assert_eq!(stack.names(), vec!["a"]);
        for gone in ["b", "c"] {
            assert!(matches!(
                stack.release(&ctx, gone).await,
                Err(Error::SavepointNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_cleanup_after_release_skips_dropped_savepoints() {
        let (backend, stack) = stack().await;
        let ctx = CallContext::new();
        stack.create(&ctx, "a", 1).await.unwrap();
        stack.create(&ctx, "b", 1).await.unwrap();
        stack.release(&ctx, "a").await.unwrap();
        assert!(stack.is_empty());
        assert!(!stack.contains("b"));

        stack.cleanup_all().await.unwrap();
        assert_eq!(
            backend.statements(),
            vec!["SAVEPOINT a", "SAVEPOINT b", "RELEASE SAVEPOINT a"]
        );
    }

    #[tokio::test]
    async fn test_backend_failure_leaves_stack_unchanged() {
        let (backend, stack) = stack().await;
        backend.fail_times(FailPoint::statement("SAVEPOINT"), 1, "08006", "connection lost");
        let err = stack.create(&CallContext::new(), "a", 1).await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_releases_in_reverse_and_collects_errors() {
        let (backend, stack) = stack().await;
        let ctx = CallContext::new();
        for name in ["a", "b", "c"] {
            stack.create(&ctx, name, 1).await.unwrap();
        }
        backend.fail_times(FailPoint::statement("RELEASE SAVEPOINT b"), 1, "HY000", "nope");

        let err = stack.cleanup_all().await.unwrap_err();
        assert!(matches!(err, Error::Cleanup(ref errors) if errors.len() == 1));
        assert!(stack.is_empty());

        let releases: Vec<String> = backend
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("RELEASE"))
            .collect();
        assert_eq!(
            releases,
            vec![
                "RELEASE SAVEPOINT c",
                "RELEASE SAVEPOINT b",
                "RELEASE SAVEPOINT a"
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_non_identifier_names() {
        let (backend, stack) = stack().await;
        let err = stack
            .create(&CallContext::new(), "x; DROP TABLE users", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSavepointName(_)));
        assert!(backend.statements().is_empty());
    }
}
