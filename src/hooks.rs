//! Lifecycle hooks.
//!
//! Before-hooks may veto a transition by returning an error; after-hooks only
//! observe. The two kinds live in separate collections keyed by separate stage
//! enums, so an after-hook with an error path cannot be registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::session::Session;

/// Every point in a root transaction's life where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    BeforeBegin,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStage::BeforeBegin => "before_begin",
            LifecycleStage::BeforeCommit => "before_commit",
            LifecycleStage::AfterCommit => "after_commit",
            LifecycleStage::BeforeRollback => "before_rollback",
            LifecycleStage::AfterRollback => "after_rollback",
        };
        f.write_str(s)
    }
}

/// Stages whose hooks can abort the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeforeStage {
    Begin,
    Commit,
    Rollback,
}

/// Stages whose hooks are observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AfterStage {
    Commit,
    Rollback,
}

impl From<BeforeStage> for LifecycleStage {
    fn from(stage: BeforeStage) -> Self {
        match stage {
            BeforeStage::Begin => LifecycleStage::BeforeBegin,
            BeforeStage::Commit => LifecycleStage::BeforeCommit,
            BeforeStage::Rollback => LifecycleStage::BeforeRollback,
        }
    }
}

impl From<AfterStage> for LifecycleStage {
    fn from(stage: AfterStage) -> Self {
        match stage {
            AfterStage::Commit => LifecycleStage::AfterCommit,
            AfterStage::Rollback => LifecycleStage::AfterRollback,
        }
    }
}

pub type BeforeHook = Arc<dyn Fn(&CallContext, &Session) -> Result<()> + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&CallContext, &Session) + Send + Sync>;

/// A hook tagged with the stage it belongs to.
#[derive(Clone)]
pub enum Hook {
    Before(BeforeStage, BeforeHook),
    After(AfterStage, AfterHook),
}

impl Hook {
    pub fn stage(&self) -> LifecycleStage {
        match self {
            Hook::Before(stage, _) => (*stage).into(),
            Hook::After(stage, _) => (*stage).into(),
        }
    }
}

/// Ordered hook lists per stage.
///
/// Hooks run in registration order. Lists are snapshotted before running, so a
/// hook may register further hooks without deadlocking; those take effect on the
/// next run.
///
/// # Examples
///
/// ```rust
/// use sqlx_transaction_engine::hooks::{AfterStage, BeforeStage, HookRegistry};
///
/// let hooks = HookRegistry::new();
/// hooks.add_before_hook(BeforeStage::Commit, |_ctx, session| {
///     println!("committing {}", session.transaction_id());
///     Ok(())
/// });
/// hooks.add_after_hook(AfterStage::Rollback, |_ctx, session| {
///     println!("rolled back {}", session.transaction_id());
/// });
/// assert_eq!(hooks.len(), 2);
/// ```
#[derive(Default)]
pub struct HookRegistry {
    before: RwLock<HashMap<BeforeStage, Vec<BeforeHook>>>,
    after: RwLock<HashMap<AfterStage, Vec<AfterHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&self, hook: Hook) {
        match hook {
            Hook::Before(stage, f) => self.before.write().entry(stage).or_default().push(f),
            Hook::After(stage, f) => self.after.write().entry(stage).or_default().push(f),
        }
    }

    pub fn add_before_hook<F>(&self, stage: BeforeStage, f: F)
    where
        F: Fn(&CallContext, &Session) -> Result<()> + Send + Sync + 'static,
    {
        self.add_hook(Hook::Before(stage, Arc::new(f)));
    }

    pub fn add_after_hook<F>(&self, stage: AfterStage, f: F)
    where
        F: Fn(&CallContext, &Session) + Send + Sync + 'static,
    {
        self.add_hook(Hook::After(stage, Arc::new(f)));
    }

    /// Runs before-hooks for `stage`, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Hook`] wrapping the failing hook's error.
    pub fn run_before(&self, stage: BeforeStage, ctx: &CallContext, session: &Session) -> Result<()> {
        let hooks = self.before.read().get(&stage).cloned().unwrap_or_default();
        for hook in hooks {
            hook(ctx, session).map_err(|e| Error::hook(stage.into(), e))?;
        }
        Ok(())
    }

    pub fn run_after(&self, stage: AfterStage, ctx: &CallContext, session: &Session) {
        let hooks = self.after.read().get(&stage).cloned().unwrap_or_default();
        for hook in hooks {
            hook(ctx, session);
        }
    }

    /// Number of hooks registered for a stage.
    pub fn count(&self, stage: LifecycleStage) -> usize {
        let before = |s| self.before.read().get(&s).map_or(0, Vec::len);
        let after = |s| self.after.read().get(&s).map_or(0, Vec::len);
        match stage {
            LifecycleStage::BeforeBegin => before(BeforeStage::Begin),
            LifecycleStage::BeforeCommit => before(BeforeStage::Commit),
            LifecycleStage::BeforeRollback => before(BeforeStage::Rollback),
            LifecycleStage::AfterCommit => after(AfterStage::Commit),
            LifecycleStage::AfterRollback => after(AfterStage::Rollback),
        }
    }

    pub fn len(&self) -> usize {
        self.before.read().values().map(Vec::len).sum::<usize>()
            + self.after.read().values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.before.write().clear();
        self.after.write().clear();
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("len", &self.len())
            .finish()
    }
}
