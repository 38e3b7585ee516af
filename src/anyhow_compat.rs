use crate::context::CallContext;
use crate::error::Error;
use crate::manager::TransactionManager;
use crate::session::Session;
use std::future::Future;
use std::pin::Pin;

impl TransactionManager {
    /// Runs `f` in a managed transaction, using `anyhow::Error` for error handling.
    ///
    /// A convenience wrapper around
    /// [`execute_in_transaction`](TransactionManager::execute_in_transaction) for
    /// closures returning `anyhow::Result<T>`. Errors raised by `f` keep their
    /// classification: an `anyhow::Error` wrapping a crate [`Error`] or a
    /// `sqlx::Error` is unwrapped first, so a deadlock reported through `anyhow`
    /// is still retried.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use sqlx::MySqlPool;
    /// use sqlx_transaction_engine::backend::mysql::MySqlConnector;
    /// use sqlx_transaction_engine::{CallContext, TransactionConfig, TransactionManager};
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// # let pool = MySqlPool::connect("mysql://localhost/test").await?;
    /// let manager = TransactionManager::new(
    ///     Arc::new(MySqlConnector::new(pool)),
    ///     TransactionConfig::default(),
    /// )?;
    ///
    /// manager
    ///     .execute_in_transaction_anyhow(&CallContext::new(), |ctx, tx| {
    ///         Box::pin(async move {
    ///             let name = std::env::var("USER_NAME")?;
    ///             tx.execute(ctx, "INSERT INTO users (name) VALUES (?)", &[name.into()])
    ///                 .await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_in_transaction_anyhow<F, T>(
        &self,
        ctx: &CallContext,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: for<'a> Fn(
                &'a CallContext,
                &'a Session,
            ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>
            + Send
            + Sync,
        T: Send,
    {
        let f = &f;
        self.execute_in_transaction(ctx, move |ctx, session| {
            let work = f(ctx, session);
            Box::pin(async move { work.await.map_err(from_anyhow) })
        })
        .await
        .map_err(anyhow::Error::from)
    }
}

/// Recovers a typed error from `anyhow`, falling back to [`Error::Application`].
pub fn from_anyhow(err: anyhow::Error) -> Error {
    let err = match err.downcast::<Error>() {
        Ok(err) => return err,
        Err(err) => err,
    };
    match err.downcast::<sqlx::Error>() {
        Ok(err) => Error::Database(err),
        Err(err) => Error::Application(err.into()),
    }
}
