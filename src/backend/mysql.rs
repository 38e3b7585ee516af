//! MySQL backend over an `sqlx::MySqlPool`.
//!
//! Each pooled connection wraps one `PoolConnection<MySql>` checked out of the SQLx
//! pool for as long as the transaction-scoped pool keeps it bound. Transactions are
//! driven with plain `START TRANSACTION` / `COMMIT` / `ROLLBACK` statements so the
//! transaction handle can share the connection with nested savepoint work. Since
//! SQLx never sees those transactions, a checked-out connection is never handed
//! back to the SQLx pool: it is closed on `close` and on drop alike.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlArguments, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Executor, MySqlPool, Row as _};
use tokio::sync::Mutex;

use super::{Connection, Connector, Row, Transaction, Value};
use crate::config::TxOptions;
use crate::error::{Error, Result};

type SharedConn = Arc<Mutex<PoolConnection<MySql>>>;

/// Opens connections by checking them out of an SQLx MySQL pool.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sqlx::MySqlPool;
/// use sqlx_transaction_engine::backend::mysql::MySqlConnector;
/// use sqlx_transaction_engine::{TransactionConfig, TransactionManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MySqlPool::connect("mysql://localhost/test").await?;
/// let manager = TransactionManager::new(
///     Arc::new(MySqlConnector::new(pool)),
///     TransactionConfig::default(),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MySqlConnector {
    pool: MySqlPool,
}

impl MySqlConnector {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut conn = self.pool.acquire().await?;
        // Dropped mid-transaction, it must not reach the next SQLx pool user.
        conn.close_on_drop();
        Ok(Box::new(MySqlConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

struct MySqlConnection {
    conn: SharedConn,
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn begin(&mut self, options: &TxOptions) -> Result<Box<dyn Transaction>> {
        {
            let mut conn = self.conn.lock().await;
            if let Some(level) = options.isolation {
                let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
                (&mut **conn).execute(sql.as_str()).await?;
            }
            let start = if options.read_only {
                "START TRANSACTION READ ONLY"
            } else {
                "START TRANSACTION"
            };
            (&mut **conn).execute(start).await?;
        }
        Ok(Box::new(MySqlTransaction {
            conn: Arc::clone(&self.conn),
        }))
    }

    async fn ping(&mut self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.ping().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        match Arc::try_unwrap(self.conn) {
            // Detaching closes the socket instead of returning it to the SQLx pool.
            Ok(conn) => conn.into_inner().detach().close().await?,
            Err(_) => {
                return Err(Error::Backend {
                    code: None,
                    message: "connection still referenced by an open transaction".into(),
                })
            }
        }
        Ok(())
    }
}

struct MySqlTransaction {
    conn: SharedConn,
}

fn bind_args<'q>(statement: &'q str, args: &[Value]) -> Query<'q, MySql, MySqlArguments> {
    let mut query = sqlx::query(statement);
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Bytes(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_row(row: &MySqlRow) -> Row {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..columns.len()).map(|i| decode_column(row, i)).collect();
    Row::new(columns, values)
}

fn decode_column(row: &MySqlRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    Value::Null
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn execute(&mut self, statement: &str, args: &[Value]) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let result = bind_args(statement, args).execute(&mut **conn).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, statement: &str, args: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.conn.lock().await;
        let rows = bind_args(statement, args).fetch_all(&mut **conn).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut conn = self.conn.lock().await;
        (&mut **conn).execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut conn = self.conn.lock().await;
        (&mut **conn).execute("ROLLBACK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::mysql::MySqlPoolOptions;

    use super::*;

    #[test]
    fn test_bind_args_accepts_every_value_kind() {
        let args = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(1),
            Value::Float(1.5),
            Value::from("text"),
            Value::Bytes(vec![1, 2]),
        ];
        let query = bind_args("SELECT ?, ?, ?, ?, ?, ?", &args);
        assert_eq!(sqlx::Execute::sql(&query), "SELECT ?, ?, ?, ?, ?, ?");
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server at DATABASE_URL"]
    async fn test_abandoned_transaction_never_returns_to_sqlx_pool() {
        dotenvy::dotenv().ok();
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        let connector = MySqlConnector::new(pool.clone());

        let mut conn = connector.connect().await.unwrap();
        let mut tx = conn.begin(&TxOptions::default()).await.unwrap();
        tx.execute("SELECT 1", &[]).await.unwrap();
        drop(tx);
        drop(conn);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.size(), 0);
    }
}
