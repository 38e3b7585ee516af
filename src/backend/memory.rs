//! In-process recording backend.
//!
//! Nothing is stored: every call is recorded in an event log and counted, and
//! failures can be scripted per operation. Useful for exercising retry, hook and
//! savepoint behavior without a database server.
//!
//! # Examples
//!
//! ```rust
//! use sqlx_transaction_engine::backend::memory::{FailPoint, MemoryConnector};
//!
//! let backend = MemoryConnector::new();
//! // The first commit fails with a serialization conflict, later ones succeed.
//! backend.fail_times(FailPoint::Commit, 1, "40001", "could not serialize access");
//! assert_eq!(backend.stats().commits, 0);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Connection, Connector, Row, Transaction, Value};
use crate::config::TxOptions;
use crate::error::{Error, Result};

/// Where a scripted failure fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    Connect,
    Begin,
    Commit,
    Rollback,
    Ping,
    /// Any `execute`/`query` whose statement starts with this prefix (case-insensitive).
    Statement(String),
}

impl FailPoint {
    pub fn statement(prefix: impl Into<String>) -> Self {
        FailPoint::Statement(prefix.into())
    }

    fn matches(&self, other: &FailPoint) -> bool {
        match (self, other) {
            (FailPoint::Statement(prefix), FailPoint::Statement(stmt)) => stmt
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
            (a, b) => a == b,
        }
    }
}

#[derive(Debug)]
struct FailureRule {
    point: FailPoint,
    code: String,
    message: String,
    /// `None` fires forever.
    remaining: Option<u32>,
}

/// Counters of backend calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: u64,
    pub closes: u64,
    pub pings: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub statements: u64,
}

#[derive(Default)]
struct MemoryState {
    next_conn: AtomicU64,
    stats: Mutex<MemoryStats>,
    events: Mutex<Vec<String>>,
    rules: Mutex<Vec<FailureRule>>,
    query_results: Mutex<HashMap<String, Vec<Row>>>,
    connect_delay: Mutex<Option<Duration>>,
}

impl MemoryState {
    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        let mut rules = self.rules.lock();
        let hit = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && r.point.matches(&point));
        match hit {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                Err(Error::backend(rule.code.clone(), rule.message.clone()))
            }
            None => Ok(()),
        }
    }
}

/// Recording [`Connector`] with scriptable failures.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` calls reaching `point` with the given SQLSTATE.
    pub fn fail_times(
        &self,
        point: FailPoint,
        times: u32,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.state.rules.lock().push(FailureRule {
            point,
            code: code.into(),
            message: message.into(),
            remaining: Some(times),
        });
    }

    /// Fails every call reaching `point` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, point: FailPoint, code: impl Into<String>, message: impl Into<String>) {
        self.state.rules.lock().push(FailureRule {
            point,
            code: code.into(),
            message: message.into(),
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        self.state.rules.lock().clear();
    }

    /// Rows returned by `query` calls whose statement starts with `prefix`.
    pub fn set_query_result(&self, prefix: impl Into<String>, rows: Vec<Row>) {
        self.state.query_results.lock().insert(prefix.into(), rows);
    }

    /// Makes every `connect` sleep first, so concurrent callers interleave.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    pub fn stats(&self) -> MemoryStats {
        *self.state.stats.lock()
    }

    /// Every recorded call in order, e.g. `"begin #1"`, `"execute #1: SAVEPOINT sp_1"`.
    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().clone()
    }

    /// Statements executed or queried, without connection ids.
    pub fn statements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.split_once(": ").map(|(_, stmt)| stmt.to_string()))
            .collect()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> u64 {
        let stats = self.stats();
        stats.connects - stats.closes
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.check(FailPoint::Connect)?;
        let id = self.state.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.stats.lock().connects += 1;
        self.state.record(format!("connect #{id}"));
        Ok(Box::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<MemoryState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self, options: &TxOptions) -> Result<Box<dyn Transaction>> {
        self.state.check(FailPoint::Begin)?;
        self.state.stats.lock().begins += 1;
        let mut event = format!("begin #{}", self.id);
        if let Some(level) = options.isolation {
            event.push_str(&format!(" ({level})"));
        }
        if options.read_only {
            event.push_str(" read-only");
        }
        self.state.record(event);
        Ok(Box::new(MemoryTransaction {
            conn_id: self.id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn ping(&mut self) -> Result<()> {
        self.state.stats.lock().pings += 1;
        self.state.record(format!("ping #{}", self.id));
        self.state.check(FailPoint::Ping)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state.stats.lock().closes += 1;
        self.state.record(format!("close #{}", self.id));
        Ok(())
    }
}

struct MemoryTransaction {
    conn_id: u64,
    state: Arc<MemoryState>,
}

impl MemoryTransaction {
    fn run(&self, kind: &str, statement: &str) -> Result<()> {
        self.state
            .record(format!("{kind} #{}: {statement}", self.conn_id));
        self.state.stats.lock().statements += 1;
        self.state.check(FailPoint::Statement(statement.to_string()))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, statement: &str, _args: &[Value]) -> Result<u64> {
        self.run("execute", statement)?;
        Ok(1)
    }

    async fn query(&mut self, statement: &str, _args: &[Value]) -> Result<Vec<Row>> {
        self.run("query", statement)?;
        let results = self.state.query_results.lock();
        let rows = results
            .iter()
            .find(|(prefix, _)| FailPoint::statement(prefix.as_str()).matches(&FailPoint::statement(statement)))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.state.check(FailPoint::Commit)?;
        self.state.stats.lock().commits += 1;
        self.state.record(format!("commit #{}", self.conn_id));
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.state.check(FailPoint::Rollback)?;
        self.state.stats.lock().rollbacks += 1;
        self.state.record(format!("rollback #{}", self.conn_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_transaction_lifecycle() {
        let backend = MemoryConnector::new();
        let mut conn = backend.connect().await.unwrap();
        let mut tx = conn.begin(&TxOptions::default()).await.unwrap();
        tx.execute("INSERT INTO t VALUES (?)", &[Value::Int(1)])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(
            backend.events(),
            vec![
                "connect #1",
                "begin #1",
                "execute #1: INSERT INTO t VALUES (?)",
                "commit #1",
                "close #1",
            ]
        );
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.statements(), vec!["INSERT INTO t VALUES (?)"]);
    }

    #[tokio::test]
    async fn test_scripted_failures_fire_the_requested_number_of_times() {
        let backend = MemoryConnector::new();
        backend.fail_times(FailPoint::statement("insert"), 2, "23505", "duplicate");
        let mut conn = backend.connect().await.unwrap();
        let mut tx = conn.begin(&TxOptions::default()).await.unwrap();

        for _ in 0..2 {
            let err = tx.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap_err();
            assert!(matches!(err, Error::Backend { code: Some(ref c), .. } if c == "23505"));
        }
        assert!(tx.execute("INSERT INTO t VALUES (1)", &[]).await.is_ok());
        assert!(tx.execute("UPDATE t SET x = 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_returns_registered_rows() {
        let backend = MemoryConnector::new();
        backend.set_query_result(
            "SELECT",
            vec![Row::new(vec!["n".into()], vec![Value::Int(3)])],
        );
        let mut conn = backend.connect().await.unwrap();
        let mut tx = conn.begin(&TxOptions::default()).await.unwrap();
        let rows = tx.query("select n from t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&Value::Int(3)));
    }
}
