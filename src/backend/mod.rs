//! Backend capability consumed by the transaction core.
//!
//! The core never talks to a driver directly. It opens connections through a
//! [`Connector`], begins physical transactions on a [`Connection`], and runs
//! statements, commits and rollbacks through the resulting [`Transaction`].
//!
//! Two implementations ship with the crate:
//!
//! - [`mysql::MySqlConnector`] over an `sqlx::MySqlPool`
//! - [`memory::MemoryConnector`], an in-process recording backend for tests

use async_trait::async_trait;

use crate::config::TxOptions;
use crate::error::Result;

pub mod memory;
pub mod mysql;

/// Opens backend connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// One physical backend connection.
#[async_trait]
pub trait Connection: Send {
    /// Starts a physical transaction on this connection.
    ///
    /// The returned handle must not outlive the connection's usefulness: the pool
    /// keeps the connection bound until the transaction is committed or rolled back.
    async fn begin(&mut self, options: &TxOptions) -> Result<Box<dyn Transaction>>;

    /// Cheap liveness check used before an idle connection is reused.
    async fn ping(&mut self) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// A physical transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Executes a statement and returns the number of affected rows.
    async fn execute(&mut self, statement: &str, args: &[Value]) -> Result<u64>;

    async fn query(&mut self, statement: &str, args: &[Value]) -> Result<Vec<Row>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Driver-neutral statement argument / column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A result row with named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
