// ============================================================================
// Driver Boundary
// ============================================================================
//
// The data access core never speaks a wire protocol itself. A `Driver` opens
// `Connection`s by DSN; connections prepare `Statement`s and run queries that
// yield a `Cursor` over raw driver values. Backends, pooling and the
// prepared-statement cache are layered on top of these traits.
//
// Drivers are registered process-wide by name before any backend is built.
//
// ============================================================================

pub mod recording;

use crate::argument::Argument;
use crate::config::IsolationLevel;
use crate::core::{DacError, Result, Value};
use crate::rows::ColumnType;
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

pub use recording::{Operation, RecordingDriver, Request, Response};

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

impl ExecResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            last_insert_id: 0,
            rows_affected,
        }
    }
}

/// Options for `begin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub isolation: IsolationLevel,
}

impl TransactionOptions {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            readonly: false,
            isolation,
        }
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

/// Forward-only iterator over raw result values.
#[async_trait]
pub trait Cursor: Send {
    fn columns(&self) -> &[ColumnType];

    /// Next row, or `None` once the result is exhausted.
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Statement: Send + Sync {
    fn sql(&self) -> &str;

    async fn query(&self, args: &[Argument]) -> Result<Box<dyn Cursor>>;

    async fn execute(&self, args: &[Argument]) -> Result<ExecResult>;

    async fn close(&self) -> Result<()>;
}

/// A single physical session. Methods take `&self`; the pool guarantees a
/// connection is used by one caller at a time.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>>;

    async fn query(&self, sql: &str, args: &[Argument]) -> Result<Box<dyn Cursor>>;

    async fn execute(&self, sql: &str, args: &[Argument]) -> Result<ExecResult>;

    async fn begin(&self, options: TransactionOptions) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, dsn: &str) -> Result<Box<dyn Connection>>;
}

/// In-memory cursor over already fetched rows.
pub struct VecCursor {
    columns: Vec<ColumnType>,
    rows: VecDeque<Vec<Value>>,
    closed: bool,
}

impl VecCursor {
    pub fn new(columns: Vec<ColumnType>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl Cursor for VecCursor {
    fn columns(&self) -> &[ColumnType] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }
}

lazy_static! {
    static ref DRIVERS: RwLock<HashMap<String, Arc<dyn Driver>>> = RwLock::new(HashMap::new());
}

/// Makes a driver available to backends under its name.
pub fn register(driver: Arc<dyn Driver>) -> Result<()> {
    let mut drivers = DRIVERS.write()?;
    let name = driver.name().to_string();
    if drivers.contains_key(&name) {
        return Err(DacError::ConfigInvalid(format!(
            "driver '{}' is already registered",
            name
        )));
    }
    drivers.insert(name, driver);
    Ok(())
}

pub fn lookup(name: &str) -> Result<Arc<dyn Driver>> {
    DRIVERS
        .read()?
        .get(name)
        .cloned()
        .ok_or_else(|| DacError::ConfigInvalid(format!("driver '{}' is not registered", name)))
}

pub fn registered() -> Vec<String> {
    DRIVERS
        .read()
        .map(|drivers| drivers.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_cursor_drains() {
        let mut cursor = VecCursor::new(
            vec![ColumnType::new("id", "INT", false)],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        assert_eq!(cursor.next_row().await.unwrap(), Some(vec![Value::Int(1)]));
        cursor.close().await.unwrap();
        assert_eq!(cursor.next_row().await.unwrap(), None);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let name = format!("dup-{}", uuid::Uuid::new_v4());
        register(Arc::new(RecordingDriver::new(&name))).unwrap();
        assert!(register(Arc::new(RecordingDriver::new(&name))).is_err());
        assert!(lookup(&name).is_ok());
        assert!(lookup("never-registered").is_err());
    }
}
