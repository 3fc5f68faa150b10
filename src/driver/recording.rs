//! A driver that records every call and answers through a handler.
//!
//! Used by tests and demos in place of a networked database: the handler sees
//! each [`Request`] (operation, SQL, arguments, connection id) and returns a
//! [`Response`]. The full request log stays inspectable afterwards.

use super::{Connection, Cursor, Driver, ExecResult, Statement, TransactionOptions, VecCursor};
use crate::argument::Argument;
use crate::core::{DacError, Result, Value};
use crate::rows::ColumnType;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Prepare,
    Query,
    Execute,
    Begin,
    Commit,
    Rollback,
    Ping,
    Close,
    CloseStatement,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub connection: u64,
    pub dsn: String,
    pub operation: Operation,
    pub sql: String,
    pub args: Vec<Argument>,
    pub in_transaction: bool,
    pub options: Option<TransactionOptions>,
}

#[derive(Debug, Clone)]
pub enum Response {
    Rows {
        columns: Vec<ColumnType>,
        rows: Vec<Vec<Value>>,
    },
    Exec(ExecResult),
    Done,
}

impl Response {
    pub fn rows(columns: Vec<ColumnType>, rows: Vec<Vec<Value>>) -> Self {
        Self::Rows { columns, rows }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self::Exec(ExecResult::affected(rows_affected))
    }
}

pub type Handler = Arc<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

struct Shared {
    log: Mutex<Vec<Request>>,
    handler: Handler,
    latency: Option<Duration>,
}

impl Shared {
    async fn call(&self, request: Request) -> Result<Response> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let response = (self.handler)(&request);
        self.log.lock()?.push(request);
        response
    }
}

pub struct RecordingDriver {
    name: String,
    shared: Arc<Shared>,
    next_connection: AtomicU64,
}

impl RecordingDriver {
    /// A driver whose handler acknowledges everything with an empty answer.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_handler(name, |_| Ok(Response::Done))
    }

    pub fn with_handler<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
    {
        Self::build(name.into(), Arc::new(handler), None)
    }

    /// Same driver, with every call delayed by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self::build(self.name, self.shared.handler.clone(), Some(latency))
    }

    fn build(name: String, handler: Handler, latency: Option<Duration>) -> Self {
        Self {
            name,
            shared: Arc::new(Shared {
                log: Mutex::new(Vec::new()),
                handler,
                latency,
            }),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared
            .log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.shared
            .log
            .lock()
            .map(|log| log.iter().filter(|r| r.operation == operation).count())
            .unwrap_or(0)
    }

    /// SQL text of every query/execute call, in order.
    pub fn statements(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| matches!(r.operation, Operation::Query | Operation::Execute))
            .map(|r| r.sql)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.shared.log.lock() {
            log.clear();
        }
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, dsn: &str) -> Result<Box<dyn Connection>> {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let connection = RecordingConnection {
            state: Arc::new(ConnectionState {
                id,
                dsn: dsn.to_string(),
                in_transaction: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shared: self.shared.clone(),
            }),
        };
        connection
            .state
            .call(Operation::Connect, "", &[], None)
            .await?;
        Ok(Box::new(connection))
    }
}

struct ConnectionState {
    id: u64,
    dsn: String,
    in_transaction: AtomicBool,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl ConnectionState {
    async fn call(
        &self,
        operation: Operation,
        sql: &str,
        args: &[Argument],
        options: Option<TransactionOptions>,
    ) -> Result<Response> {
        if self.closed.load(Ordering::SeqCst) && operation != Operation::Close {
            return Err(DacError::database("driver", "connection is closed"));
        }
        self.shared
            .call(Request {
                connection: self.id,
                dsn: self.dsn.clone(),
                operation,
                sql: sql.to_string(),
                args: args.to_vec(),
                in_transaction: self.in_transaction.load(Ordering::SeqCst),
                options,
            })
            .await
    }

    async fn query(&self, sql: &str, args: &[Argument]) -> Result<Box<dyn Cursor>> {
        match self.call(Operation::Query, sql, args, None).await? {
            Response::Rows { columns, rows } => Ok(Box::new(VecCursor::new(columns, rows))),
            _ => Ok(Box::new(VecCursor::empty())),
        }
    }

    async fn execute(&self, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        match self.call(Operation::Execute, sql, args, None).await? {
            Response::Exec(result) => Ok(result),
            _ => Ok(ExecResult::default()),
        }
    }
}

struct RecordingConnection {
    state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        self.state.call(Operation::Prepare, sql, &[], None).await?;
        Ok(Arc::new(RecordingStatement {
            sql: sql.to_string(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn query(&self, sql: &str, args: &[Argument]) -> Result<Box<dyn Cursor>> {
        self.state.query(sql, args).await
    }

    async fn execute(&self, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        self.state.execute(sql, args).await
    }

    async fn begin(&self, options: TransactionOptions) -> Result<()> {
        if self.state.in_transaction.load(Ordering::SeqCst) {
            return Err(DacError::database("begin", "transaction already in progress"));
        }
        self.state
            .call(Operation::Begin, "", &[], Some(options))
            .await?;
        self.state.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state.call(Operation::Commit, "", &[], None).await?;
        self.state.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let result = self.state.call(Operation::Rollback, "", &[], None).await;
        self.state.in_transaction.store(false, Ordering::SeqCst);
        result.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        self.state.call(Operation::Ping, "", &[], None).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.call(Operation::Close, "", &[], None).await.map(|_| ())
    }
}

struct RecordingStatement {
    sql: String,
    state: Arc<ConnectionState>,
    closed: AtomicBool,
}

impl RecordingStatement {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DacError::database("statement", "statement is closed").with_sql(&self.sql));
        }
        Ok(())
    }
}

#[async_trait]
impl Statement for RecordingStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn query(&self, args: &[Argument]) -> Result<Box<dyn Cursor>> {
        self.check()?;
        self.state.query(&self.sql, args).await
    }

    async fn execute(&self, args: &[Argument]) -> Result<ExecResult> {
        self.check()?;
        self.state.execute(&self.sql, args).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state
            .call(Operation::CloseStatement, &self.sql, &[], None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_transaction_flow() {
        let driver = RecordingDriver::with_handler("rec-flow", |request| {
            Ok(match request.operation {
                Operation::Execute => Response::affected(1),
                _ => Response::Done,
            })
        });
        let conn = driver.connect("mem://a").await.unwrap();
        conn.begin(TransactionOptions::default()).await.unwrap();
        let result = conn
            .execute("UPDATE t SET a = ?", &[Argument::new(Value::Int(1))])
            .await
            .unwrap();
        conn.commit().await.unwrap();

        assert_eq!(result.rows_affected, 1);
        let requests = driver.requests();
        let execute = requests
            .iter()
            .find(|r| r.operation == Operation::Execute)
            .unwrap();
        assert!(execute.in_transaction);
        assert_eq!(execute.dsn, "mem://a");
        assert_eq!(driver.count(Operation::Commit), 1);
        assert_eq!(driver.statements(), vec!["UPDATE t SET a = ?".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_statement_fails() {
        let driver = RecordingDriver::new("rec-stmt");
        let conn = driver.connect("mem://b").await.unwrap();
        let stmt = conn.prepare("SELECT 1").await.unwrap();
        stmt.close().await.unwrap();
        assert!(stmt.query(&[]).await.is_err());
        assert_eq!(driver.count(Operation::CloseStatement), 1);
    }
}
