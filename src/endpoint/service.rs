use super::{BeginRequest, BeginResponse, Endpoint, ExecuteResponse, StatementRequest, functions};
use crate::config::{Config, IsolationLevel};
use crate::context::Context;
use crate::core::{DacError, Result};
use crate::database::{self, Database};
use crate::dialect::{self, Dialect};
use crate::driver::{ExecResult, TransactionOptions};
use crate::rows::Rows;
use crate::transaction::{Transaction, TransactionGroup, TransactionId};
use async_trait::async_trait;
use std::sync::Arc;

/// A database exposed as an endpoint instance: one backend, one transaction
/// group, one dialect.
pub struct Service {
    id: String,
    name: String,
    dialect: Arc<dyn Dialect>,
    isolation: IsolationLevel,
    database: Arc<dyn Database>,
    group: Arc<TransactionGroup>,
}

impl Service {
    /// Builds the backend from `config` and starts the transaction reaper.
    /// Must run inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self> {
        let database = database::construct(config)?;
        Self::with_database(config, database)
    }

    pub fn with_database(config: &Config, database: Arc<dyn Database>) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.endpoint.clone(),
            dialect: dialect::lookup(&config.dialect)?,
            isolation: config.isolation,
            database,
            group: TransactionGroup::start(config.max_age()),
        })
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn group(&self) -> &Arc<TransactionGroup> {
        &self.group
    }

    fn address_id(ctx: &Context) -> Option<TransactionId> {
        ctx.transaction_address().map(|address| address.id)
    }

    /// The open transaction the request participates in, if any.
    fn active(&self, ctx: &Context) -> Option<Arc<Transaction>> {
        let id = Self::address_id(ctx)?;
        match self.group.get(&id).filter(|tx| !tx.is_closed()) {
            Some(tx) => Some(tx),
            None => {
                tracing::warn!(transaction = %id, endpoint = %self.name, "transaction unavailable, using the backend");
                None
            }
        }
    }

    fn response(&self, transaction: &Transaction) -> BeginResponse {
        BeginResponse {
            id: transaction.id().clone(),
            endpoint_id: self.id.clone(),
            origin: transaction.process_id().to_string(),
        }
    }

    /// Opens a transaction under the request id, or joins the one already
    /// open under it.
    pub async fn begin(&self, ctx: &Context, request: BeginRequest) -> Result<BeginResponse> {
        let id = TransactionId::from_request(ctx.request_id());
        if let Some(existing) = self.group.get(&id) {
            existing.acquire()?;
            tracing::debug!(transaction = %id, acquires = existing.acquires(), "transaction joined");
            return Ok(self.response(&existing));
        }

        let isolation = match request.isolation {
            Some(level) => level,
            None => self.isolation,
        };
        let options = TransactionOptions::new(isolation).readonly(request.readonly);
        let session = self.database.begin(ctx, options).await?;
        match self.group.put(id.clone(), ctx.process_id(), session) {
            Ok(transaction) => {
                tracing::info!(transaction = %id, endpoint = %self.name, ?isolation, "transaction started");
                Ok(self.response(&transaction))
            }
            Err(err) => {
                // Lost a race with a concurrent begin under the same id.
                let Some(existing) = self.group.get(&id) else {
                    return Err(err);
                };
                existing.acquire()?;
                Ok(self.response(&existing))
            }
        }
    }

    /// `true` only when the origin released the last acquire and the
    /// database commit ran.
    pub async fn commit(&self, ctx: &Context) -> Result<bool> {
        let id = Self::address_id(ctx).ok_or(DacError::TransactionAbsent)?;
        let transaction = self.group.get(&id).ok_or_else(|| self.group.missing(&id))?;
        let result = ctx.run(transaction.commit(ctx.process_id())).await;
        if transaction.is_closed() {
            self.group.forget(&id);
        }
        result.map_err(|err| err.with_transaction(id.as_str()))
    }

    /// Rolls back from any process holding the address. Rolling back a
    /// finished transaction succeeds.
    pub async fn rollback(&self, ctx: &Context) -> Result<()> {
        let id = Self::address_id(ctx).ok_or(DacError::TransactionAbsent)?;
        match self.group.get_and_remove(&id) {
            Some(transaction) => transaction.rollback().await,
            None => Ok(()),
        }
    }

    pub async fn query(&self, ctx: &Context, request: StatementRequest) -> Result<Rows> {
        match self.active(ctx) {
            Some(tx) => ctx.run(tx.query(&request.sql, &request.args)).await,
            None => self.database.query(ctx, &request.sql, &request.args).await,
        }
    }

    pub async fn execute(&self, ctx: &Context, request: StatementRequest) -> Result<ExecResult> {
        match self.active(ctx) {
            Some(tx) => ctx.run(tx.execute(&request.sql, &request.args)).await,
            None => self.database.execute(ctx, &request.sql, &request.args).await,
        }
    }

    pub fn dialect(&self) -> &str {
        self.dialect.name()
    }

    /// Rolls back open transactions and closes the backend.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        self.group.close().await;
        self.database.close(ctx).await
    }
}

#[async_trait]
impl Endpoint for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, ctx: &Context, function: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let response = match function {
            functions::BEGIN => {
                let request: BeginRequest = serde_json::from_value(payload)?;
                serde_json::to_value(self.begin(ctx, request).await?)?
            }
            functions::COMMIT => serde_json::Value::Bool(self.commit(ctx).await?),
            functions::ROLLBACK => {
                self.rollback(ctx).await?;
                serde_json::Value::Null
            }
            functions::QUERY => {
                let request: StatementRequest = serde_json::from_value(payload)?;
                let sql = request.sql.clone();
                let mut rows = self.query(ctx, request).await?;
                rows.materialize().await.map_err(|err| err.with_sql(&sql))?;
                serde_json::to_value(&rows)?
            }
            functions::EXECUTE => {
                let request: StatementRequest = serde_json::from_value(payload)?;
                serde_json::to_value(ExecuteResponse::from(self.execute(ctx, request).await?))?
            }
            functions::DIALECT => serde_json::Value::String(self.dialect().to_string()),
            other => {
                return Err(DacError::database(
                    "dispatch",
                    format!("unknown function '{}'", other),
                ));
            }
        };
        Ok(response)
    }

    fn local_transaction(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.group.get(id).filter(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::Argument;
    use crate::context::TransactionAddress;
    use crate::database::{Handle, PoolSettings, Standalone};
    use crate::driver::{Driver, Operation, RecordingDriver, Response};
    use std::time::Duration;

    fn service(driver: &Arc<RecordingDriver>) -> Service {
        let handle = Handle::open(
            driver.clone(),
            "main",
            "mem://svc",
            PoolSettings {
                max_opens: 0,
                max_idles: 4,
                max_idle_time: None,
                max_lifetime: None,
                acquire_timeout: Duration::from_millis(50),
                statements: None,
            },
        );
        let config = Config::new("postgres", driver.name(), "mem://svc");
        Service::with_database(&config, Arc::new(Standalone::new(handle))).unwrap()
    }

    fn attach(ctx: &Context, response: &BeginResponse) {
        ctx.attach_transaction(TransactionAddress {
            id: response.id.clone(),
            endpoint_id: response.endpoint_id.clone(),
            origin: response.origin.clone(),
        });
    }

    #[tokio::test]
    async fn test_begin_with_same_request_id_joins() {
        let driver = Arc::new(RecordingDriver::new("svc-join"));
        let service = service(&driver);
        let ctx = Context::for_process("proc-a").with_request_id("req-1");

        let first = service.begin(&ctx, BeginRequest::default()).await.unwrap();
        let second = service.begin(&ctx, BeginRequest::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id.as_str(), "req-1");
        assert_eq!(driver.count(Operation::Begin), 1);

        attach(&ctx, &first);
        assert!(!service.commit(&ctx).await.unwrap());
        assert!(service.commit(&ctx).await.unwrap());
        assert_eq!(driver.count(Operation::Commit), 1);
        assert_eq!(
            service.commit(&ctx).await,
            Err(DacError::TransactionClosed("req-1".into()))
        );
    }

    #[tokio::test]
    async fn test_begin_uses_configured_isolation() {
        let driver = Arc::new(RecordingDriver::new("svc-isolation"));
        let service = service(&driver);
        let ctx = Context::new();

        service.begin(&ctx, BeginRequest::default()).await.unwrap();
        service
            .begin(
                &Context::new(),
                BeginRequest {
                    readonly: true,
                    isolation: Some(IsolationLevel::Serializable),
                },
            )
            .await
            .unwrap();

        let options: Vec<TransactionOptions> = driver.requests().into_iter().filter_map(|r| r.options).collect();
        assert_eq!(options[0].isolation, IsolationLevel::ReadCommitted);
        assert_eq!(options[1], TransactionOptions::new(IsolationLevel::Serializable).readonly(true));
    }

    #[tokio::test]
    async fn test_statements_route_through_active_transaction() {
        let driver = Arc::new(RecordingDriver::with_handler("svc-route", |request| {
            Ok(match request.operation {
                Operation::Execute => Response::affected(2),
                _ => Response::Done,
            })
        }));
        let service = service(&driver);
        let ctx = Context::new();

        let statement = StatementRequest {
            sql: "UPDATE t SET a = $1".to_string(),
            args: vec![Argument::new(1i64)],
        };
        service.execute(&ctx, statement.clone()).await.unwrap();

        let begun = service.begin(&ctx, BeginRequest::default()).await.unwrap();
        attach(&ctx, &begun);
        let result = service.execute(&ctx, statement).await.unwrap();
        assert_eq!(result.rows_affected, 2);
        service.rollback(&ctx).await.unwrap();
        service.rollback(&ctx).await.unwrap();

        let flags: Vec<bool> = driver
            .requests()
            .into_iter()
            .filter(|r| r.operation == Operation::Execute)
            .map(|r| r.in_transaction)
            .collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[tokio::test]
    async fn test_commit_without_transaction() {
        let driver = Arc::new(RecordingDriver::new("svc-absent"));
        let service = service(&driver);
        assert_eq!(service.commit(&Context::new()).await, Err(DacError::TransactionAbsent));
        assert_eq!(service.rollback(&Context::new()).await, Err(DacError::TransactionAbsent));
    }

    #[tokio::test]
    async fn test_handle_dispatches_by_function_name() {
        let driver = Arc::new(RecordingDriver::new("svc-handle"));
        let service = service(&driver);
        let ctx = Context::new();

        let dialect = service.handle(&ctx, functions::DIALECT, serde_json::Value::Null).await.unwrap();
        assert_eq!(dialect, "postgres");
        let rows = service
            .handle(&ctx, functions::QUERY, serde_json::json!({ "sql": "SELECT 1" }))
            .await
            .unwrap();
        assert!(rows.get("columns").is_some());
        assert!(service.handle(&ctx, "drop", serde_json::Value::Null).await.is_err());
    }
}
