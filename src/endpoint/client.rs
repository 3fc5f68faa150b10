use super::runtime::{Runtime, runtime};
use super::{BeginRequest, BeginResponse, DEFAULT_ENDPOINT, ExecuteResponse, StatementRequest, functions};
use crate::argument::Argument;
use crate::config::IsolationLevel;
use crate::context::{Context, TransactionAddress};
use crate::core::{DacError, Result};
use crate::dialect::{self, Dialect};
use crate::driver::ExecResult;
use crate::rows::Rows;
use std::sync::Arc;

/// Caller side of the endpoint functions.
///
/// The endpoint name comes from the context override, else the client's
/// default. Calls made inside a transaction are pinned to the endpoint
/// instance that owns it; when that transaction lives in this process and
/// was opened here, `query` and `execute` call it directly.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
    default_endpoint: String,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(runtime())
    }
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            default_endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn default_endpoint(mut self, name: &str) -> Self {
        self.default_endpoint = name.to_string();
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn endpoint(&self, ctx: &Context) -> String {
        ctx.endpoint().unwrap_or_else(|| self.default_endpoint.clone())
    }

    async fn call(&self, ctx: &Context, function: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let name = self.endpoint(ctx);
        let address = ctx.transaction_address();
        let pinned = address.as_ref().map(|address| address.endpoint_id.as_str());
        self.runtime.request(ctx, &name, function, payload, pinned).await
    }

    /// Opens a transaction, or joins the one the context already holds, and
    /// records its address on the context.
    pub async fn begin(&self, ctx: &Context, readonly: bool, isolation: Option<IsolationLevel>) -> Result<TransactionAddress> {
        let request = serde_json::to_value(BeginRequest { readonly, isolation })?;
        let outbound = match ctx.transaction_address() {
            Some(address) => ctx.with_request_id(address.id.as_str().as_bytes().to_vec()),
            None => ctx.clone(),
        };
        let response: BeginResponse = serde_json::from_value(self.call(&outbound, functions::BEGIN, request).await?)?;
        let address = TransactionAddress {
            id: response.id,
            endpoint_id: response.endpoint_id,
            origin: response.origin,
        };

        let local = (address.origin == ctx.process_id())
            .then(|| self.runtime.instance(&address.endpoint_id))
            .flatten()
            .and_then(|endpoint| endpoint.local_transaction(&address.id));
        match local {
            Some(transaction) => ctx.attach_local_transaction(address.clone(), transaction),
            None => ctx.attach_transaction(address.clone()),
        }
        tracing::debug!(transaction = %address.id, endpoint_id = %address.endpoint_id, "transaction attached");
        Ok(address)
    }

    /// Releases this caller's acquire. Returns whether the database commit
    /// ran. The context keeps the address until the transaction finishes.
    pub async fn commit(&self, ctx: &Context) -> Result<bool> {
        if ctx.transaction_address().is_none() {
            return Err(DacError::TransactionAbsent);
        }
        match self.call(ctx, functions::COMMIT, serde_json::Value::Null).await {
            Ok(value) => {
                let committed: bool = serde_json::from_value(value)?;
                if committed {
                    ctx.detach_transaction();
                }
                Ok(committed)
            }
            Err(err) => {
                if err.is_transaction_terminal() {
                    ctx.detach_transaction();
                }
                Err(err)
            }
        }
    }

    pub async fn rollback(&self, ctx: &Context) -> Result<()> {
        if ctx.transaction_address().is_none() {
            return Err(DacError::TransactionAbsent);
        }
        let result = self.call(ctx, functions::ROLLBACK, serde_json::Value::Null).await;
        ctx.detach_transaction();
        result.map(|_| ())
    }

    pub async fn query(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
        if let Some(transaction) = ctx.local_transaction() {
            return ctx.run(transaction.query(sql, args)).await;
        }
        let payload = serde_json::to_value(StatementRequest {
            sql: sql.to_string(),
            args: args.to_vec(),
        })?;
        Ok(serde_json::from_value(self.call(ctx, functions::QUERY, payload).await?)?)
    }

    pub async fn execute(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        if let Some(transaction) = ctx.local_transaction() {
            return ctx.run(transaction.execute(sql, args)).await;
        }
        let payload = serde_json::to_value(StatementRequest {
            sql: sql.to_string(),
            args: args.to_vec(),
        })?;
        let response: ExecuteResponse = serde_json::from_value(self.call(ctx, functions::EXECUTE, payload).await?)?;
        Ok(response.into())
    }

    pub async fn dialect_name(&self, ctx: &Context) -> Result<String> {
        let value = self.call(ctx, functions::DIALECT, serde_json::Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// The dialect of the endpoint the context addresses.
    pub async fn dialect(&self, ctx: &Context) -> Result<Arc<dyn Dialect>> {
        dialect::lookup(&self.dialect_name(ctx).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::{Handle, PoolSettings, Standalone};
    use crate::driver::{Driver, Operation, RecordingDriver, Response};
    use crate::endpoint::Service;
    use std::time::Duration;

    fn setup(driver: &Arc<RecordingDriver>) -> (Client, Arc<Service>) {
        let handle = Handle::open(
            driver.clone(),
            "main",
            "mem://client",
            PoolSettings {
                max_opens: 0,
                max_idles: 4,
                max_idle_time: None,
                max_lifetime: None,
                acquire_timeout: Duration::from_millis(50),
                statements: None,
            },
        );
        let config = Config::new("mysql", driver.name(), "mem://client");
        let service = Arc::new(Service::with_database(&config, Arc::new(Standalone::new(handle))).unwrap());
        let runtime = Arc::new(Runtime::new());
        runtime.register(service.clone()).unwrap();
        (Client::new(runtime), service)
    }

    #[tokio::test]
    async fn test_local_transaction_short_circuits() {
        let driver = Arc::new(RecordingDriver::with_handler("client-local", |request| {
            Ok(match request.operation {
                Operation::Execute => Response::affected(1),
                _ => Response::Done,
            })
        }));
        let (client, _service) = setup(&driver);
        let ctx = Context::new();

        let address = client.begin(&ctx, false, None).await.unwrap();
        assert!(ctx.local_transaction().is_some());
        assert_eq!(ctx.transaction_address(), Some(address));

        client.execute(&ctx, "UPDATE t SET a = ?", &[Argument::new(1i64)]).await.unwrap();
        assert!(client.commit(&ctx).await.unwrap());
        assert!(ctx.transaction_address().is_none());
        assert_eq!(driver.count(Operation::Commit), 1);
    }

    #[tokio::test]
    async fn test_nested_begin_joins_and_outer_commit_finishes() {
        let driver = Arc::new(RecordingDriver::new("client-nested"));
        let (client, _service) = setup(&driver);
        let ctx = Context::new();

        let outer = client.begin(&ctx, false, None).await.unwrap();
        let inner = client.begin(&ctx, false, None).await.unwrap();
        assert_eq!(outer, inner);
        assert_eq!(driver.count(Operation::Begin), 1);

        assert!(!client.commit(&ctx).await.unwrap());
        assert!(client.commit(&ctx).await.unwrap());
        assert_eq!(driver.count(Operation::Commit), 1);
    }

    #[tokio::test]
    async fn test_rollback_detaches_and_reports_absent_afterwards() {
        let driver = Arc::new(RecordingDriver::new("client-rollback"));
        let (client, _service) = setup(&driver);
        let ctx = Context::new();

        client.begin(&ctx, false, None).await.unwrap();
        client.rollback(&ctx).await.unwrap();
        assert_eq!(client.rollback(&ctx).await, Err(DacError::TransactionAbsent));
        assert_eq!(client.commit(&ctx).await, Err(DacError::TransactionAbsent));
        assert_eq!(driver.count(Operation::Rollback), 1);
    }

    #[tokio::test]
    async fn test_dialect_of_addressed_endpoint() {
        let driver = Arc::new(RecordingDriver::new("client-dialect"));
        let (client, _service) = setup(&driver);
        let ctx = Context::new();
        assert_eq!(client.dialect(&ctx).await.unwrap().name(), "mysql");

        ctx.use_endpoint("reports");
        assert!(client.dialect_name(&ctx).await.is_err());
    }
}
