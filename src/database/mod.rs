// ============================================================================
// Database Backends
// ============================================================================
//
// A backend turns a configuration into pooled handles and routes work to
// them:
//
//   standalone    one handle for reads, writes and transactions
//   masterSlave   begin/execute on the master, queries round-robin the slaves
//   cluster       every operation round-robins equivalent handles
//
// Stateless queries stream: the returned `Rows` holds its pooled connection
// until drained or dropped. Transactions run on a `Session` pinned to one
// connection, with the per-connection statement cache when enabled.
//
// ============================================================================

pub mod cluster;
pub mod master_slave;
pub mod pool;
pub mod session;
pub mod standalone;
pub mod statements;

use crate::argument::Argument;
use crate::config::{Config, Kind};
use crate::context::Context;
use crate::core::Result;
use crate::driver::{self, Driver, ExecResult, TransactionOptions};
use crate::rows::Rows;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use cluster::Cluster;
pub use master_slave::MasterSlave;
pub use pool::{Pool, PoolGuard, PoolSettings, PoolStats};
pub use session::Session;
pub use standalone::Standalone;
pub use statements::{StatementCache, StatementLease};

#[async_trait]
pub trait Database: Send + Sync {
    fn kind(&self) -> Kind;

    /// Starts a transaction on the write handle.
    async fn begin(&self, ctx: &Context, options: TransactionOptions) -> Result<Session>;

    async fn query(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows>;

    async fn execute(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult>;

    async fn close(&self, ctx: &Context) -> Result<()>;

    /// Pool statistics of every handle, write handle first.
    async fn stats(&self) -> Vec<PoolStats>;
}

/// Builds the backend described by `config`. The driver must already be
/// registered.
pub fn construct(config: &Config) -> Result<Arc<dyn Database>> {
    config.validate()?;
    let driver = driver::lookup(&config.options.driver)?;
    let settings = PoolSettings::from(&config.options);
    let options = &config.options;

    let database: Arc<dyn Database> = match config.kind {
        Kind::Standalone => Arc::new(Standalone::new(Handle::open(
            driver,
            "standalone",
            &options.dsn,
            settings,
        ))),
        Kind::MasterSlave => Arc::new(MasterSlave::new(
            Handle::open(driver.clone(), "master", &options.master, settings.clone()),
            open_all(&driver, "slave", &options.slavers, &settings),
        )?),
        Kind::Cluster => Arc::new(Cluster::new(open_all(
            &driver,
            "node",
            &options.dsn_list,
            &settings,
        ))?),
    };
    tracing::info!(
        kind = ?config.kind,
        driver = %config.options.driver,
        dialect = %config.dialect,
        "database constructed"
    );
    Ok(database)
}

fn open_all(driver: &Arc<dyn Driver>, prefix: &str, dsns: &[String], settings: &PoolSettings) -> Vec<Handle> {
    dsns.iter()
        .enumerate()
        .map(|(idx, dsn)| Handle::open(driver.clone(), &format!("{}-{}", prefix, idx), dsn, settings.clone()))
        .collect()
}

/// One pooled DSN.
pub struct Handle {
    pool: Pool,
}

impl Handle {
    pub fn open(driver: Arc<dyn Driver>, label: &str, dsn: &str, settings: PoolSettings) -> Self {
        Self {
            pool: Pool::new(driver, label, dsn, settings),
        }
    }

    pub fn label(&self) -> &str {
        self.pool.label()
    }

    pub async fn begin(&self, ctx: &Context, options: TransactionOptions) -> Result<Session> {
        ctx.run(Session::begin(&self.pool, options)).await
    }

    pub async fn query(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
        ctx.run(async {
            let guard = self.pool.acquire().await?;
            let cursor = guard
                .connection()
                .query(sql, args)
                .await
                .map_err(|err| err.wrap("query").with_sql(sql).with_endpoint(self.label()))?;
            Ok(Rows::streaming_with(cursor, Some(Box::new(guard))))
        })
        .await
    }

    pub async fn execute(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        ctx.run(async {
            let guard = self.pool.acquire().await?;
            let result = guard
                .connection()
                .execute(sql, args)
                .await
                .map_err(|err| err.wrap("execute").with_sql(sql).with_endpoint(self.label()));
            guard.release().await;
            result
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!(pool = self.label(), "handle closed");
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }
}

/// Picks the next handle in turn.
pub(crate) fn round_robin<'a>(handles: &'a [Handle], next: &AtomicUsize) -> &'a Handle {
    let idx = next.fetch_add(1, Ordering::Relaxed) % handles.len();
    &handles[idx]
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::driver::RecordingDriver;
    use std::time::Duration;

    pub fn settings() -> PoolSettings {
        PoolSettings {
            max_opens: 2,
            max_idles: 2,
            max_idle_time: None,
            max_lifetime: None,
            acquire_timeout: Duration::from_millis(50),
            statements: None,
        }
    }

    pub fn handle(driver: &Arc<RecordingDriver>, dsn: &str) -> Handle {
        Handle::open(driver.clone(), dsn, dsn, settings())
    }

    /// DSNs of every query/execute call, in order.
    pub fn routed(driver: &RecordingDriver) -> Vec<String> {
        driver
            .requests()
            .into_iter()
            .filter(|r| {
                matches!(
                    r.operation,
                    crate::driver::Operation::Query | crate::driver::Operation::Execute
                )
            })
            .map(|r| r.dsn)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Operation, RecordingDriver};

    #[tokio::test]
    async fn test_streaming_query_holds_connection_until_drained() {
        let driver = Arc::new(RecordingDriver::new("db-stream"));
        let handle = Handle::open(driver.clone(), "main", "mem://a", {
            let mut settings = testing::settings();
            settings.max_opens = 1;
            settings
        });
        let ctx = Context::new();

        let rows = handle.query(&ctx, "SELECT 1", &[]).await.unwrap();
        assert_eq!(handle.stats().await.active_connections, 1);
        drop(rows);
        assert_eq!(handle.stats().await.available_connections, 1);

        handle.execute(&ctx, "DELETE FROM t", &[]).await.unwrap();
        assert_eq!(driver.count(Operation::Connect), 1);
    }

    #[tokio::test]
    async fn test_construct_requires_registered_driver() {
        let config = Config::new("mysql", "never-registered", "mem://x");
        assert_eq!(construct(&config).err().map(|e| e.code()), Some("ConfigInvalid"));
    }

    #[tokio::test]
    async fn test_construct_by_kind() {
        let name = format!("db-construct-{}", uuid::Uuid::new_v4());
        driver::register(Arc::new(RecordingDriver::new(&name))).unwrap();

        let standalone = construct(&Config::new("postgres", &name, "mem://a")).unwrap();
        assert_eq!(standalone.kind(), Kind::Standalone);

        let replicated = construct(&Config::new("mysql", &name, "").master_slave("mem://m", ["mem://s1", "mem://s2"]))
            .unwrap();
        assert_eq!(replicated.kind(), Kind::MasterSlave);
        assert_eq!(replicated.stats().await.len(), 3);

        let cluster = construct(&Config::new("mysql", &name, "").cluster(["mem://n1"])).unwrap();
        assert_eq!(cluster.kind(), Kind::Cluster);
    }
}
