use super::pool::{Pool, PoolGuard};
use crate::argument::Argument;
use crate::core::{DacError, Result};
use crate::driver::{ExecResult, TransactionOptions};
use crate::rows::Rows;
use tokio::sync::Mutex;

/// A database transaction pinned to one pooled connection.
///
/// Operations are serialized on the connection. Query results are drained
/// before the connection is handed to the next operation, so a `Rows`
/// returned here never holds the connection. Once committed or rolled back
/// the connection goes back to the pool and every further call fails.
pub struct Session {
    label: String,
    options: TransactionOptions,
    guard: Mutex<Option<PoolGuard>>,
}

impl Session {
    pub(crate) async fn begin(pool: &Pool, options: TransactionOptions) -> Result<Self> {
        let mut guard = pool.acquire().await?;
        // Marked before the call so a cancelled begin discards the connection.
        guard.set_in_transaction(true);
        if let Err(err) = guard.connection().begin(options).await {
            guard.discard().await;
            return Err(err.wrap("begin").with_endpoint(pool.label()));
        }
        tracing::debug!(pool = pool.label(), readonly = options.readonly, "session started");
        Ok(Self {
            label: pool.label().to_string(),
            options,
            guard: Mutex::new(Some(guard)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    pub async fn is_finished(&self) -> bool {
        self.guard.lock().await.is_none()
    }

    fn finished(&self, operation: &str) -> DacError {
        DacError::database(operation, "session is already finished").with_endpoint(&self.label)
    }

    pub async fn query(&self, sql: &str, args: &[Argument]) -> Result<Rows> {
        let slot = self.guard.lock().await;
        let guard = slot.as_ref().ok_or_else(|| self.finished("query"))?;
        let cursor = match guard.statements() {
            Some(statements) => {
                let lease = statements.get(guard.connection(), sql).await?;
                lease.query(args).await
            }
            None => guard.connection().query(sql, args).await,
        }
        .map_err(|err| err.wrap("query").with_sql(sql).with_endpoint(&self.label))?;
        Rows::streaming(cursor)
            .into_materialized()
            .await
            .map_err(|err| err.wrap("query").with_sql(sql))
    }

    pub async fn execute(&self, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        let slot = self.guard.lock().await;
        let guard = slot.as_ref().ok_or_else(|| self.finished("execute"))?;
        match guard.statements() {
            Some(statements) => {
                let lease = statements.get(guard.connection(), sql).await?;
                lease.execute(args).await
            }
            None => guard.connection().execute(sql, args).await,
        }
        .map_err(|err| err.wrap("execute").with_sql(sql).with_endpoint(&self.label))
    }

    /// Commits and returns the connection. A failed commit rolls back on a
    /// best-effort basis; the session is finished either way.
    pub async fn commit(&self) -> Result<()> {
        let Some(mut guard) = self.guard.lock().await.take() else {
            return Err(self.finished("commit"));
        };
        match guard.connection().commit().await {
            Ok(()) => {
                guard.set_in_transaction(false);
                guard.release().await;
                tracing::debug!(pool = %self.label, "session committed");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(pool = %self.label, error = %err, "commit failed, rolling back");
                guard.release().await;
                Err(err.wrap("commit").with_endpoint(&self.label))
            }
        }
    }

    /// Rolls back and returns the connection. Rolling back a finished
    /// session does nothing.
    pub async fn rollback(&self) -> Result<()> {
        let Some(mut guard) = self.guard.lock().await.take() else {
            return Ok(());
        };
        let result = guard.connection().rollback().await;
        guard.set_in_transaction(false);
        match result {
            Ok(()) => {
                guard.release().await;
                tracing::debug!(pool = %self.label, "session rolled back");
                Ok(())
            }
            Err(err) => {
                guard.discard().await;
                Err(err.wrap("rollback").with_endpoint(&self.label))
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.label)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::database::pool::PoolSettings;
    use crate::driver::{Operation, RecordingDriver, Response};
    use crate::rows::ColumnType;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(driver: Arc<RecordingDriver>, statements: bool) -> Pool {
        Pool::new(
            driver,
            "main",
            "mem://session",
            PoolSettings {
                max_opens: 1,
                max_idles: 1,
                max_idle_time: None,
                max_lifetime: None,
                acquire_timeout: Duration::from_millis(50),
                statements: statements.then_some((8, Duration::from_secs(1))),
            },
        )
    }

    #[tokio::test]
    async fn test_session_pins_connection_until_commit() {
        let driver = Arc::new(RecordingDriver::with_handler("session-commit", |request| {
            Ok(match request.operation {
                Operation::Query => Response::rows(
                    vec![ColumnType::new("id", "BIGINT", false)],
                    vec![vec![Value::Int(1)], vec![Value::Int(2)]],
                ),
                Operation::Execute => Response::affected(1),
                _ => Response::Done,
            })
        }));
        let pool = pool(driver.clone(), false);
        let session = Session::begin(&pool, TransactionOptions::default()).await.unwrap();

        assert!(pool.acquire().await.is_err());

        let rows = session.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), Some(2));
        let result = session.execute("DELETE FROM t", &[]).await.unwrap();
        assert_eq!(result.rows_affected, 1);

        session.commit().await.unwrap();
        assert!(session.is_finished().await);
        assert!(session.query("SELECT 1", &[]).await.is_err());
        assert_eq!(pool.stats().await.available_connections, 1);
        assert!(driver.requests().iter().filter(|r| r.operation == Operation::Execute).all(|r| r.in_transaction));
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let driver = Arc::new(RecordingDriver::new("session-rollback"));
        let pool = pool(driver.clone(), false);
        let session = Session::begin(&pool, TransactionOptions::default()).await.unwrap();

        session.rollback().await.unwrap();
        session.rollback().await.unwrap();
        assert_eq!(driver.count(Operation::Rollback), 1);
        assert!(session.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_statement_cache_used_when_enabled() {
        let driver = Arc::new(RecordingDriver::new("session-stmts"));
        let pool = pool(driver.clone(), true);
        let session = Session::begin(&pool, TransactionOptions::default()).await.unwrap();

        for _ in 0..3 {
            session.execute("UPDATE t SET a = ?", &[Argument::new(1i64)]).await.unwrap();
        }
        session.commit().await.unwrap();
        assert_eq!(driver.count(Operation::Prepare), 1);
        assert_eq!(driver.count(Operation::Execute), 3);
    }
}
