use super::{Database, Handle, PoolStats, Session, round_robin};
use crate::argument::Argument;
use crate::config::Kind;
use crate::context::Context;
use crate::core::{DacError, Result};
use crate::driver::{ExecResult, TransactionOptions};
use crate::rows::Rows;
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;

/// Read/write split: transactions and writes on the master, queries spread
/// over the slaves. Slaves may lag the master.
pub struct MasterSlave {
    master: Handle,
    slaves: Vec<Handle>,
    next: AtomicUsize,
}

impl MasterSlave {
    pub fn new(master: Handle, slaves: Vec<Handle>) -> Result<Self> {
        if slaves.is_empty() {
            return Err(DacError::ConfigInvalid(
                "masterSlave requires at least one slave".to_string(),
            ));
        }
        Ok(Self {
            master,
            slaves,
            next: AtomicUsize::new(0),
        })
    }

    pub fn slaves(&self) -> usize {
        self.slaves.len()
    }
}

#[async_trait]
impl Database for MasterSlave {
    fn kind(&self) -> Kind {
        Kind::MasterSlave
    }

    async fn begin(&self, ctx: &Context, options: TransactionOptions) -> Result<Session> {
        self.master.begin(ctx, options).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
        round_robin(&self.slaves, &self.next).query(ctx, sql, args).await
    }

    async fn execute(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        self.master.execute(ctx, sql, args).await
    }

    async fn close(&self, _ctx: &Context) -> Result<()> {
        self.master.close().await;
        for slave in &self.slaves {
            slave.close().await;
        }
        Ok(())
    }

    async fn stats(&self) -> Vec<PoolStats> {
        let mut stats = vec![self.master.stats().await];
        for slave in &self.slaves {
            stats.push(slave.stats().await);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing;
    use crate::driver::{Operation, RecordingDriver};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_requires_a_slave() {
        let driver = Arc::new(RecordingDriver::new("ms-empty"));
        let result = MasterSlave::new(testing::handle(&driver, "mem://m"), Vec::new());
        assert_eq!(result.err().map(|e| e.code()), Some("ConfigInvalid"));
    }

    #[tokio::test]
    async fn test_reads_rotate_over_slaves_and_writes_hit_master() {
        let driver = Arc::new(RecordingDriver::new("ms-route"));
        let db = MasterSlave::new(
            testing::handle(&driver, "mem://m"),
            vec![testing::handle(&driver, "mem://s0"), testing::handle(&driver, "mem://s1")],
        )
        .unwrap();
        let ctx = Context::new();

        for _ in 0..4 {
            db.query(&ctx, "SELECT 1", &[]).await.unwrap();
        }
        db.execute(&ctx, "UPDATE t SET a = 1", &[]).await.unwrap();
        let session = db.begin(&ctx, TransactionOptions::default()).await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(
            testing::routed(&driver),
            vec!["mem://s0", "mem://s1", "mem://s0", "mem://s1", "mem://m"]
        );
        let begins: Vec<String> = driver
            .requests()
            .into_iter()
            .filter(|r| r.operation == Operation::Begin)
            .map(|r| r.dsn)
            .collect();
        assert_eq!(begins, vec!["mem://m"]);
    }
}
