use super::{Database, Handle, PoolStats, Session, round_robin};
use crate::argument::Argument;
use crate::config::Kind;
use crate::context::Context;
use crate::core::{DacError, Result};
use crate::driver::{ExecResult, TransactionOptions};
use crate::rows::Rows;
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;

/// Equivalent handles; every operation takes the next one in turn.
pub struct Cluster {
    handles: Vec<Handle>,
    next: AtomicUsize,
}

impl Cluster {
    pub fn new(handles: Vec<Handle>) -> Result<Self> {
        if handles.is_empty() {
            return Err(DacError::ConfigInvalid("cluster requires at least one handle".to_string()));
        }
        Ok(Self {
            handles,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> &Handle {
        round_robin(&self.handles, &self.next)
    }
}

#[async_trait]
impl Database for Cluster {
    fn kind(&self) -> Kind {
        Kind::Cluster
    }

    async fn begin(&self, ctx: &Context, options: TransactionOptions) -> Result<Session> {
        self.pick().begin(ctx, options).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
        self.pick().query(ctx, sql, args).await
    }

    async fn execute(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        self.pick().execute(ctx, sql, args).await
    }

    async fn close(&self, _ctx: &Context) -> Result<()> {
        for handle in &self.handles {
            handle.close().await;
        }
        Ok(())
    }

    async fn stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            stats.push(handle.stats().await);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing;
    use crate::driver::RecordingDriver;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_every_operation_rotates() {
        let driver = Arc::new(RecordingDriver::new("cluster-route"));
        let db = Cluster::new(vec![
            testing::handle(&driver, "mem://n0"),
            testing::handle(&driver, "mem://n1"),
            testing::handle(&driver, "mem://n2"),
        ])
        .unwrap();
        let ctx = Context::new();

        db.query(&ctx, "SELECT 1", &[]).await.unwrap();
        db.execute(&ctx, "DELETE FROM t", &[]).await.unwrap();
        db.query(&ctx, "SELECT 1", &[]).await.unwrap();
        db.execute(&ctx, "DELETE FROM t", &[]).await.unwrap();

        assert_eq!(
            testing::routed(&driver),
            vec!["mem://n0", "mem://n1", "mem://n2", "mem://n0"]
        );
    }

    #[test]
    fn test_requires_a_handle() {
        assert!(Cluster::new(Vec::new()).is_err());
    }
}
