use super::{Database, Handle, PoolStats, Session};
use crate::argument::Argument;
use crate::config::Kind;
use crate::context::Context;
use crate::core::Result;
use crate::driver::{ExecResult, TransactionOptions};
use crate::rows::Rows;
use async_trait::async_trait;

/// A single handle serving reads, writes and transactions.
pub struct Standalone {
    handle: Handle,
}

impl Standalone {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Database for Standalone {
    fn kind(&self) -> Kind {
        Kind::Standalone
    }

    async fn begin(&self, ctx: &Context, options: TransactionOptions) -> Result<Session> {
        self.handle.begin(ctx, options).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
        self.handle.query(ctx, sql, args).await
    }

    async fn execute(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        self.handle.execute(ctx, sql, args).await
    }

    async fn close(&self, _ctx: &Context) -> Result<()> {
        self.handle.close().await;
        Ok(())
    }

    async fn stats(&self) -> Vec<PoolStats> {
        vec![self.handle.stats().await]
    }
}
