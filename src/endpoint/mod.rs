// ============================================================================
// Endpoint Functions
// ============================================================================
//
// A database service is exposed under an endpoint name (default `sql`) as a
// fixed set of internal functions:
//
//   begin     {readonly, isolation} -> {id, endpointId, origin}
//   commit    ()                    -> bool
//   rollback  ()                    -> ()
//   query     {sql, args}           -> Rows
//   execute   {sql, args}           -> {affected, lastInsertId}
//   dialect   ()                    -> string
//
// Requests travel as JSON envelopes through the in-process `Runtime`, which
// picks an instance of the name in turn or the instance a transaction is
// pinned to. `Client` is the caller side: it short-circuits to an in-process
// transaction when the context holds one.
//
// ============================================================================

pub mod client;
pub mod runtime;
pub mod service;

use crate::argument::Argument;
use crate::config::IsolationLevel;
use crate::context::Context;
use crate::core::Result;
use crate::driver::ExecResult;
use crate::transaction::{Transaction, TransactionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use client::Client;
pub use runtime::{Envelope, Runtime, runtime};
pub use service::Service;

pub const DEFAULT_ENDPOINT: &str = "sql";

/// The fixed function names.
pub mod functions {
    pub const BEGIN: &str = "begin";
    pub const COMMIT: &str = "commit";
    pub const ROLLBACK: &str = "rollback";
    pub const QUERY: &str = "query";
    pub const EXECUTE: &str = "execute";
    pub const DIALECT: &str = "dialect";

    pub const ALL: [&str; 6] = [BEGIN, COMMIT, ROLLBACK, QUERY, EXECUTE, DIALECT];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginRequest {
    #[serde(default)]
    pub readonly: bool,
    /// `None` uses the service's configured level.
    #[serde(default)]
    pub isolation: Option<IsolationLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginResponse {
    pub id: TransactionId,
    pub endpoint_id: String,
    /// Process that opened the transaction.
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRequest {
    pub sql: String,
    #[serde(default)]
    pub args: Vec<Argument>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub affected: u64,
    pub last_insert_id: i64,
}

impl From<ExecResult> for ExecuteResponse {
    fn from(result: ExecResult) -> Self {
        Self {
            affected: result.rows_affected,
            last_insert_id: result.last_insert_id,
        }
    }
}

impl From<ExecuteResponse> for ExecResult {
    fn from(response: ExecuteResponse) -> Self {
        Self {
            last_insert_id: response.last_insert_id,
            rows_affected: response.affected,
        }
    }
}

/// One registered instance of an endpoint name.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Unique id of this instance; transactions are pinned to it.
    fn id(&self) -> &str;

    async fn handle(&self, ctx: &Context, function: &str, payload: serde_json::Value) -> Result<serde_json::Value>;

    /// The live transaction `id` when this instance runs in the caller's
    /// process.
    fn local_transaction(&self, _id: &TransactionId) -> Option<Arc<Transaction>> {
        None
    }
}
