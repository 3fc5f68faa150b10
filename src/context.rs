//! Request context.
//!
//! A [`Context`] travels with every operation. It carries the request identity
//! (request id, process id, principal), request-scoped locals (endpoint
//! override, the address of the active transaction) and the deadline and
//! cancellation signal every blocking call must honour.
//!
//! Clones share locals and cancellation: they describe the same request.

use crate::core::{DacError, Result};
use crate::transaction::{Transaction, TransactionId};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

lazy_static! {
    static ref PROCESS_ID: String = uuid::Uuid::new_v4().to_string();
}

/// Identity of the running process.
pub fn process_id() -> &'static str {
    &PROCESS_ID
}

/// The authenticated identity on whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    id: String,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.id.parse().ok()
    }
}

/// Where a transaction lives: its id, the endpoint instance that owns it and
/// the process that opened it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAddress {
    pub id: TransactionId,
    pub endpoint_id: String,
    pub origin: String,
}

#[derive(Default)]
struct Locals {
    endpoint: Option<String>,
    transaction: Option<TransactionAddress>,
    local: Option<Arc<Transaction>>,
}

struct Identity {
    request_id: Option<Vec<u8>>,
    process_id: String,
    principal: Option<Principal>,
    internal: bool,
}

#[derive(Clone)]
pub struct Context {
    identity: Arc<Identity>,
    locals: Arc<Mutex<Locals>>,
    cancel: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A fresh internal context for the current process.
    pub fn new() -> Self {
        Self::for_process(process_id())
    }

    /// A context whose requests originate from `process_id`. Used by the
    /// endpoint runtime when a request crosses into another process.
    pub fn for_process(process_id: impl Into<String>) -> Self {
        Self::build(Identity {
            request_id: None,
            process_id: process_id.into(),
            principal: None,
            internal: true,
        })
    }

    /// A context for a request that arrived from outside the cluster.
    pub fn external() -> Self {
        Self::build(Identity {
            request_id: None,
            process_id: process_id().to_string(),
            principal: None,
            internal: false,
        })
    }

    fn build(identity: Identity) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            identity: Arc::new(identity),
            locals: Arc::new(Mutex::new(Locals::default())),
            cancel: Arc::new(cancel),
            deadline: None,
        }
    }

    fn with_identity(&self, update: impl FnOnce(&mut Identity)) -> Self {
        let mut identity = Identity {
            request_id: self.identity.request_id.clone(),
            process_id: self.identity.process_id.clone(),
            principal: self.identity.principal.clone(),
            internal: self.identity.internal,
        };
        update(&mut identity);
        Self {
            identity: Arc::new(identity),
            locals: self.locals.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }

    pub fn with_request_id(&self, id: impl Into<Vec<u8>>) -> Self {
        let id = id.into();
        self.with_identity(|identity| identity.request_id = Some(id))
    }

    pub fn with_principal(&self, principal: Principal) -> Self {
        self.with_identity(|identity| identity.principal = Some(principal))
    }

    pub fn request_id(&self) -> Option<&[u8]> {
        self.identity.request_id.as_deref()
    }

    pub fn process_id(&self) -> &str {
        &self.identity.process_id
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.identity.principal.as_ref()
    }

    pub fn is_internal(&self) -> bool {
        self.identity.internal
    }

    // ------------------------------------------------------------------------
    // Deadline and cancellation
    // ------------------------------------------------------------------------

    /// Same request, tighter deadline. A deadline is never extended.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut next = self.clone();
        next.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        next
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fails if the context already fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DacError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(DacError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drives `work` until it completes or the context fires, whichever comes
    /// first. When the context fires the future is dropped, which aborts the
    /// underlying call.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let mut cancelled = self.cancel.subscribe();
        let guarded = async {
            tokio::select! {
                result = work => result,
                _ = async {
                    if cancelled.wait_for(|fired| *fired).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                } => Err(DacError::Cancelled),
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .map_err(|_| DacError::DeadlineExceeded)?,
            None => guarded.await,
        }
    }

    // ------------------------------------------------------------------------
    // Request locals
    // ------------------------------------------------------------------------

    /// Addresses a named database among several (`Use`).
    pub fn use_endpoint(&self, name: impl Into<String>) {
        if let Ok(mut locals) = self.locals.lock() {
            locals.endpoint = Some(name.into());
        }
    }

    /// Drops the endpoint override (`Disuse`).
    pub fn disuse_endpoint(&self) {
        if let Ok(mut locals) = self.locals.lock() {
            locals.endpoint = None;
        }
    }

    pub fn endpoint(&self) -> Option<String> {
        self.locals.lock().ok()?.endpoint.clone()
    }

    pub fn transaction_address(&self) -> Option<TransactionAddress> {
        self.locals.lock().ok()?.transaction.clone()
    }

    /// Records the transaction this request participates in. Callers in
    /// other processes use this after receiving the address from the origin.
    pub fn attach_transaction(&self, address: TransactionAddress) {
        if let Ok(mut locals) = self.locals.lock() {
            locals.transaction = Some(address);
            locals.local = None;
        }
    }

    pub(crate) fn attach_local_transaction(
        &self,
        address: TransactionAddress,
        transaction: Arc<Transaction>,
    ) {
        if let Ok(mut locals) = self.locals.lock() {
            locals.transaction = Some(address);
            locals.local = Some(transaction);
        }
    }

    /// In-process handle of the active transaction, if it lives here and is
    /// still open.
    pub(crate) fn local_transaction(&self) -> Option<Arc<Transaction>> {
        let locals = self.locals.lock().ok()?;
        locals.local.clone().filter(|tx| !tx.is_closed())
    }

    pub fn detach_transaction(&self) -> Option<TransactionAddress> {
        let mut locals = self.locals.lock().ok()?;
        locals.local = None;
        locals.transaction.take()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("process_id", &self.identity.process_id)
            .field("internal", &self.identity.internal)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_honours_cancellation() {
        let ctx = Context::new();
        let clone = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            clone.cancel();
        });

        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(DacError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_honours_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(DacError::DeadlineExceeded));
    }

    #[test]
    fn test_deadline_never_extended() {
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        let later = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), later.deadline());
    }

    #[test]
    fn test_locals_shared_between_clones() {
        let ctx = Context::new();
        let clone = ctx.with_principal(Principal::new("42"));
        clone.use_endpoint("reports");
        assert_eq!(ctx.endpoint().as_deref(), Some("reports"));
        ctx.disuse_endpoint();
        assert_eq!(clone.endpoint(), None);
        assert_eq!(clone.principal().and_then(Principal::as_i64), Some(42));
        assert!(ctx.principal().is_none());
    }
}
