use crate::argument::Argument;
use crate::core::{DacError, Result};
use crate::database::Session;
use crate::driver::ExecResult;
use crate::rows::Rows;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Identifier of a transaction, shared by every process taking part in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// A fresh random id.
    pub fn new() -> Self {
        TransactionId(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The id carried by an inbound request, or a fresh one.
    pub fn from_request(request_id: Option<&[u8]>) -> Self {
        match request_id {
            Some(bytes) if !bytes.is_empty() => TransactionId(String::from_utf8_lossy(bytes).into_owned()),
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        TransactionId(id.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        TransactionId(id)
    }
}

/// Lifecycle of a transaction.
///
/// ```text
/// Active ──commit (last acquire)──> Committed
///   │
///   ├──rollback──> RolledBack
///   │
///   └──deadline──> TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    TimedOut,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Error reported to callers addressing a transaction in this state.
    pub fn error(&self, id: &TransactionId) -> Option<DacError> {
        match self {
            TransactionState::Active => None,
            TransactionState::TimedOut => Some(DacError::TransactionTimeout(id.to_string())),
            TransactionState::Committed | TransactionState::RolledBack => {
                Some(DacError::TransactionClosed(id.to_string()))
            }
        }
    }
}

struct Inner {
    acquires: usize,
    state: TransactionState,
}

/// A transaction owned by the group.
pub struct Transaction {
    id: TransactionId,
    process_id: String,
    deadline: Instant,
    session: Session,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl Transaction {
    pub fn new(id: TransactionId, process_id: impl Into<String>, session: Session, max_age: Duration) -> Self {
        Self {
            id,
            process_id: process_id.into(),
            deadline: Instant::now() + max_age,
            session,
            inner: Mutex::new(Inner {
                acquires: 1,
                state: TransactionState::Active,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Process that opened the transaction.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransactionState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(TransactionState::RolledBack)
    }

    pub fn acquires(&self) -> usize {
        self.inner.lock().map(|inner| inner.acquires).unwrap_or(0)
    }

    fn closed_error(&self, state: TransactionState) -> DacError {
        state
            .error(&self.id)
            .unwrap_or_else(|| DacError::TransactionClosed(self.id.to_string()))
    }

    /// Moves an active transaction to `state`; `false` if it already left
    /// the active state.
    fn finish(&self, state: TransactionState) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        if !inner.state.is_active() {
            return Ok(false);
        }
        inner.state = state;
        self.closed.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.inner.lock()?.state;
        if !state.is_active() {
            return Err(self.closed_error(state));
        }
        if self.is_expired() {
            return Err(DacError::TransactionTimeout(self.id.to_string()));
        }
        Ok(())
    }

    /// Joins the transaction once more; each acquire is released by one
    /// commit.
    pub fn acquire(&self) -> Result<usize> {
        let mut inner = self.inner.lock()?;
        if !inner.state.is_active() {
            return Err(self.closed_error(inner.state));
        }
        inner.acquires += 1;
        Ok(inner.acquires)
    }

    /// Releases one acquire on behalf of `process_id`. Returns `true` only
    /// when this call ran the database commit, which requires the origin
    /// process releasing the last acquire. A non-origin caller only drops
    /// the acquire it took and never finishes the transaction.
    pub async fn commit(&self, process_id: &str) -> Result<bool> {
        if self.is_expired() {
            self.expire().await;
            return Err(DacError::TransactionTimeout(self.id.to_string()));
        }
        {
            let mut inner = self.inner.lock()?;
            if !inner.state.is_active() {
                return Err(self.closed_error(inner.state));
            }
            if process_id != self.process_id {
                if inner.acquires > 1 {
                    inner.acquires -= 1;
                }
                tracing::debug!(transaction = %self.id, from = process_id, "commit from non-origin process ignored");
                return Ok(false);
            }
            inner.acquires = inner.acquires.saturating_sub(1);
            if inner.acquires > 0 {
                return Ok(false);
            }
        }

        if !self.finish(TransactionState::Committed)? {
            return Err(self.closed_error(self.state()));
        }
        match self.session.commit().await {
            Ok(()) => {
                tracing::info!(transaction = %self.id, "transaction committed");
                Ok(true)
            }
            Err(err) => Err(err.with_transaction(self.id.as_str())),
        }
    }

    /// Rolls back regardless of outstanding acquires. Rolling back a
    /// finished transaction does nothing.
    pub async fn rollback(&self) -> Result<()> {
        if !self.finish(TransactionState::RolledBack)? {
            return Ok(());
        }
        tracing::info!(transaction = %self.id, "transaction rolled back");
        self.session
            .rollback()
            .await
            .map_err(|err| err.with_transaction(self.id.as_str()))
    }

    /// Rolls back a transaction that outlived its deadline.
    pub(crate) async fn expire(&self) {
        if matches!(self.finish(TransactionState::TimedOut), Ok(true)) {
            tracing::warn!(transaction = %self.id, "transaction timed out, rolling back");
            if let Err(err) = self.session.rollback().await {
                tracing::warn!(transaction = %self.id, error = %err, "rollback of timed out transaction failed");
            }
        }
    }

    pub async fn query(&self, sql: &str, args: &[Argument]) -> Result<Rows> {
        self.ensure_active()?;
        let result = self.session.query(sql, args).await;
        self.after_io(result).await
    }

    pub async fn execute(&self, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        self.ensure_active()?;
        let result = self.session.execute(sql, args).await;
        self.after_io(result).await
    }

    /// A database failure ends the transaction.
    async fn after_io<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(err @ DacError::DatabaseError { .. }) => {
                if let Err(rollback) = self.rollback().await {
                    tracing::warn!(transaction = %self.id, error = %rollback, "rollback after failure failed");
                }
                Err(err.with_transaction(self.id.as_str()))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("state", &self.state())
            .field("acquires", &self.acquires())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::database::{Handle, PoolSettings};
    use crate::driver::{Operation, RecordingDriver, Response, TransactionOptions};
    use std::sync::Arc;

    async fn transaction(driver: &Arc<RecordingDriver>, max_age: Duration) -> Transaction {
        let handle = Handle::open(
            driver.clone(),
            "main",
            "mem://tx",
            PoolSettings {
                max_opens: 0,
                max_idles: 2,
                max_idle_time: None,
                max_lifetime: None,
                acquire_timeout: Duration::from_millis(50),
                statements: None,
            },
        );
        let session = handle
            .begin(&Context::new(), TransactionOptions::default())
            .await
            .unwrap();
        Transaction::new(TransactionId::new(), "origin", session, max_age)
    }

    #[test]
    fn test_id_from_request() {
        assert_eq!(TransactionId::from_request(Some(b"req-1")).as_str(), "req-1");
        assert_ne!(TransactionId::from_request(None), TransactionId::from_request(Some(b"")));
    }

    #[tokio::test]
    async fn test_commit_waits_for_last_acquire() {
        let driver = Arc::new(RecordingDriver::new("tx-acquires"));
        let tx = transaction(&driver, Duration::from_secs(10)).await;

        assert_eq!(tx.acquire().unwrap(), 2);
        assert!(!tx.commit("origin").await.unwrap());
        assert_eq!(driver.count(Operation::Commit), 0);
        assert!(tx.commit("origin").await.unwrap());
        assert_eq!(driver.count(Operation::Commit), 1);

        assert!(tx.is_closed());
        assert_eq!(tx.acquire(), Err(DacError::TransactionClosed(tx.id().to_string())));
    }

    #[tokio::test]
    async fn test_non_origin_commit_is_noop() {
        let driver = Arc::new(RecordingDriver::new("tx-foreign"));
        let tx = transaction(&driver, Duration::from_secs(10)).await;

        assert!(!tx.commit("elsewhere").await.unwrap());
        assert!(!tx.is_closed());
        tx.execute("UPDATE t SET a = 1", &[]).await.unwrap();
        assert!(tx.commit("origin").await.unwrap());
        assert_eq!(driver.count(Operation::Commit), 1);
    }

    #[tokio::test]
    async fn test_rollback_ignores_acquires_and_is_idempotent() {
        let driver = Arc::new(RecordingDriver::new("tx-rollback"));
        let tx = transaction(&driver, Duration::from_secs(10)).await;
        tx.acquire().unwrap();

        tx.rollback().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(driver.count(Operation::Rollback), 1);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.query("SELECT 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_commit_reports_timeout() {
        let driver = Arc::new(RecordingDriver::new("tx-expired"));
        let tx = transaction(&driver, Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            tx.commit("origin").await,
            Err(DacError::TransactionTimeout(tx.id().to_string()))
        );
        assert_eq!(tx.state(), TransactionState::TimedOut);
        assert_eq!(driver.count(Operation::Rollback), 1);
    }

    #[tokio::test]
    async fn test_database_failure_closes_transaction() {
        let driver = Arc::new(RecordingDriver::with_handler("tx-failure", |request| {
            match request.operation {
                Operation::Execute => Err(DacError::database("driver", "deadlock detected")),
                _ => Ok(Response::Done),
            }
        }));
        let tx = transaction(&driver, Duration::from_secs(10)).await;

        let err = tx.execute("UPDATE t SET a = 1", &[]).await.unwrap_err();
        match err {
            DacError::DatabaseError { transaction, .. } => {
                assert_eq!(transaction.as_deref(), Some(tx.id().as_str()))
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(tx.is_closed());
        assert_eq!(driver.count(Operation::Rollback), 1);
    }
}
