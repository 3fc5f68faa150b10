use super::{Transaction, TransactionId, TransactionState};
use crate::core::{DacError, Result};
use crate::database::Session;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Finished ids remembered for late callers.
const TOMBSTONES: usize = 4096;

/// Reaper period as a multiple of the transaction max age.
const REAP_FACTOR: u32 = 10;

pub struct TransactionGroup {
    entries: RwLock<HashMap<TransactionId, Arc<Transaction>>>,
    tombstones: Mutex<LruCache<TransactionId, TransactionState>>,
    max_age: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionGroup {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(LruCache::new(
                NonZeroUsize::new(TOMBSTONES).unwrap_or(NonZeroUsize::MIN),
            )),
            max_age,
            reaper: Mutex::new(None),
        }
    }

    /// A group with its reaper running.
    pub fn start(max_age: Duration) -> Arc<Self> {
        let group = Arc::new(Self::new(max_age));
        group.spawn_reaper();
        group
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn reap_period(&self) -> Duration {
        self.max_age * REAP_FACTOR
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let period = self.reap_period();
        let group: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(group) = group.upgrade() else {
                    break;
                };
                group.reap().await;
            }
        });
        if let Ok(mut reaper) = self.reaper.lock() {
            *reaper = Some(task);
        }
    }

    pub fn get(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.entries.read().ok()?.get(id).cloned()
    }

    /// Registers a freshly begun transaction with one acquire.
    pub fn put(&self, id: TransactionId, process_id: &str, session: Session) -> Result<Arc<Transaction>> {
        let mut entries = self.entries.write()?;
        if entries.contains_key(&id) {
            return Err(DacError::database(
                "begin",
                format!("transaction '{}' already exists", id),
            ));
        }
        let transaction = Arc::new(Transaction::new(id.clone(), process_id, session, self.max_age));
        entries.insert(id.clone(), transaction.clone());
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.pop(&id);
        }
        tracing::debug!(transaction = %id, origin = process_id, "transaction registered");
        Ok(transaction)
    }

    /// Removes the transaction, rolling it back first if still open.
    pub async fn remove(&self, id: &TransactionId) {
        if let Some(transaction) = self.get_and_remove(id) {
            if let Err(err) = transaction.rollback().await {
                tracing::warn!(transaction = %id, error = %err, "rollback on remove failed");
            }
        }
    }

    /// Takes the transaction out of the group.
    pub fn get_and_remove(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        let removed = self.entries.write().ok()?.remove(id)?;
        self.bury(id, removed.state());
        Some(removed)
    }

    /// Drops a finished transaction, remembering how it ended.
    pub fn forget(&self, id: &TransactionId) {
        if let Some(removed) = self.entries.write().ok().and_then(|mut entries| entries.remove(id)) {
            self.bury(id, removed.state());
        }
    }

    fn bury(&self, id: &TransactionId, state: TransactionState) {
        // Removed while still active: it was rolled back on the way out.
        let state = if state.is_active() {
            TransactionState::RolledBack
        } else {
            state
        };
        if let Ok(mut tombstones) = self.tombstones.lock() {
            tombstones.put(id.clone(), state);
        }
    }

    /// How a recently finished transaction ended.
    pub fn tombstone(&self, id: &TransactionId) -> Option<TransactionState> {
        self.tombstones.lock().ok()?.peek(id).copied()
    }

    /// Error for an id that is not (or no longer) in the group.
    pub fn missing(&self, id: &TransactionId) -> DacError {
        self.tombstone(id)
            .and_then(|state| state.error(id))
            .unwrap_or(DacError::TransactionAbsent)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rolls back and removes every transaction past its deadline. Returns
    /// how many were reaped.
    pub async fn reap(&self) -> usize {
        let expired: Vec<Arc<Transaction>> = match self.entries.write() {
            Ok(mut entries) => {
                let ids: Vec<TransactionId> = entries
                    .iter()
                    .filter(|(_, tx)| tx.is_expired() || tx.is_closed())
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter().filter_map(|id| entries.remove(id)).collect()
            }
            Err(_) => return 0,
        };
        for transaction in &expired {
            transaction.expire().await;
            self.bury(transaction.id(), transaction.state());
        }
        if !expired.is_empty() {
            tracing::info!(reaped = expired.len(), remaining = self.len(), "transaction reaper sweep");
        }
        expired.len()
    }

    /// Stops the reaper and rolls back everything still open.
    pub async fn close(&self) {
        if let Some(task) = self.reaper.lock().ok().and_then(|mut reaper| reaper.take()) {
            task.abort();
        }
        let open: Vec<Arc<Transaction>> = match self.entries.write() {
            Ok(mut entries) => entries.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        };
        for transaction in open {
            if let Err(err) = transaction.rollback().await {
                tracing::warn!(transaction = %transaction.id(), error = %err, "rollback on close failed");
            }
            self.bury(transaction.id(), transaction.state());
        }
    }
}

impl Drop for TransactionGroup {
    fn drop(&mut self) {
        if let Some(task) = self.reaper.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}
