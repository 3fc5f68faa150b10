//! Prepared-statement cache of one connection.
//!
//! An LRU keyed by SQL text. Concurrent first prepares of the same SQL are
//! single-flighted. An evicted statement is marked closed at once, but the
//! driver statement is only closed when its last lease is dropped or the
//! evict timeout elapses, whichever comes first. A caller that finds a closed
//! entry looks the SQL up again.

use crate::argument::Argument;
use crate::core::{DacError, Result, SingleFlight};
use crate::driver::{Connection, Cursor, ExecResult, Statement};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Attempts at leasing a statement that keeps getting evicted underneath.
const LEASE_ATTEMPTS: usize = 3;

pub struct CachedStatement {
    statement: Arc<dyn Statement>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl CachedStatement {
    fn new(statement: Arc<dyn Statement>) -> Self {
        Self {
            statement,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn lease(self: &Arc<Self>) -> Option<StatementLease> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let lease = StatementLease {
            cached: self.clone(),
        };
        if self.is_closed() {
            // Dropping the lease undoes the increment.
            return None;
        }
        Some(lease)
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Marks the statement closed, waits for in-flight users up to
    /// `timeout`, then closes the driver statement.
    async fn close_when_idle(self: Arc<Self>, timeout: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                log::warn!(
                    "forcing close of statement with {} users after {:?}: {}",
                    self.in_flight(),
                    timeout,
                    self.statement.sql()
                );
                break;
            }
        }
        if let Err(err) = self.statement.close().await {
            tracing::warn!(sql = self.statement.sql(), error = %err, "closing cached statement failed");
        }
    }
}

/// A counted use of a cached statement.
pub struct StatementLease {
    cached: Arc<CachedStatement>,
}

impl StatementLease {
    pub fn sql(&self) -> &str {
        self.cached.statement.sql()
    }

    pub async fn query(&self, args: &[Argument]) -> Result<Box<dyn Cursor>> {
        self.cached.statement.query(args).await
    }

    pub async fn execute(&self, args: &[Argument]) -> Result<ExecResult> {
        self.cached.statement.execute(args).await
    }
}

impl Drop for StatementLease {
    fn drop(&mut self) {
        self.cached.release();
    }
}

pub struct StatementCache {
    entries: Mutex<LruCache<String, Arc<CachedStatement>>>,
    flights: SingleFlight<String, Arc<CachedStatement>>,
    evict_timeout: Duration,
}

impl StatementCache {
    pub fn new(capacity: usize, evict_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            flights: SingleFlight::new(),
            evict_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains(sql))
            .unwrap_or(false)
    }

    /// Leases the statement for `sql`, preparing it on `connection` first
    /// when it is not cached.
    pub async fn get(&self, connection: &Arc<dyn Connection>, sql: &str) -> Result<StatementLease> {
        for _ in 0..LEASE_ATTEMPTS {
            let cached = self.entries.lock()?.get(sql).cloned();
            let cached = match cached {
                Some(cached) => cached,
                None => self.prepare(connection, sql).await?,
            };
            if let Some(lease) = cached.lease() {
                return Ok(lease);
            }
            self.forget(sql, &cached)?;
        }
        Err(DacError::database("prepare", "statement evicted while leasing").with_sql(sql))
    }

    async fn prepare(&self, connection: &Arc<dyn Connection>, sql: &str) -> Result<Arc<CachedStatement>> {
        let connection = connection.clone();
        let text = sql.to_string();
        let prepared = self
            .flights
            .run(sql.to_string(), move || async move {
                let statement = connection
                    .prepare(&text)
                    .await
                    .map_err(|err| err.wrap("prepare").with_sql(&text))?;
                Ok(Arc::new(CachedStatement::new(statement)))
            })
            .await?;

        let evicted = {
            let mut entries = self.entries.lock()?;
            if let Some(existing) = entries.get(sql) {
                if Arc::ptr_eq(existing, &prepared) {
                    return Ok(prepared);
                }
            }
            entries.push(sql.to_string(), prepared.clone())
        };
        if let Some((key, old)) = evicted {
            if !Arc::ptr_eq(&old, &prepared) {
                tracing::debug!(sql = %key, "evicting cached statement");
                tokio::spawn(old.close_when_idle(self.evict_timeout));
            }
        }
        Ok(prepared)
    }

    fn forget(&self, sql: &str, stale: &Arc<CachedStatement>) -> Result<()> {
        let mut entries = self.entries.lock()?;
        if entries.peek(sql).is_some_and(|current| Arc::ptr_eq(current, stale)) {
            entries.pop(sql);
        }
        Ok(())
    }

    /// Evicts one entry.
    pub async fn evict(&self, sql: &str) {
        let removed = self.entries.lock().ok().and_then(|mut entries| entries.pop(sql));
        if let Some(cached) = removed {
            cached.close_when_idle(self.evict_timeout).await;
        }
    }

    /// Closes every cached statement, waiting for in-flight users.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<CachedStatement>> = match self.entries.lock() {
            Ok(mut entries) => {
                let mut drained = Vec::with_capacity(entries.len());
                while let Some((_, cached)) = entries.pop_lru() {
                    drained.push(cached);
                }
                drained
            }
            Err(_) => Vec::new(),
        };
        for cached in drained {
            cached.close_when_idle(self.evict_timeout).await;
        }
    }
}
