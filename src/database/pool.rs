use super::statements::StatementCache;
use crate::config::Options;
use crate::core::{DacError, Result};
use crate::driver::{Connection, Driver};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Pool limits, taken from the backend options.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// 0 means unlimited.
    pub max_opens: usize,
    pub max_idles: usize,
    pub max_idle_time: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub acquire_timeout: Duration,
    /// Per-connection prepared-statement cache: capacity and evict timeout.
    pub statements: Option<(usize, Duration)>,
}

impl From<&Options> for PoolSettings {
    fn from(options: &Options) -> Self {
        Self {
            max_opens: options.max_opens,
            max_idles: options.max_idles,
            max_idle_time: options.max_idle_time(),
            max_lifetime: options.max_lifetime(),
            acquire_timeout: options.acquire_timeout(),
            statements: options
                .statements
                .enable
                .then(|| (options.statements.cache_size, options.statements.evict_timeout())),
        }
    }
}

/// A connection owned by the pool.
struct PooledConnection {
    connection: Arc<dyn Connection>,
    statements: Option<Arc<StatementCache>>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Arc<dyn Connection>, statements: Option<Arc<StatementCache>>) -> Self {
        let now = Instant::now();
        Self {
            connection,
            statements,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.last_used.elapsed() > timeout)
    }

    fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }

    async fn close(self) {
        if let Some(statements) = &self.statements {
            statements.close_all().await;
        }
        if let Err(err) = self.connection.close().await {
            tracing::warn!(error = %err, "closing pooled connection failed");
        }
    }
}

struct PoolShared {
    label: String,
    settings: PoolSettings,
    available: Mutex<VecDeque<PooledConnection>>,
    total: AtomicUsize,
    closed: AtomicBool,
}

impl PoolShared {
    /// Returns a connection, closing it instead when the pool is closed, the
    /// idle list is full or the connection outlived its lifetime.
    async fn put(&self, mut pooled: PooledConnection) {
        let keep = !self.closed.load(Ordering::SeqCst) && !pooled.is_expired(self.settings.max_lifetime);
        if keep {
            let mut available = self.available.lock().await;
            if available.len() < self.settings.max_idles {
                pooled.refresh_last_used();
                available.push_back(pooled);
                return;
            }
        }
        self.total.fetch_sub(1, Ordering::SeqCst);
        pooled.close().await;
    }

    fn forget(&self, pooled: PooledConnection) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(pooled.close());
        }
    }
}

/// Connection pool over one DSN.
pub struct Pool {
    driver: Arc<dyn Driver>,
    dsn: String,
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Connections are opened lazily on first acquire.
    pub fn new(driver: Arc<dyn Driver>, label: &str, dsn: &str, settings: PoolSettings) -> Self {
        Self {
            driver,
            dsn: dsn.to_string(),
            shared: Arc::new(PoolShared {
                label: label.to_string(),
                settings,
                available: Mutex::new(VecDeque::new()),
                total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Get a connection from the pool, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(DacError::database("acquire", "pool is closed").with_endpoint(self.label()));
            }

            if let Some(mut pooled) = self.try_get_available().await {
                pooled.refresh_last_used();
                return Ok(PoolGuard::new(pooled, self.shared.clone()));
            }

            if let Some(pooled) = self.try_create_connection().await? {
                return Ok(PoolGuard::new(pooled, self.shared.clone()));
            }

            if start.elapsed() > self.shared.settings.acquire_timeout {
                return Err(DacError::database(
                    "acquire",
                    "connection pool timeout: no connections available",
                )
                .with_endpoint(self.label()));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Pops an idle connection, evicting the expired and idle-too-long ones.
    async fn try_get_available(&self) -> Option<PooledConnection> {
        let settings = &self.shared.settings;
        let (found, evicted) = {
            let mut available = self.shared.available.lock().await;
            let mut kept = VecDeque::with_capacity(available.len());
            let mut evicted = Vec::new();
            while let Some(pooled) = available.pop_front() {
                if pooled.is_expired(settings.max_lifetime)
                    || pooled.is_idle_too_long(settings.max_idle_time)
                {
                    evicted.push(pooled);
                } else {
                    kept.push_back(pooled);
                }
            }
            *available = kept;
            (available.pop_front(), evicted)
        };

        if !evicted.is_empty() {
            tracing::debug!(pool = self.label(), evicted = evicted.len(), "evicting stale connections");
            self.shared.total.fetch_sub(evicted.len(), Ordering::SeqCst);
            for pooled in evicted {
                pooled.close().await;
            }
        }
        found
    }

    /// Opens a new connection if under the limit.
    async fn try_create_connection(&self) -> Result<Option<PooledConnection>> {
        let max_opens = self.shared.settings.max_opens;
        let reserved = self
            .shared
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (max_opens == 0 || total < max_opens).then_some(total + 1)
            });
        if reserved.is_err() {
            return Ok(None);
        }

        match self.driver.connect(&self.dsn).await {
            Ok(connection) => {
                let statements = self
                    .shared
                    .settings
                    .statements
                    .map(|(capacity, timeout)| Arc::new(StatementCache::new(capacity, timeout)));
                tracing::debug!(pool = self.label(), driver = self.driver.name(), "connection opened");
                Ok(Some(PooledConnection::new(Arc::from(connection), statements)))
            }
            Err(err) => {
                self.shared.total.fetch_sub(1, Ordering::SeqCst);
                Err(err.wrap("connect").with_endpoint(self.label()))
            }
        }
    }

    /// Closes idle connections and refuses further acquires. Connections in
    /// use are closed when their guards return them.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PooledConnection> = self.shared.available.lock().await.drain(..).collect();
        self.shared.total.fetch_sub(drained.len(), Ordering::SeqCst);
        for pooled in drained {
            pooled.close().await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.shared.available.lock().await;
        let total = self.shared.total.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.shared.settings.max_opens,
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    /// 0 means unlimited.
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped. A guard dropped while a
/// transaction is open cannot roll back synchronously, so the connection is
/// discarded instead; use [`PoolGuard::release`].
pub struct PoolGuard {
    connection: Arc<dyn Connection>,
    pooled: Option<PooledConnection>,
    shared: Arc<PoolShared>,
    in_transaction: bool,
}

impl PoolGuard {
    fn new(pooled: PooledConnection, shared: Arc<PoolShared>) -> Self {
        Self {
            connection: pooled.connection.clone(),
            pooled: Some(pooled),
            shared,
            in_transaction: false,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn statements(&self) -> Option<&Arc<StatementCache>> {
        self.pooled.as_ref().and_then(|pooled| pooled.statements.as_ref())
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Returns the connection to the pool, rolling back an open transaction
    /// first. A connection whose rollback fails is discarded.
    pub async fn release(mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        if self.in_transaction {
            if let Err(err) = pooled.connection.rollback().await {
                tracing::warn!(pool = %self.shared.label, error = %err, "rollback on release failed");
                self.shared.total.fetch_sub(1, Ordering::SeqCst);
                pooled.close().await;
                return;
            }
        }
        self.shared.put(pooled).await;
    }

    /// Closes the connection instead of returning it.
    pub async fn discard(mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
            pooled.close().await;
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(mut pooled) = self.pooled.take() else {
            return;
        };

        if self.in_transaction {
            log::warn!(
                "PoolGuard for '{}' dropped with an open transaction; connection discarded. Use release().await.",
                self.shared.label
            );
            self.shared.forget(pooled);
            return;
        }

        let closed = self.shared.closed.load(Ordering::SeqCst);
        if !closed && !pooled.is_expired(self.shared.settings.max_lifetime) {
            if let Ok(mut available) = self.shared.available.try_lock() {
                if available.len() < self.shared.settings.max_idles {
                    pooled.refresh_last_used();
                    available.push_back(pooled);
                    return;
                }
            } else {
                log::warn!(
                    "PoolGuard for '{}' dropped while the pool lock was busy; connection discarded. Use release().await.",
                    self.shared.label
                );
            }
        }
        self.shared.forget(pooled);
    }
}
