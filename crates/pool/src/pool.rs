//! Fixed-size connection pool for a single remote target.
//!
//! A pool keeps exactly `pool_size` live connections in indexed slots and
//! provides:
//!
//! - **Round-robin selection**: `get()` hands out slots in strict rotation
//! - **Health-aware selection**: `get_healthy()` skips unusable slots and
//!   waits, up to a deadline, for failing ones to recover
//! - **Background repair**: failed, shut down or over-aged connections are
//!   redialed and swapped in place
//! - **Statistics**: consistent per-state snapshots for health endpoints
//!
//! Slots are never empty. Repair dials without holding the slot lock and
//! applies all replacements of a pass under a single write lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use rpcpool_config::PoolDefaults;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Connector};
use crate::errors::PoolError;
use crate::grpc::GrpcConnector;
use crate::scheduler::{IntervalScheduler, Scheduler, Ticker};
use crate::state::ConnectivityState;
use crate::transport::{ExtraOption, TransportOptions};

/// Pool size used when none (or zero) is configured.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Period of the background repair pass.
pub const DEFAULT_REPAIR_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Address of the remote endpoint
    pub target: String,
    /// Number of parallel connections; zero means [`DEFAULT_POOL_SIZE`]
    pub pool_size: usize,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Keepalive acknowledgement timeout
    pub keepalive_timeout: Duration,
    /// Unused time after which a connection reports idle
    pub max_idle: Duration,
    /// Age at which a connection becomes due for recycling
    pub max_age: Duration,
    /// Grace period added to `max_age`
    pub max_age_grace: Duration,
    /// Period of the repair pass; zero means [`DEFAULT_REPAIR_INTERVAL`]
    pub repair_interval: Duration,
    /// Transport options passed through to the connector unmodified
    pub extra_options: Vec<ExtraOption>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            max_idle: Duration::from_secs(15 * 60),
            max_age: Duration::from_secs(30 * 60),
            max_age_grace: Duration::from_secs(5),
            repair_interval: DEFAULT_REPAIR_INTERVAL,
            extra_options: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    /// Build a config for `target` from the loaded downstream defaults.
    pub fn from_defaults(target: impl Into<String>, defaults: &PoolDefaults) -> Self {
        let mut extra_options = vec![ExtraOption::ConnectTimeout(Duration::from_secs(
            defaults.connect_timeout_secs,
        ))];
        if let Some(secs) = defaults.request_timeout_secs {
            extra_options.push(ExtraOption::RequestTimeout(Duration::from_secs(secs)));
        }

        Self {
            target: target.into(),
            pool_size: defaults.pool_size,
            keepalive_interval: Duration::from_secs(defaults.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(defaults.keepalive_timeout_secs),
            max_idle: Duration::from_secs(defaults.max_idle_secs),
            max_age: Duration::from_secs(defaults.max_age_secs),
            max_age_grace: Duration::from_secs(defaults.max_age_grace_secs),
            repair_interval: Duration::from_secs(defaults.repair_interval_secs),
            extra_options,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_option(mut self, option: ExtraOption) -> Self {
        self.extra_options.push(option);
        self
    }

    /// The pool size actually used.
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.pool_size
        }
    }

    /// The repair period actually used.
    pub fn effective_repair_interval(&self) -> Duration {
        if self.repair_interval.is_zero() {
            DEFAULT_REPAIR_INTERVAL
        } else {
            self.repair_interval
        }
    }

    /// Options shared by every dial of the pool.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            max_idle: self.max_idle,
            max_age: self.max_age,
            max_age_grace: self.max_age_grace,
            extra: self.extra_options.clone(),
        }
    }
}

/// State of one slot in a [`PoolStats`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStat {
    pub index: usize,
    pub state: ConnectivityState,
}

/// Point-in-time statistics for a pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub target: String,
    pub pool_size: usize,
    pub ready: usize,
    pub idle: usize,
    pub connecting: usize,
    pub transient_failure: usize,
    pub shutdown: usize,
    pub connections: Vec<ConnectionStat>,
}

impl PoolStats {
    /// Tally slot states, in slot order.
    pub fn from_states(
        target: impl Into<String>,
        states: impl IntoIterator<Item = ConnectivityState>,
    ) -> Self {
        let mut stats = PoolStats {
            target: target.into(),
            pool_size: 0,
            ready: 0,
            idle: 0,
            connecting: 0,
            transient_failure: 0,
            shutdown: 0,
            connections: Vec::new(),
        };

        for (index, state) in states.into_iter().enumerate() {
            match state {
                ConnectivityState::Ready => stats.ready += 1,
                ConnectivityState::Idle => stats.idle += 1,
                ConnectivityState::Connecting => stats.connecting += 1,
                ConnectivityState::TransientFailure => stats.transient_failure += 1,
                ConnectivityState::Shutdown => stats.shutdown += 1,
            }
            stats.connections.push(ConnectionStat { index, state });
        }
        stats.pool_size = stats.connections.len();
        stats
    }

    /// At least one connection can take a call.
    pub fn is_healthy(&self) -> bool {
        self.ready + self.idle > 0
    }

    /// Share of usable connections, 0.0 to 100.0.
    pub fn healthy_percentage(&self) -> f64 {
        if self.pool_size == 0 {
            return 0.0;
        }
        ((self.ready + self.idle) as f64 * 100.0) / self.pool_size as f64
    }

    pub fn count(&self, state: ConnectivityState) -> usize {
        match state {
            ConnectivityState::Ready => self.ready,
            ConnectivityState::Idle => self.idle,
            ConnectivityState::Connecting => self.connecting,
            ConnectivityState::TransientFailure => self.transient_failure,
            ConnectivityState::Shutdown => self.shutdown,
        }
    }
}

/// Outcome of one repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Slots found failing, shut down or over-aged
    pub attempted: usize,
    /// Slots that now hold a fresh connection
    pub replaced: usize,
    /// Slots left as they were; retried next pass
    pub failed: usize,
}

struct Slot<C> {
    conn: Arc<C>,
    created_at: Instant,
}

impl<C> Slot<C> {
    fn new(conn: Arc<C>) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
        }
    }
}

struct Slots<C> {
    entries: Vec<Slot<C>>,
    cursor: usize,
}

struct PoolInner<K: Connector> {
    target: String,
    size: usize,
    connector: Arc<K>,
    options: TransportOptions,
    slots: RwLock<Slots<K::Conn>>,
    /// Held for the duration of a repair pass
    repairing: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Connection pool for one remote target.
pub struct ConnectionPool<K: Connector = GrpcConnector> {
    inner: Arc<PoolInner<K>>,
    closed: AtomicBool,
    repair_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool<GrpcConnector> {
    /// Dial `pool_size` gRPC connections to the configured target.
    pub async fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_connector(config, Arc::new(GrpcConnector), &IntervalScheduler).await
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Create a pool using a custom connector and repair scheduler.
    ///
    /// Construction is all-or-nothing: if any dial fails, every connection
    /// created so far is closed and the dial error is returned.
    pub async fn with_connector(
        config: PoolConfig,
        connector: Arc<K>,
        scheduler: &dyn Scheduler,
    ) -> Result<Self, PoolError> {
        let target = config.target.trim().to_string();
        if target.is_empty() {
            return Err(PoolError::InvalidTarget("target address is empty".to_string()));
        }

        let size = config.effective_pool_size();
        let options = config.transport_options();

        info!(target = %target, pool_size = size, "Creating connection pool");

        let mut entries = Vec::with_capacity(size);
        for index in 0..size {
            match connector.connect(&target, &options).await {
                Ok(conn) => {
                    debug!(target = %target, slot = index, "Created connection");
                    entries.push(Slot::new(conn));
                }
                Err(e) => {
                    warn!(
                        target = %target,
                        slot = index,
                        error = %e,
                        "Failed to create connection, discarding partial pool"
                    );
                    for slot in &entries {
                        if let Err(close_err) = slot.conn.close().await {
                            warn!(target = %target, error = %close_err, "Failed to close connection");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let inner = Arc::new(PoolInner {
            target,
            size,
            connector,
            options,
            slots: RwLock::new(Slots { entries, cursor: 0 }),
            repairing: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        let repair_interval = config.effective_repair_interval();
        let ticker = scheduler.ticker(repair_interval);
        let task = tokio::spawn(run_repair_loop(Arc::clone(&inner), ticker));

        info!(
            target = %inner.target,
            pool_size = size,
            repair_interval_secs = repair_interval.as_secs(),
            "Connection pool ready"
        );

        Ok(Self {
            inner,
            closed: AtomicBool::new(false),
            repair_task: Mutex::new(Some(task)),
        })
    }

    /// Next connection in round-robin order, regardless of its state.
    pub fn get(&self) -> Result<Arc<K::Conn>, PoolError> {
        self.ensure_open()?;

        let mut slots = self.inner.slots.write();
        let index = slots.cursor;
        slots.cursor = (index + 1) % self.inner.size;
        trace!(target = %self.inner.target, slot = index, "Selected connection");
        Ok(Arc::clone(&slots.entries[index].conn))
    }

    /// First ready or idle connection, starting at the cursor.
    ///
    /// If none is usable, waits until `deadline` for a failing connection
    /// to recover. Does not move the cursor.
    pub async fn get_healthy(&self, deadline: Instant) -> Result<Arc<K::Conn>, PoolError> {
        self.get_healthy_with_cancel(deadline, &CancellationToken::new())
            .await
    }

    /// [`get_healthy`](Self::get_healthy) that also gives up as soon as
    /// `cancel` fires.
    pub async fn get_healthy_with_cancel(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Arc<K::Conn>, PoolError> {
        self.ensure_open()?;

        let ordered: Vec<Arc<K::Conn>> = {
            let slots = self.inner.slots.read();
            let n = slots.entries.len();
            (0..n)
                .map(|i| Arc::clone(&slots.entries[(slots.cursor + i) % n].conn))
                .collect()
        };

        if let Some(conn) = ordered.iter().find(|conn| conn.state().is_usable()) {
            return Ok(Arc::clone(conn));
        }

        // Wait on every failing slot at once; the first to come back usable
        // wins. Each slot gets one transition.
        let mut waits: FuturesUnordered<_> = ordered
            .iter()
            .filter(|conn| conn.state() == ConnectivityState::TransientFailure)
            .map(|conn| async move {
                let state = conn
                    .wait_for_state_change(ConnectivityState::TransientFailure)
                    .await;
                (conn, state)
            })
            .collect();

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = &mut sleep => break,
                next = waits.next() => match next {
                    Some((conn, state)) if state.is_usable() => return Ok(Arc::clone(conn)),
                    Some(_) => continue,
                    None => break,
                },
            }
        }

        debug!(target = %self.inner.target, "No healthy connection available");
        Err(PoolError::NoHealthyConnection {
            target: self.inner.target.clone(),
        })
    }

    /// All connections in slot order.
    pub fn get_all(&self) -> Vec<Arc<K::Conn>> {
        self.inner
            .slots
            .read()
            .entries
            .iter()
            .map(|slot| Arc::clone(&slot.conn))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Consistent snapshot of every slot's state.
    pub fn get_stats(&self) -> PoolStats {
        let slots = self.inner.slots.read();
        PoolStats::from_states(
            self.inner.target.as_str(),
            slots.entries.iter().map(|slot| slot.conn.state()),
        )
    }

    /// Run a repair pass now instead of waiting for the next tick.
    ///
    /// Returns an empty report if a pass is already running.
    pub async fn repair_now(&self) -> Result<RepairReport, PoolError> {
        self.ensure_open()?;
        Ok(self.inner.repair().await)
    }

    /// Stop the repair task and close every connection.
    ///
    /// Close errors are collected rather than short-circuited. Closing an
    /// already closed pool succeeds without touching the connections.
    pub async fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(target = %self.inner.target, "Closing connection pool");
        self.inner.shutdown.cancel();

        let task = self.repair_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(target = %self.inner.target, error = %e, "Repair task ended abnormally");
            }
        }

        // a manual pass may still be swapping slots
        let _repairing = self.inner.repairing.lock().await;

        let mut failures = Vec::new();
        for (index, conn) in self.get_all().into_iter().enumerate() {
            if let Err(e) = conn.close().await {
                warn!(target = %self.inner.target, slot = index, error = %e, "Failed to close connection");
                failures.push(format!("slot {}: {}", index, e));
            }
        }

        if failures.is_empty() {
            info!(target = %self.inner.target, "Connection pool closed");
            Ok(())
        } else {
            Err(PoolError::CloseFailed {
                scope: self.inner.target.clone(),
                failures,
            })
        }
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed {
                target: self.inner.target.clone(),
            });
        }
        Ok(())
    }
}

impl<K: Connector> PoolInner<K> {
    async fn repair(&self) -> RepairReport {
        let Ok(_guard) = self.repairing.try_lock() else {
            debug!(target = %self.target, "Repair pass already running, skipping");
            return RepairReport::default();
        };

        let lifetime = self.options.lifetime();
        let due: Vec<(usize, ConnectivityState)> = {
            let slots = self.slots.read();
            slots
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let state = slot.conn.state();
                    (state.needs_repair() || slot.created_at.elapsed() >= lifetime)
                        .then_some((index, state))
                })
                .collect()
        };

        if due.is_empty() {
            trace!(target = %self.target, "All connections healthy");
            return RepairReport::default();
        }

        debug!(target = %self.target, slots = due.len(), "Repairing connections");

        let dials = due.iter().map(|&(index, state)| async move {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = self.connector.connect(&self.target, &self.options) => Some(result),
            };
            (index, state, result)
        });
        let results = futures::future::join_all(dials).await;

        let mut report = RepairReport {
            attempted: due.len(),
            ..Default::default()
        };
        let mut fresh = Vec::new();
        for (index, state, result) in results {
            match result {
                Some(Ok(conn)) => fresh.push((index, conn)),
                Some(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        target = %self.target,
                        slot = index,
                        state = %state,
                        error = %e,
                        "Failed to repair connection, will retry"
                    );
                }
                None => report.failed += 1,
            }
        }

        if self.shutdown.is_cancelled() {
            // pool is closing; never hand it connections it will not close
            for (index, conn) in fresh {
                if let Err(e) = conn.close().await {
                    warn!(target = %self.target, slot = index, error = %e, "Failed to close unused replacement");
                }
            }
            report.failed = report.attempted;
            return report;
        }

        let retired: Vec<(usize, Arc<K::Conn>)> = {
            let mut slots = self.slots.write();
            fresh
                .into_iter()
                .map(|(index, conn)| {
                    let old = std::mem::replace(&mut slots.entries[index], Slot::new(conn));
                    (index, old.conn)
                })
                .collect()
        };
        report.replaced = retired.len();

        for (index, old) in retired {
            if let Err(e) = old.close().await {
                debug!(target = %self.target, slot = index, error = %e, "Failed to close replaced connection");
            }
            debug!(target = %self.target, slot = index, "Replaced connection");
        }

        if report.replaced > 0 {
            info!(
                target = %self.target,
                replaced = report.replaced,
                failed = report.failed,
                "Repair pass complete"
            );
        }
        report
    }
}

async fn run_repair_loop<K: Connector>(inner: Arc<PoolInner<K>>, mut ticker: Box<dyn Ticker>) {
    loop {
        let ticked = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => false,
            more = ticker.tick() => more,
        };
        if !ticked {
            break;
        }
        inner.repair().await;
    }
    debug!(target = %inner.target, "Repair loop stopped");
}

impl<K: Connector> Drop for ConnectionPool<K> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<K: Connector> std::fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.target)
            .field("size", &self.inner.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}
