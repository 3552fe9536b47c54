//! Scriptable in-memory connections for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::connection::{Connection, Connector};
use crate::errors::PoolError;
use crate::state::ConnectivityState;
use crate::transport::TransportOptions;

#[derive(Debug)]
pub(crate) struct MockConnection {
    pub id: u64,
    pub target: String,
    state: watch::Sender<ConnectivityState>,
    close_calls: AtomicUsize,
    fail_close: bool,
}

impl MockConnection {
    pub fn set_state(&self, state: ConnectivityState) {
        self.state.send_replace(state);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState {
        let mut rx = self.state.subscribe();
        let next = match rx.wait_for(|state| *state != from).await {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Shutdown,
        };
        next
    }

    async fn close(&self) -> Result<(), PoolError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectivityState::Shutdown);
        if self.fail_close {
            return Err(PoolError::connection_failed(&self.target, "close refused"));
        }
        Ok(())
    }
}

/// Dials [`MockConnection`]s and records every one it hands out.
#[derive(Default)]
pub(crate) struct MockConnector {
    next_id: AtomicU64,
    dials: AtomicUsize,
    /// 1-based dial numbers that fail.
    failing_dials: Mutex<HashSet<usize>>,
    fail_all: std::sync::atomic::AtomicBool,
    failing_closes: Mutex<HashSet<u64>>,
    delay: Mutex<Option<Duration>>,
    /// Per-dial delays, overriding `delay`.
    dial_delays: Mutex<HashMap<usize, Duration>>,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_dial(&self, n: usize) {
        self.failing_dials.lock().insert(n);
    }

    pub fn fail_all_dials(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Closing the connection with this id reports an error.
    pub fn fail_close_of(&self, id: u64) {
        self.failing_closes.lock().insert(id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn delay_dial(&self, n: usize, delay: Duration) {
        self.dial_delays.lock().insert(n, delay);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(
        &self,
        target: &str,
        _options: &TransportOptions,
    ) -> Result<Arc<MockConnection>, PoolError> {
        let dial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self
            .dial_delays
            .lock()
            .get(&dial)
            .copied()
            .or(*self.delay.lock());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all.load(Ordering::SeqCst) || self.failing_dials.lock().contains(&dial) {
            return Err(PoolError::connection_failed(target, format!("dial {} refused", dial)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (state, _) = watch::channel(ConnectivityState::Ready);
        let conn = Arc::new(MockConnection {
            id,
            target: target.to_string(),
            state,
            close_calls: AtomicUsize::new(0),
            fail_close: self.failing_closes.lock().contains(&id),
        });
        self.created.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}
