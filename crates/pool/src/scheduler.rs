//! Triggers for the background repair pass.
//!
//! A pool does not own a timer directly. It asks a [`Scheduler`] for a
//! [`Ticker`] and runs one repair pass per tick, so tests can swap the
//! wall clock for [`ManualScheduler`] and drive passes one at a time.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Source of repair ticks for one pool.
#[async_trait]
pub trait Ticker: Send + 'static {
    /// Wait for the next tick. Returns `false` once the source is exhausted,
    /// which ends the repair loop.
    ///
    /// The loop only calls `tick` again after the previous pass completed.
    async fn tick(&mut self) -> bool;
}

/// Creates a ticker per pool.
pub trait Scheduler: Send + Sync + 'static {
    fn ticker(&self, period: Duration) -> Box<dyn Ticker>;
}

/// Wall-clock scheduler backed by a tokio interval.
///
/// The first tick fires one full period after creation; ticks missed while a
/// slow pass was running are skipped rather than burst.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalScheduler;

struct IntervalTicker(Interval);

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.0.tick().await;
        true
    }
}

impl Scheduler for IntervalScheduler {
    fn ticker(&self, period: Duration) -> Box<dyn Ticker> {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Box::new(IntervalTicker(interval))
    }
}

type TickRequest = oneshot::Sender<()>;

/// Scheduler whose ticks are fired by hand through a [`TickHandle`].
///
/// Each scheduler hands out a single ticker; asking for a second one yields
/// a ticker that is already exhausted.
pub struct ManualScheduler {
    requests: parking_lot::Mutex<Option<mpsc::Receiver<TickRequest>>>,
}

/// Fires ticks for a [`ManualScheduler`].
#[derive(Clone)]
pub struct TickHandle {
    requests: mpsc::Sender<TickRequest>,
}

impl ManualScheduler {
    pub fn new() -> (Self, TickHandle) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                requests: parking_lot::Mutex::new(Some(rx)),
            },
            TickHandle { requests: tx },
        )
    }
}

impl Scheduler for ManualScheduler {
    fn ticker(&self, _period: Duration) -> Box<dyn Ticker> {
        Box::new(ManualTicker {
            requests: self.requests.lock().take(),
            pending: None,
        })
    }
}

struct ManualTicker {
    requests: Option<mpsc::Receiver<TickRequest>>,
    pending: Option<TickRequest>,
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        // being asked again means the pass for the previous tick is done
        if let Some(done) = self.pending.take() {
            let _ = done.send(());
        }
        let Some(requests) = self.requests.as_mut() else {
            return false;
        };
        match requests.recv().await {
            Some(done) => {
                self.pending = Some(done);
                true
            }
            None => false,
        }
    }
}

impl TickHandle {
    /// Fire one tick and wait until the pass it triggered has finished.
    ///
    /// Returns `false` if the repair loop is no longer running.
    pub async fn tick(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.requests.send(done_tx).await.is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_defers_first_tick() {
        let mut ticker = IntervalScheduler.ticker(Duration::from_secs(30));
        let start = Instant::now();
        assert!(ticker.tick().await);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_manual_tick_waits_for_next_poll() {
        let (scheduler, handle) = ManualScheduler::new();
        let mut ticker = scheduler.ticker(Duration::from_secs(30));

        let driver = tokio::spawn(async move {
            let mut passes = 0;
            while ticker.tick().await {
                passes += 1;
                if passes == 2 {
                    // acknowledge the second tick, then stop
                    ticker.tick().await;
                    break;
                }
            }
            passes
        });

        assert!(handle.tick().await);
        assert!(handle.tick().await);
        drop(handle);
        assert_eq!(driver.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_manual_ticker_is_exhausted() {
        let (scheduler, _handle) = ManualScheduler::new();
        let _first = scheduler.ticker(Duration::from_secs(1));
        let mut second = scheduler.ticker(Duration::from_secs(1));
        assert!(!second.tick().await);
    }

    #[tokio::test]
    async fn test_tick_after_loop_stopped() {
        let (scheduler, handle) = ManualScheduler::new();
        drop(scheduler.ticker(Duration::from_secs(1)));
        assert!(!handle.tick().await);
    }
}
