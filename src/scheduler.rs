//! Polling scheduler
//!
//! Periodic re-fetch for subscriptions whose endpoint declares a poll interval.
//! One tokio task per subscription ticks on an interval and hands each tick to
//! its own child task, so a slow poll never delays the next one. Overlapping
//! polls share one call through the executor.

use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A running poll loop
///
/// Dropping the timer cancels it together with any poll still in flight.
#[derive(Debug)]
pub struct PollTimer {
    interval: Duration,
    task: JoinHandle<()>,
}

impl PollTimer {
    /// Starts calling `tick` every `interval`, the first call one interval from now
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut polls = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        polls.spawn(tick());
                    }
                    Some(_) = polls.join_next(), if !polls.is_empty() => {}
                }
            }
        });

        Self { interval, task }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
