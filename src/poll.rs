//! Mtime polling fallback.
//!
//! Bind-mount swaps replace a directory without the notifier seeing
//! anything. A periodic stat of the target catches those.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Periodic tick, or nothing at all when polling is disabled.
#[derive(Debug)]
pub struct Poller {
    interval: Option<Interval>,
}

impl Poller {
    /// Must be called inside a tokio runtime. The first tick lands one
    /// full period from now.
    pub fn new(period: Option<Duration>) -> Self {
        let interval = period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

/// Whether `path` was modified after `last`. An unreadable path counts as
/// unchanged: there is nothing newer to load from it.
pub fn modified_since(path: &Path, last: SystemTime) -> bool {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime > last,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Poll stat failed");
            false
        }
    }
}
