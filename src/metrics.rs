//! In-process counters for load and reload activity.
//!
//! Cheap to share (`Arc<WatchMetrics>`), updated with relaxed atomics. The
//! per-path size gauge is the only locked piece and is touched once per
//! file read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Counters for one watcher.
#[derive(Debug, Default)]
pub struct WatchMetrics {
    reloads_ok: AtomicU64,
    reloads_failed: AtomicU64,
    soft_limit_violations: AtomicU64,
    hard_limit_violations: AtomicU64,
    notifier_errors: AtomicU64,
    fs_events: AtomicU64,
    parses: AtomicU64,
    file_sizes: Mutex<BTreeMap<PathBuf, u64>>,
}

/// Point-in-time copy of [`WatchMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub reloads_ok: u64,
    pub reloads_failed: u64,
    pub soft_limit_violations: u64,
    pub hard_limit_violations: u64,
    pub notifier_errors: u64,
    pub fs_events: u64,
    pub parses: u64,
    pub file_sizes: BTreeMap<PathBuf, u64>,
}

impl WatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gauge: last observed size of `path`.
    pub fn record_size(&self, path: &Path, size: u64) {
        if let Ok(mut sizes) = self.file_sizes.lock() {
            sizes.insert(path.to_path_buf(), size);
        }
    }

    pub fn record_soft_limit_violation(&self) {
        self.soft_limit_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hard_limit_violation(&self) {
        self.hard_limit_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload(&self, ok: bool) {
        let counter = if ok {
            &self.reloads_ok
        } else {
            &self.reloads_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notifier_error(&self) {
        self.notifier_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fs_event(&self) {
        self.fs_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse(&self) {
        self.parses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reloads_failed(&self) -> u64 {
        self.reloads_failed.load(Ordering::Relaxed)
    }

    pub fn parses(&self) -> u64 {
        self.parses.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reloads_ok: self.reloads_ok.load(Ordering::Relaxed),
            reloads_failed: self.reloads_failed.load(Ordering::Relaxed),
            soft_limit_violations: self.soft_limit_violations.load(Ordering::Relaxed),
            hard_limit_violations: self.hard_limit_violations.load(Ordering::Relaxed),
            notifier_errors: self.notifier_errors.load(Ordering::Relaxed),
            fs_events: self.fs_events.load(Ordering::Relaxed),
            parses: self.parses.load(Ordering::Relaxed),
            file_sizes: self
                .file_sizes
                .lock()
                .map(|sizes| sizes.clone())
                .unwrap_or_default(),
        }
    }
}

/// Run-length of consecutive reload failures, used to keep logs quiet while
/// a file stays broken.
///
/// Warns on the first failure and every 100th after that; reports the run
/// length on the first success afterwards.
#[derive(Debug, Default)]
pub struct FailureStreak {
    run: AtomicU32,
}

impl FailureStreak {
    /// Returns true if this failure should be logged.
    pub fn record_failure(&self) -> bool {
        let n = self.run.fetch_add(1, Ordering::Relaxed);
        n == 0 || (n + 1) % 100 == 0
    }

    /// Returns the length of the streak that just ended, if any.
    pub fn record_success(&self) -> Option<u32> {
        match self.run.swap(0, Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }
}
