//! Coalescing of raw filesystem events into a single delayed reload.
//!
//! A single deadline is kept; every qualifying event pushes it out by the
//! configured delay. A ConfigMap remount that touches dozens of entries
//! therefore costs one reload, not dozens.

use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use tokio::time::Instant;

/// Backend-neutral classification of a notifier event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Create,
    Write,
    Rename,
    Remove,
    Chmod,
    Other,
}

impl Change {
    pub fn classify(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => Change::Create,
            EventKind::Modify(ModifyKind::Name(_)) => Change::Rename,
            EventKind::Modify(ModifyKind::Metadata(_)) => Change::Chmod,
            // Some backends don't say what changed.
            EventKind::Modify(_) => Change::Write,
            EventKind::Remove(_) => Change::Remove,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Change::Other,
        }
    }

    /// Metadata-only churn and access events never cause a reload.
    pub fn triggers_reload(self) -> bool {
        matches!(
            self,
            Change::Create | Change::Write | Change::Rename | Change::Remove
        )
    }
}

/// At most one pending reload, identified by its deadline.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Arm or re-arm for a qualifying change. Returns whether it did.
    pub fn observe(&mut self, change: Change) -> bool {
        if !change.triggers_reload() {
            return false;
        }
        self.deadline = Some(Instant::now() + self.delay);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the quiet period has elapsed, disarming the timer.
    /// Never resolves while unarmed.
    ///
    /// Safe to drop and recreate across `select!` iterations: the deadline
    /// is only cleared when the sleep actually completes.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
