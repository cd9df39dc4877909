//! Watcher configuration.
//!
//! Defaults suit configuration files mounted into a container. Every field
//! can be overridden from `SNAPWATCH_*` environment variables and then from
//! CLI flags.

use std::time::Duration;

use anyhow::{Context, Result};

/// 10 MiB.
pub const DEFAULT_SOFT_LIMIT: u64 = 10 * 1024 * 1024;

/// Hard limit used when none is configured, as a multiple of the soft limit.
const HARD_LIMIT_FACTOR: u64 = 10;

/// Soft/hard byte ceilings for a single file read. `0` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeLimits {
    pub soft: u64,
    pub hard: u64,
}

/// Immutable once a watcher is constructed.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub soft_limit: u64,
    /// `None` means ten times the soft limit.
    pub hard_limit: Option<u64>,
    /// `None` disables the mtime polling fallback.
    pub poll_interval: Option<Duration>,
    /// Quiet period after the last filesystem event before a reload runs.
    pub debounce: Duration,
    /// Sleep between initial load attempts while the target is missing.
    pub retry_interval: Duration,
    /// Upper bound on the blocking initial load, on top of the caller's token.
    pub initial_timeout: Option<Duration>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            soft_limit: DEFAULT_SOFT_LIMIT,
            hard_limit: None,
            poll_interval: Some(Duration::from_secs(30)),
            debounce: Duration::from_secs(1),
            retry_interval: Duration::from_millis(500),
            initial_timeout: None,
        }
    }
}

impl WatchOptions {
    /// Defaults with `SNAPWATCH_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`WatchOptions::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(soft) = parse_var::<u64>(&lookup, "SNAPWATCH_SOFT_LIMIT_BYTES")? {
            options.soft_limit = soft;
        }
        if let Some(hard) = parse_var::<u64>(&lookup, "SNAPWATCH_HARD_LIMIT_BYTES")? {
            options.hard_limit = Some(hard);
        }
        if let Some(ms) = parse_var::<i64>(&lookup, "SNAPWATCH_POLL_INTERVAL_MS")? {
            options.poll_interval = poll_from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SNAPWATCH_DEBOUNCE_MS")? {
            options.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SNAPWATCH_RETRY_MS")? {
            options.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SNAPWATCH_INITIAL_TIMEOUT_MS")? {
            options.initial_timeout = Some(Duration::from_millis(ms));
        }

        Ok(options)
    }

    /// Override fields from CLI args (only those that were given).
    pub fn with_overrides(
        mut self,
        soft_limit: Option<u64>,
        hard_limit: Option<u64>,
        poll_secs: Option<i64>,
        debounce_ms: Option<u64>,
        timeout_secs: Option<u64>,
    ) -> Self {
        if let Some(soft) = soft_limit {
            self.soft_limit = soft;
        }
        if let Some(hard) = hard_limit {
            self.hard_limit = Some(hard);
        }
        if let Some(secs) = poll_secs {
            self.poll_interval = poll_from_millis(secs.saturating_mul(1000));
        }
        if let Some(ms) = debounce_ms {
            self.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = timeout_secs {
            self.initial_timeout = Some(Duration::from_secs(secs));
        }
        self
    }

    /// Effective byte limits handed to the bounded reader.
    pub fn limits(&self) -> SizeLimits {
        SizeLimits {
            soft: self.soft_limit,
            hard: self
                .hard_limit
                .unwrap_or_else(|| self.soft_limit.saturating_mul(HARD_LIMIT_FACTOR)),
        }
    }
}

/// Zero or negative disables polling.
fn poll_from_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn parse_var<V>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<V>>
where
    V: std::str::FromStr,
    V::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("parsing {}={:?}", key, raw)),
        _ => Ok(None),
    }
}
