//! Error taxonomy for loading and watching.
//!
//! Only the initial load ever surfaces these to a caller. Once a watcher is
//! live, reload errors are logged and counted, never returned.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Boxed error returned by a caller-supplied parser.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Stat, open or read failure. A missing path lands here too.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("{}: {size} bytes exceeds the hard limit of {limit} bytes", .path.display())]
    SizeLimitExceeded { path: PathBuf, size: u64, limit: u64 },

    #[error("parsing {}: {source}", .path.display())]
    Parser {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// `last` is empty when cancellation came before the first attempt.
    #[error("cancelled before {} could be loaded", .path.display())]
    Cancelled {
        path: PathBuf,
        #[source]
        last: Option<Box<WatchError>>,
    },

    #[error("timed out after {after:?} waiting for {}: {last}", .path.display())]
    Timeout {
        path: PathBuf,
        after: Duration,
        #[source]
        last: Box<WatchError>,
    },

    #[error("filesystem notifier: {0}")]
    Notify(#[from] notify::Error),

    #[error("load task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl WatchError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        WatchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn parser(path: &Path, source: anyhow::Error) -> Self {
        WatchError::Parser {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    /// True when the target does not exist (yet). The initial load retries these.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WatchError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}
