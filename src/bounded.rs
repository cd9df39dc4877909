//! Size-bounded file open.
//!
//! The returned reader never yields more than the size observed at open
//! time, so a file that keeps growing mid-read is seen as a consistent
//! prefix rather than a moving target.

use std::fs::File;
use std::io::{self, Read, Take};
use std::path::Path;

use crate::config::SizeLimits;
use crate::error::WatchError;
use crate::metrics::WatchMetrics;

/// A file handle capped at the size it had when opened.
#[derive(Debug)]
pub struct BoundedFile {
    inner: Take<File>,
    size: u64,
}

impl BoundedFile {
    /// Size observed at open time.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for BoundedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Open `path`, enforcing `limits`.
///
/// Past the soft limit the breach is logged and counted but the read goes
/// ahead. Past the hard limit the handle is dropped before any content is
/// handed out.
pub fn open_bounded(
    path: &Path,
    limits: SizeLimits,
    metrics: &WatchMetrics,
) -> Result<BoundedFile, WatchError> {
    let file = File::open(path).map_err(|e| WatchError::io(path, e))?;
    let size = file.metadata().map_err(|e| WatchError::io(path, e))?.len();
    metrics.record_size(path, size);

    if limits.hard > 0 && size > limits.hard {
        metrics.record_hard_limit_violation();
        tracing::error!(
            path = %path.display(),
            size,
            limit = limits.hard,
            "File exceeds hard size limit, refusing to read"
        );
        return Err(WatchError::SizeLimitExceeded {
            path: path.to_path_buf(),
            size,
            limit: limits.hard,
        });
    }

    if limits.soft > 0 && size > limits.soft {
        metrics.record_soft_limit_violation();
        tracing::warn!(
            path = %path.display(),
            size,
            limit = limits.soft,
            "File exceeds soft size limit"
        );
    }

    Ok(BoundedFile {
        inner: file.take(size),
        size,
    })
}
