//! Snapshot loading: stat the target, parse it, and work out which paths
//! have to be watched to notice the next change.
//!
//! Loading is pure from the caller's point of view. Publishing the result
//! and resubscribing watches is the watcher's job.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::bounded::{open_bounded, BoundedFile};
use crate::config::SizeLimits;
use crate::error::WatchError;
use crate::metrics::WatchMetrics;

type FileParseFn<T> = dyn Fn(&mut dyn Read) -> anyhow::Result<T> + Send + Sync;
type DirParseFn<T> = dyn Fn(&DirView<'_>) -> anyhow::Result<T> + Send + Sync;

/// Turns raw content into a typed value. Must be deterministic for equal input.
pub enum Parser<T> {
    /// Target is a single file; receives its bytes.
    File(Arc<FileParseFn<T>>),
    /// Target is a directory; receives a view of the tree.
    Dir(Arc<DirParseFn<T>>),
}

impl<T> Parser<T> {
    pub fn file<F>(parse: F) -> Self
    where
        F: Fn(&mut dyn Read) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Parser::File(Arc::new(parse))
    }

    pub fn dir<F>(parse: F) -> Self
    where
        F: Fn(&DirView<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Parser::Dir(Arc::new(parse))
    }
}

impl<T> Clone for Parser<T> {
    fn clone(&self) -> Self {
        match self {
            Parser::File(f) => Parser::File(Arc::clone(f)),
            Parser::Dir(f) => Parser::Dir(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for Parser<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parser::File(_) => f.write_str("Parser::File"),
            Parser::Dir(_) => f.write_str("Parser::Dir"),
        }
    }
}

/// Read-only view of a watched directory handed to directory parsers.
///
/// File reads go through the same size limits as single-file targets.
pub struct DirView<'a> {
    root: &'a Path,
    limits: SizeLimits,
    metrics: &'a WatchMetrics,
}

impl<'a> DirView<'a> {
    pub(crate) fn new(root: &'a Path, limits: SizeLimits, metrics: &'a WatchMetrics) -> Self {
        Self {
            root,
            limits,
            metrics,
        }
    }

    pub fn root(&self) -> &Path {
        self.root
    }

    /// Regular files under the root, relative to it, sorted.
    ///
    /// Hidden and temporary entries are skipped, which also keeps the
    /// `..data`/`..<timestamp>` internals of a mounted ConfigMap out of the
    /// listing while the user-facing symlinks are followed.
    pub fn files(&self) -> Result<Vec<PathBuf>, WatchError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden_or_temp(e.path()));

        for entry in walker {
            let entry = entry.map_err(|e| walk_error(self.root, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(self.root) {
                files.push(rel.to_path_buf());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Open a file relative to the root through the bounded reader.
    pub fn open(&self, rel: impl AsRef<Path>) -> Result<BoundedFile, WatchError> {
        open_bounded(&self.root.join(rel), self.limits, self.metrics)
    }

    /// Read a whole file relative to the root.
    pub fn read(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>, WatchError> {
        let path = self.root.join(rel);
        let mut file = open_bounded(&path, self.limits, self.metrics)?;
        // Grown by read_to_end; with limits off the stat'd size can be anything.
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| WatchError::io(&path, e))?;
        Ok(buf)
    }
}

/// Editor swap files, dotfiles and the like. Also used by the directory
/// fold watcher to decide which events to act on.
pub(crate) fn is_hidden_or_temp(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return true,
    };
    name.starts_with('.')
        || name.starts_with('~')
        || name.ends_with('~')
        || name.ends_with(".swp")
        || name.ends_with(".tmp")
        || name.contains(".#")
}

fn walk_error(root: &Path, err: walkdir::Error) -> WatchError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop while walking directory"));
    WatchError::Io { path, source }
}

/// Result of one successful load.
#[derive(Debug)]
pub struct Loaded<T> {
    pub value: T,
    pub mtime: SystemTime,
    /// Paths to subscribe to for the next change.
    pub watch_paths: Vec<PathBuf>,
}

/// Load and parse `path` once.
pub fn load<T>(
    path: &Path,
    parser: &Parser<T>,
    limits: SizeLimits,
    metrics: &WatchMetrics,
) -> Result<Loaded<T>, WatchError> {
    let meta = std::fs::metadata(path).map_err(|e| WatchError::io(path, e))?;
    let mtime = meta.modified().map_err(|e| WatchError::io(path, e))?;

    if meta.is_dir() {
        let parse = match parser {
            Parser::Dir(parse) => parse,
            Parser::File(_) => {
                return Err(WatchError::parser(
                    path,
                    anyhow::anyhow!("file parser given a directory"),
                ))
            }
        };
        metrics.record_parse();
        let value = parse(&DirView::new(path, limits, metrics))
            .map_err(|e| WatchError::parser(path, e))?;
        let watch_paths = dir_watch_paths(path)?;
        return Ok(Loaded {
            value,
            mtime,
            watch_paths,
        });
    }

    let parse = match parser {
        Parser::File(parse) => parse,
        Parser::Dir(_) => return Err(WatchError::NotADirectory { path: path.to_path_buf() }),
    };
    let mut file = open_bounded(path, limits, metrics)?;
    metrics.record_parse();
    let value = parse(&mut file).map_err(|e| WatchError::parser(path, e))?;

    Ok(Loaded {
        value,
        mtime,
        watch_paths: file_watch_paths(path),
    })
}

/// The parent has to be watched too: an atomic rename over the file only
/// shows up as an event on the directory.
fn file_watch_paths(path: &Path) -> Vec<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    vec![parent, path.to_path_buf()]
}

/// The root plus everything beneath it, independent of what the parser read.
fn dir_watch_paths(root: &Path) -> Result<Vec<PathBuf>, WatchError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        match entry {
            Ok(entry) => paths.push(entry.into_path()),
            Err(e) if e.depth() == 0 => return Err(walk_error(root, e)),
            // Entries can vanish mid-walk; the next reload picks up the new shape.
            Err(e) => tracing::debug!(root = %root.display(), error = %e, "Skipping entry"),
        }
    }
    Ok(paths)
}
