//! Keep a parsed file or directory live in memory.
//!
//! A [`Watcher`] loads its target once (waiting for it to appear if
//! needed), publishes the parsed value, and reloads it in the background
//! whenever the target changes on disk. Readers call [`Watcher::get`] and
//! always get a complete snapshot without waiting on reloads.
//!
//! ```no_run
//! use std::io::Read;
//! use snapwatch::{Parser, WatchOptions, Watcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), snapwatch::WatchError> {
//! let parser = Parser::file(|r: &mut dyn Read| {
//!     let mut s = String::new();
//!     r.read_to_string(&mut s)?;
//!     Ok(s)
//! });
//! let watcher = Watcher::new("/etc/app/app.conf", parser, WatchOptions::default(), &CancellationToken::new()).await?;
//! println!("{}", watcher.get().as_str());
//! watcher.close();
//! # Ok(())
//! # }
//! ```
//!
//! Change detection combines three sources: notifier events (debounced),
//! an mtime poll for changes the notifier cannot see, and the blocking
//! initial load. A failed reload never replaces a good snapshot.

pub mod bounded;
pub mod config;
pub mod debounce;
pub mod dir_watcher;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod poll;
pub mod registrar;
pub mod watcher;

pub use config::{SizeLimits, WatchOptions};
pub use dir_watcher::{DirWatcher, Folder};
pub use error::WatchError;
pub use loader::{load, DirView, Loaded, Parser};
pub use metrics::{MetricsSnapshot, WatchMetrics};
pub use watcher::{Snapshot, Watcher};
