//! Bookkeeping for the set of paths subscribed with the notifier.
//!
//! Every successful reload replaces the whole set: unwatch everything,
//! then watch the freshly computed paths. Directory trees can change shape
//! completely between reloads (a ConfigMap remount swaps every entry), so
//! no attempt is made to diff the old and new sets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// The subscribe/unsubscribe half of a filesystem notifier.
pub trait Notifier {
    fn watch_path(&mut self, path: &Path) -> notify::Result<()>;
    fn unwatch_path(&mut self, path: &Path) -> notify::Result<()>;
}

impl Notifier for RecommendedWatcher {
    fn watch_path(&mut self, path: &Path) -> notify::Result<()> {
        self.watch(path, RecursiveMode::NonRecursive)
    }

    fn unwatch_path(&mut self, path: &Path) -> notify::Result<()> {
        self.unwatch(path)
    }
}

/// Paths currently subscribed, as resolved real paths.
#[derive(Debug, Default)]
pub struct WatchRegistrar {
    watched: Vec<PathBuf>,
}

impl WatchRegistrar {
    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Replace the subscription set with `paths`.
    ///
    /// Symlinks are resolved before subscribing. A path that cannot be
    /// resolved (a dangling link, say) is watched as given instead of
    /// failing the whole pass.
    pub fn resync<N: Notifier + ?Sized>(&mut self, notifier: &mut N, paths: &[PathBuf]) {
        for old in self.watched.drain(..) {
            // The backend drops watches on deleted paths by itself.
            if let Err(e) = notifier.unwatch_path(&old) {
                tracing::debug!(path = %old.display(), error = %e, "Unwatch failed");
            }
        }

        let mut seen = HashSet::with_capacity(paths.len());
        for path in paths {
            let real = match std::fs::canonicalize(path) {
                Ok(real) => real,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Could not resolve symlinks, watching path as given"
                    );
                    path.clone()
                }
            };
            if !seen.insert(real.clone()) {
                continue;
            }
            match notifier.watch_path(&real) {
                Ok(()) => self.watched.push(real),
                Err(e) => {
                    tracing::warn!(path = %real.display(), error = %e, "Failed to watch path")
                }
            }
        }

        tracing::debug!(count = self.watched.len(), "Watch set refreshed");
    }

    /// Drop every subscription, e.g. on shutdown.
    pub fn clear<N: Notifier + ?Sized>(&mut self, notifier: &mut N) {
        self.resync(notifier, &[]);
    }
}
