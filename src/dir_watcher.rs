//! Incremental directory watcher.
//!
//! Instead of re-parsing the whole tree on every change, each file is
//! parsed on its own and folded into an accumulator: `add` merges one
//! file's value in, `remove` takes a path's contribution back out. Events
//! are applied as they arrive, without debouncing.
//!
//! `add` is also called when an already-folded file changes, so it must
//! replace any previous contribution from the same path.
//!
//! The root's parent is watched too, so a root that is deleted and created
//! again gets its recursive watch back and is rescanned. Published
//! snapshots carry the root's mtime, as with [`crate::Watcher`].

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bounded::open_bounded;
use crate::config::{SizeLimits, WatchOptions};
use crate::debounce::Change;
use crate::error::WatchError;
use crate::loader::{is_hidden_or_temp, DirView};
use crate::metrics::{FailureStreak, WatchMetrics};
use crate::watcher::{load_with_retry, notifier_channel, NotifyEvents, Snapshot};

type ParseFn<F> = dyn Fn(&Path, &mut dyn Read) -> anyhow::Result<F> + Send + Sync;
type AddFn<A, F> = dyn Fn(&A, &Path, F) -> A + Send + Sync;
type RemoveFn<A> = dyn Fn(&A, &Path) -> A + Send + Sync;

/// Per-file parse plus the merge/unmerge pair folding results into `A`.
pub struct Folder<A, F> {
    parse: Arc<ParseFn<F>>,
    add: Arc<AddFn<A, F>>,
    remove: Arc<RemoveFn<A>>,
}

impl<A, F> Folder<A, F> {
    pub fn new<P, Ad, R>(parse: P, add: Ad, remove: R) -> Self
    where
        P: Fn(&Path, &mut dyn Read) -> anyhow::Result<F> + Send + Sync + 'static,
        Ad: Fn(&A, &Path, F) -> A + Send + Sync + 'static,
        R: Fn(&A, &Path) -> A + Send + Sync + 'static,
    {
        Self {
            parse: Arc::new(parse),
            add: Arc::new(add),
            remove: Arc::new(remove),
        }
    }
}

impl<A, F> Clone for Folder<A, F> {
    fn clone(&self) -> Self {
        Self {
            parse: Arc::clone(&self.parse),
            add: Arc::clone(&self.add),
            remove: Arc::clone(&self.remove),
        }
    }
}

fn parse_file<A, F>(
    folder: &Folder<A, F>,
    path: &Path,
    limits: SizeLimits,
    metrics: &WatchMetrics,
) -> Result<F, WatchError> {
    let mut file = open_bounded(path, limits, metrics)?;
    metrics.record_parse();
    (folder.parse)(path, &mut file).map_err(|e| WatchError::parser(path, e))
}

struct Scan<A> {
    acc: A,
    mtime: SystemTime,
    files: BTreeSet<PathBuf>,
}

fn scan<A: Default, F>(
    root: &Path,
    folder: &Folder<A, F>,
    limits: SizeLimits,
    metrics: &WatchMetrics,
) -> Result<Scan<A>, WatchError> {
    let meta = std::fs::metadata(root).map_err(|e| WatchError::io(root, e))?;
    if !meta.is_dir() {
        return Err(WatchError::NotADirectory {
            path: root.to_path_buf(),
        });
    }
    let mtime = meta.modified().map_err(|e| WatchError::io(root, e))?;

    let mut acc = A::default();
    let mut files = BTreeSet::new();
    for rel in DirView::new(root, limits, metrics).files()? {
        let path = root.join(rel);
        let value = parse_file(folder, &path, limits, metrics)?;
        acc = (folder.add)(&acc, &path, value);
        files.insert(path);
    }

    Ok(Scan { acc, mtime, files })
}

/// A directory folded file by file into an accumulator.
pub struct DirWatcher<A> {
    root: PathBuf,
    current: Arc<ArcSwap<Snapshot<A>>>,
    metrics: Arc<WatchMetrics>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<A> DirWatcher<A>
where
    A: Default + Send + Sync + 'static,
{
    /// Fold every file under `root` and start applying changes.
    ///
    /// Initial load retries and cancellation behave as in
    /// [`crate::Watcher::new`]; any file failing to parse fails construction.
    pub async fn new<F: Send + 'static>(
        root: impl Into<PathBuf>,
        folder: Folder<A, F>,
        options: WatchOptions,
        ctx: &CancellationToken,
    ) -> Result<Self, WatchError> {
        let root = root.into();
        let metrics = Arc::new(WatchMetrics::new());
        let limits = options.limits();

        let attempt = {
            let (root, folder, metrics) = (root.clone(), folder.clone(), Arc::clone(&metrics));
            move || scan(&root, &folder, limits, &metrics)
        };
        let initial = load_with_retry(&root, &options, ctx, attempt).await?;

        let (mut notifier, events) = notifier_channel()?;
        notifier.watch(&root, RecursiveMode::Recursive)?;
        if let Some(parent) = root.parent() {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            if let Err(e) = notifier.watch(parent, RecursiveMode::NonRecursive) {
                tracing::warn!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to watch parent, root recreation will go unnoticed"
                );
            }
        }

        tracing::info!(
            path = %root.display(),
            files = initial.files.len(),
            "Watching directory"
        );

        let current = Arc::new(ArcSwap::from_pointee(Snapshot::new(
            initial.acc,
            initial.mtime,
        )));
        let shutdown = CancellationToken::new();
        let dispatcher = FoldDispatcher {
            root: root.clone(),
            folder,
            limits,
            notifier,
            events,
            tracked: initial.files,
            current: Arc::clone(&current),
            metrics: Arc::clone(&metrics),
            streak: FailureStreak::default(),
        };
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        Ok(Self {
            root,
            current,
            metrics,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }
}

impl<A> DirWatcher<A> {
    pub fn get(&self) -> Arc<Snapshot<A>> {
        self.current.load_full()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metrics(&self) -> &WatchMetrics {
        &self.metrics
    }

    /// Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub async fn closed(&self) {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(path = %self.root.display(), error = %e, "Watch task ended abnormally");
            }
        }
    }
}

impl<A> Drop for DirWatcher<A> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct FoldDispatcher<A, F> {
    root: PathBuf,
    folder: Folder<A, F>,
    limits: SizeLimits,
    // Dropping it stops the events.
    notifier: RecommendedWatcher,
    events: NotifyEvents,
    /// Files whose contribution is currently folded in.
    tracked: BTreeSet<PathBuf>,
    current: Arc<ArcSwap<Snapshot<A>>>,
    metrics: Arc<WatchMetrics>,
    streak: FailureStreak,
}

impl<A, F> FoldDispatcher<A, F>
where
    A: Send + Sync + 'static,
    F: Send + 'static,
{
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(res) = self.events.recv() => match res {
                    Ok(event) => self.apply(event).await,
                    Err(e) => {
                        self.metrics.record_notifier_error();
                        tracing::warn!(path = %self.root.display(), error = %e, "Notifier error");
                    }
                },
            }
        }
        tracing::info!(path = %self.root.display(), "Stopped watching directory");
    }

    async fn apply(&mut self, event: notify::Event) {
        self.metrics.record_fs_event();
        let change = Change::classify(&event.kind);

        // Seen through the parent watch.
        if matches!(change, Change::Create | Change::Rename) && event.paths.contains(&self.root) {
            let root = self.root.clone();
            if root.is_dir() {
                self.rearm().await;
            } else {
                self.forget(&root);
            }
            return;
        }

        match change {
            Change::Create | Change::Write => {
                for path in &event.paths {
                    self.upsert(path).await;
                }
            }
            Change::Remove => {
                for path in &event.paths {
                    self.forget(path);
                }
            }
            Change::Rename => match &event.kind {
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    for path in &event.paths {
                        self.forget(path);
                    }
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    for path in &event.paths {
                        self.upsert(path).await;
                    }
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                    self.forget(&event.paths[0]);
                    self.upsert(&event.paths[1]).await;
                }
                // Backend could not tell which side this is; look.
                _ => {
                    for path in &event.paths {
                        if path.exists() {
                            self.upsert(path).await;
                        } else {
                            self.forget(path);
                        }
                    }
                }
            },
            Change::Chmod | Change::Other => {}
        }
    }

    /// The root came back: watch it again and fold in whatever it holds now.
    async fn rearm(&mut self) {
        let root = self.root.clone();
        // The old watch died with the old directory.
        let _ = self.notifier.unwatch(&root);
        if let Err(e) = self.notifier.watch(&root, RecursiveMode::Recursive) {
            self.metrics.record_notifier_error();
            tracing::warn!(path = %root.display(), error = %e, "Failed to watch recreated root");
            return;
        }
        tracing::info!(path = %root.display(), "Root recreated, rescanning");
        self.forget(&root);
        self.upsert(&root).await;
    }

    /// Root mtime for the next snapshot, or the previous one if it cannot be read.
    fn root_mtime(&self) -> SystemTime {
        std::fs::metadata(&self.root)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| self.current.load().mtime())
    }

    /// Hidden or temporary at any level below the root, or outside it.
    fn ignored(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(rel) => rel
                .components()
                .any(|c| is_hidden_or_temp(Path::new(c.as_os_str()))),
            Err(_) => true,
        }
    }

    async fn upsert(&mut self, path: &Path) {
        if self.ignored(path) {
            return;
        }
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            // Gone again before we got to it.
            Err(_) => return self.forget(path),
        };

        if meta.is_dir() {
            // Files may have landed before the backend started watching the new directory.
            let files = DirView::new(path, self.limits, &self.metrics).files();
            match files {
                Ok(files) => {
                    for rel in files {
                        self.upsert_file(&path.join(rel)).await;
                    }
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to list new directory"),
            }
        } else if meta.is_file() {
            self.upsert_file(path).await;
        }
    }

    async fn upsert_file(&mut self, path: &Path) {
        let parsed = {
            let (folder, metrics, limits) = (self.folder.clone(), Arc::clone(&self.metrics), self.limits);
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || parse_file(&folder, &path, limits, &metrics)).await
        };
        let parsed = match parsed {
            Ok(result) => result,
            Err(e) => Err(WatchError::from(e)),
        };

        match parsed {
            Ok(value) => {
                let next = (self.folder.add)(self.current.load().value(), path, value);
                let mtime = self.root_mtime();
                self.current.store(Arc::new(Snapshot::new(next, mtime)));
                self.tracked.insert(path.to_path_buf());
                self.succeeded();
                tracing::debug!(path = %path.display(), "Folded in");
            }
            Err(e) => {
                self.metrics.record_reload(false);
                if self.streak.record_failure() {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load file, keeping previous value"
                    );
                }
            }
        }
    }

    /// Take back the contribution of `path` and of every tracked file under it.
    fn forget(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .tracked
            .iter()
            .filter(|tracked| tracked.starts_with(path))
            .cloned()
            .collect();
        if gone.is_empty() {
            return;
        }

        let current = self.current.load_full();
        let mut acc = (self.folder.remove)(current.value(), &gone[0]);
        for tracked in &gone[1..] {
            acc = (self.folder.remove)(&acc, tracked);
        }
        for tracked in &gone {
            self.tracked.remove(tracked);
        }

        let mtime = self.root_mtime();
        self.current.store(Arc::new(Snapshot::new(acc, mtime)));
        self.succeeded();
        tracing::debug!(path = %path.display(), files = gone.len(), "Folded out");
    }

    fn succeeded(&self) {
        self.metrics.record_reload(true);
        if let Some(failures) = self.streak.record_success() {
            tracing::info!(path = %self.root.display(), failures, "Directory updates recovered");
        }
    }
}
