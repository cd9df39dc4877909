//! Live, parsed view of a file or directory.
//!
//! [`Watcher::new`] blocks until the first load succeeds, then hands the
//! rest to a single background dispatcher task. That task is the only
//! writer of the published [`Snapshot`] and of the watch set; readers go
//! through an `ArcSwap` and never wait on it.
//!
//! The dispatcher multiplexes four sources in one `select!`: shutdown,
//! notifier events and errors, the debounce deadline, and the poll tick.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{SizeLimits, WatchOptions};
use crate::debounce::{Change, Debouncer};
use crate::error::WatchError;
use crate::loader::{load, Parser};
use crate::metrics::{FailureStreak, WatchMetrics};
use crate::poll::{modified_since, Poller};
use crate::registrar::WatchRegistrar;

/// One successfully parsed state. Never mutated after publication.
#[derive(Debug)]
pub struct Snapshot<T> {
    value: T,
    mtime: SystemTime,
}

impl<T> Snapshot<T> {
    pub fn new(value: T, mtime: SystemTime) -> Self {
        Self { value, mtime }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Modification time of the target when it was read.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

pub(crate) type NotifyEvents = mpsc::UnboundedReceiver<notify::Result<notify::Event>>;

/// Bridge the notifier's callback thread into a tokio channel.
pub(crate) fn notifier_channel() -> Result<(RecommendedWatcher, NotifyEvents), WatchError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let notifier = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        // Receiver gone means the dispatcher has exited.
        let _ = tx.send(res);
    })?;
    Ok((notifier, rx))
}

/// Run `attempt` until it succeeds, retrying only while the target is missing.
///
/// Gives up with `Cancelled` when `ctx` fires, checked before every attempt,
/// and with `Timeout` once `options.initial_timeout` elapses; both carry the
/// last load error when there was one.
pub(crate) async fn load_with_retry<L, F>(
    path: &Path,
    options: &WatchOptions,
    ctx: &CancellationToken,
    attempt: F,
) -> Result<L, WatchError>
where
    L: Send + 'static,
    F: Fn() -> Result<L, WatchError> + Clone + Send + 'static,
{
    let timeout = options.initial_timeout;
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut attempts = 0u32;
    let mut last: Option<WatchError> = None;

    loop {
        if ctx.is_cancelled() {
            return Err(WatchError::Cancelled {
                path: path.to_path_buf(),
                last: last.map(Box::new),
            });
        }

        attempts += 1;
        let failed = match tokio::task::spawn_blocking(attempt.clone()).await? {
            Ok(loaded) => {
                if attempts > 1 {
                    tracing::info!(path = %path.display(), attempts, "Target appeared");
                }
                return Ok(loaded);
            }
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        if attempts == 1 {
            tracing::info!(path = %path.display(), "Target does not exist yet, waiting for it");
        }

        tokio::select! {
            biased;
            // Reported at the top of the loop.
            _ = ctx.cancelled() => {}
            _ = sleep_until(deadline) => {
                return Err(WatchError::Timeout {
                    path: path.to_path_buf(),
                    after: timeout.unwrap_or_default(),
                    last: Box::new(failed),
                });
            }
            _ = tokio::time::sleep(options.retry_interval) => {}
        }
        last = Some(failed);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A parsed file or directory kept up to date in the background.
pub struct Watcher<T> {
    path: PathBuf,
    current: Arc<ArcSwap<Snapshot<T>>>,
    generation: watch::Receiver<u64>,
    metrics: Arc<WatchMetrics>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Watcher<T> {
    /// Load `path` and start watching it.
    ///
    /// Blocks until the first load succeeds. A missing target is retried
    /// every `options.retry_interval` until `ctx` is cancelled or
    /// `options.initial_timeout` elapses; any other error fails
    /// construction. `ctx` only bounds this initial phase: cancelling it
    /// later does not stop a watcher that already started.
    pub async fn new(
        path: impl Into<PathBuf>,
        parser: Parser<T>,
        options: WatchOptions,
        ctx: &CancellationToken,
    ) -> Result<Self, WatchError> {
        let path = path.into();
        let metrics = Arc::new(WatchMetrics::new());
        let limits = options.limits();

        let loaded = load_with_retry(
            &path,
            &options,
            ctx,
            load_task(&path, &parser, limits, &metrics),
        )
        .await?;

        let (mut notifier, events) = notifier_channel()?;
        let mut registrar = WatchRegistrar::default();
        registrar.resync(&mut notifier, &loaded.watch_paths);

        let current = Arc::new(ArcSwap::from_pointee(Snapshot::new(
            loaded.value,
            loaded.mtime,
        )));
        let (generation_tx, generation) = watch::channel(0);
        let shutdown = CancellationToken::new();

        tracing::info!(
            path = %path.display(),
            watched = registrar.watched().len(),
            debounce = ?options.debounce,
            poll = ?options.poll_interval,
            "Watching"
        );

        let dispatcher = Dispatcher {
            path: path.clone(),
            parser,
            limits,
            notifier,
            events,
            registrar,
            debouncer: Debouncer::new(options.debounce),
            poller: Poller::new(options.poll_interval),
            current: Arc::clone(&current),
            generation: generation_tx,
            metrics: Arc::clone(&metrics),
            streak: FailureStreak::default(),
        };
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        Ok(Self {
            path,
            current,
            generation,
            metrics,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }
}

impl<T> Watcher<T> {
    /// Latest published snapshot. Never blocks, even mid-reload.
    pub fn get(&self) -> Arc<Snapshot<T>> {
        self.current.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metrics(&self) -> &WatchMetrics {
        &self.metrics
    }

    /// Generation counter, bumped after every published reload.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.clone()
    }

    /// Stop watching. Idempotent; [`Watcher::get`] keeps returning the last snapshot.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for the dispatcher to exit after [`Watcher::close`]. Only the
    /// first caller actually waits.
    pub async fn closed(&self) {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(path = %self.path.display(), error = %e, "Watch task ended abnormally");
            }
        }
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn load_task<T>(
    path: &Path,
    parser: &Parser<T>,
    limits: SizeLimits,
    metrics: &Arc<WatchMetrics>,
) -> impl Fn() -> Result<crate::loader::Loaded<T>, WatchError> + Clone + Send + 'static
where
    T: Send + 'static,
{
    let path = path.to_path_buf();
    let parser = parser.clone();
    let metrics = Arc::clone(metrics);
    move || load(&path, &parser, limits, &metrics)
}

/// State owned by the background task.
struct Dispatcher<T> {
    path: PathBuf,
    parser: Parser<T>,
    limits: SizeLimits,
    notifier: RecommendedWatcher,
    events: NotifyEvents,
    registrar: WatchRegistrar,
    debouncer: Debouncer,
    poller: Poller,
    current: Arc<ArcSwap<Snapshot<T>>>,
    generation: watch::Sender<u64>,
    metrics: Arc<WatchMetrics>,
    streak: FailureStreak,
}

impl<T: Send + Sync + 'static> Dispatcher<T> {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(res) = self.events.recv() => self.on_event(res),

                _ = self.debouncer.fired(), if self.debouncer.is_armed() => {
                    self.reload("fs-event").await;
                }

                _ = self.poller.tick() => {
                    let last = self.current.load().mtime;
                    if modified_since(&self.path, last) {
                        self.reload("poll").await;
                    }
                }
            }
        }

        self.registrar.clear(&mut self.notifier);
        tracing::info!(path = %self.path.display(), "Stopped watching");
    }

    fn on_event(&mut self, res: notify::Result<notify::Event>) {
        match res {
            Ok(event) => {
                self.metrics.record_fs_event();
                let change = Change::classify(&event.kind);
                if self.debouncer.observe(change) {
                    tracing::debug!(?change, paths = ?event.paths, "Reload scheduled");
                }
            }
            Err(e) => {
                self.metrics.record_notifier_error();
                tracing::warn!(path = %self.path.display(), error = %e, "Notifier error");
            }
        }
    }

    /// Re-load and publish. A failed load keeps the previous snapshot.
    async fn reload(&mut self, trigger: &'static str) {
        let started = std::time::Instant::now();
        let attempt = load_task(&self.path, &self.parser, self.limits, &self.metrics);
        let result = match tokio::task::spawn_blocking(attempt).await {
            Ok(result) => result,
            Err(e) => Err(WatchError::from(e)),
        };

        match result {
            Ok(loaded) => {
                self.current
                    .store(Arc::new(Snapshot::new(loaded.value, loaded.mtime)));
                self.registrar.resync(&mut self.notifier, &loaded.watch_paths);
                self.metrics.record_reload(true);
                self.generation.send_modify(|g| *g += 1);

                if let Some(failures) = self.streak.record_success() {
                    tracing::info!(
                        path = %self.path.display(),
                        failures,
                        "Reload succeeded after failures"
                    );
                }
                tracing::debug!(
                    path = %self.path.display(),
                    trigger,
                    elapsed = ?started.elapsed(),
                    "Reloaded"
                );
            }
            Err(e) => {
                self.metrics.record_reload(false);
                if self.streak.record_failure() {
                    tracing::warn!(
                        path = %self.path.display(),
                        trigger,
                        error = %e,
                        "Reload failed, keeping previous snapshot"
                    );
                }
            }
        }
    }
}

/// Slack on top of the debounce delay for test waits.
#[cfg(test)]
pub(crate) const SETTLE: std::time::Duration = std::time::Duration::from_secs(5);

/// Poll `cond` until it holds or `SETTLE` passes.
#[cfg(test)]
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cond()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DirView;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use std::time::Duration;

    fn fast_options() -> WatchOptions {
        WatchOptions {
            debounce: Duration::from_millis(50),
            retry_interval: Duration::from_millis(10),
            poll_interval: None,
            ..Default::default()
        }
    }

    fn text_parser() -> Parser<String> {
        Parser::file(|r: &mut dyn Read| {
            let mut s = String::new();
            r.read_to_string(&mut s)?;
            Ok(s)
        })
    }

    /// Write-then-rename, the way config management tools update files.
    fn replace(path: &Path, content: &str) {
        let tmp = path.with_extension("partial");
        std::fs::write(&tmp, content).unwrap();
        std::fs::rename(&tmp, path).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_load_waits_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.conf");

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            replace(&writer_path, "first");
        });

        let watcher = Watcher::new(&path, text_parser(), fast_options(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(watcher.get().as_str(), "first");
    }

    #[tokio::test]
    async fn test_cancelled_before_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let started = std::time::Instant::now();
        let err = Watcher::new(dir.path().join("never"), text_parser(), fast_options(), &ctx)
            .await
            .err()
            .expect("construction should fail");
        assert!(started.elapsed() < Duration::from_secs(1));
        match err {
            WatchError::Cancelled { last, .. } => assert!(last.is_none()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_existing_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "ready").unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let res = Watcher::new(&path, text_parser(), fast_options(), &ctx).await;
        match res {
            Err(WatchError::Cancelled { last, .. }) => assert!(last.is_none()),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("construction should fail once cancelled"),
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_retry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let res = Watcher::new(dir.path().join("never"), text_parser(), fast_options(), &ctx).await;
        let elapsed = started.elapsed();
        match res {
            Err(WatchError::Cancelled { last, .. }) => {
                assert!(last.is_some_and(|last| last.is_not_found()))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("construction should fail"),
        }
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_initial_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let options = WatchOptions {
            initial_timeout: Some(Duration::from_millis(100)),
            ..fast_options()
        };

        let started = std::time::Instant::now();
        let res = Watcher::new(dir.path().join("never"), text_parser(), options, &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();
        match res {
            Err(WatchError::Timeout { after, last, .. }) => {
                assert_eq!(after, Duration::from_millis(100));
                assert!(last.is_not_found());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("construction should fail"),
        }
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_initial_parse_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n");
        std::fs::write(&path, "abc").unwrap();
        let parser = Parser::file(|r: &mut dyn Read| {
            let mut s = String::new();
            r.read_to_string(&mut s)?;
            Ok(s.parse::<u64>()?)
        });

        let res = Watcher::new(&path, parser, fast_options(), &CancellationToken::new()).await;
        assert!(matches!(res, Err(WatchError::Parser { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replacement_becomes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "A").unwrap();

        let watcher = Watcher::new(&path, text_parser(), fast_options(), &CancellationToken::new())
            .await
            .unwrap();
        let mut generations = watcher.subscribe();
        assert_eq!(watcher.get().as_str(), "A");

        replace(&path, "B");
        assert!(wait_until(|| watcher.get().as_str() == "B").await);
        assert_eq!(
            watcher.get().mtime(),
            std::fs::metadata(&path).unwrap().modified().unwrap()
        );

        tokio::time::timeout(SETTLE, generations.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*generations.borrow() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_is_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "v0").unwrap();
        let options = WatchOptions {
            debounce: Duration::from_millis(400),
            ..fast_options()
        };

        let watcher = Watcher::new(&path, text_parser(), options, &CancellationToken::new())
            .await
            .unwrap();
        let initial_parses = watcher.metrics().parses();

        let writes = 5;
        for i in 1..=writes {
            replace(&path, &format!("v{i}"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(wait_until(|| watcher.get().as_str() == "v5").await);
        tokio::time::sleep(Duration::from_millis(600)).await;

        let reload_parses = watcher.metrics().parses() - initial_parses;
        assert!(reload_parses >= 1);
        assert!(reload_parses < writes, "parsed {reload_parses} times for {writes} writes");
        assert_eq!(watcher.get().as_str(), "v5");
    }

    #[tokio::test]
    async fn test_soft_limit_breach_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.conf");
        std::fs::write(&path, "0123456789").unwrap();
        let options = WatchOptions {
            soft_limit: 4,
            hard_limit: Some(1024),
            ..fast_options()
        };

        let watcher = Watcher::new(&path, text_parser(), options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(watcher.get().as_str(), "0123456789");
        assert_eq!(watcher.metrics().snapshot().soft_limit_violations, 1);
    }

    #[tokio::test]
    async fn test_hard_limit_breach_on_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.conf");
        std::fs::write(&path, vec![b'x'; 64]).unwrap();
        let options = WatchOptions {
            soft_limit: 8,
            hard_limit: Some(16),
            ..fast_options()
        };

        let res = Watcher::new(&path, text_parser(), options, &CancellationToken::new()).await;
        assert!(matches!(res, Err(WatchError::SizeLimitExceeded { size: 64, limit: 16, .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hard_limit_breach_on_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "good").unwrap();
        let options = WatchOptions {
            soft_limit: 8,
            hard_limit: Some(16),
            ..fast_options()
        };

        let watcher = Watcher::new(&path, text_parser(), options, &CancellationToken::new())
            .await
            .unwrap();

        replace(&path, &"x".repeat(64));
        assert!(wait_until(|| watcher.metrics().reloads_failed() >= 1).await);
        assert_eq!(watcher.get().as_str(), "good");
        assert!(watcher.metrics().snapshot().hard_limit_violations >= 1);

        // A later good write recovers.
        replace(&path, "better");
        assert!(wait_until(|| watcher.get().as_str() == "better").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "kept").unwrap();

        let watcher = Watcher::new(&path, text_parser(), fast_options(), &CancellationToken::new())
            .await
            .unwrap();
        watcher.close();
        watcher.close();
        watcher.closed().await;
        watcher.closed().await;
        assert!(watcher.is_closed());

        replace(&path, "ignored");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(watcher.get().as_str(), "kept");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_caller_cancel_after_start_does_not_stop_watching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "A").unwrap();
        let ctx = CancellationToken::new();

        let watcher = Watcher::new(&path, text_parser(), fast_options(), &ctx)
            .await
            .unwrap();
        ctx.cancel();

        replace(&path, "B");
        assert!(wait_until(|| watcher.get().as_str() == "B").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directory_add_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join("base.conf"), "base").unwrap();

        let parser = Parser::dir(|view: &DirView<'_>| {
            let mut names = Vec::new();
            for rel in view.files()? {
                names.push(rel.display().to_string());
            }
            Ok(names)
        });
        let watcher = Watcher::new(&root, parser, fast_options(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*watcher.get().value(), vec!["base.conf".to_string()]);

        std::fs::create_dir(root.join("extra")).unwrap();
        std::fs::write(root.join("extra/more.conf"), "more").unwrap();
        assert!(
            wait_until(|| watcher.get().value().contains(&"extra/more.conf".to_string())).await
        );

        std::fs::remove_file(root.join("extra/more.conf")).unwrap();
        assert!(wait_until(|| *watcher.get().value() == vec!["base.conf".to_string()]).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poll_catches_change_before_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "A").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(600);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(old)).unwrap();

        // Debounce far beyond the test's horizon: only polling can reload.
        let options = WatchOptions {
            debounce: Duration::from_secs(3600),
            poll_interval: Some(Duration::from_millis(50)),
            ..fast_options()
        };
        let watcher = Watcher::new(&path, text_parser(), options, &CancellationToken::new())
            .await
            .unwrap();

        std::fs::write(&path, "B").unwrap();
        assert!(wait_until(|| watcher.get().as_str() == "B").await);
    }

    #[derive(Debug)]
    struct Pair {
        text: String,
        len: usize,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_never_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.conf");
        std::fs::write(&path, "seed").unwrap();
        let parser = Parser::file(|r: &mut dyn Read| {
            let mut text = String::new();
            r.read_to_string(&mut text)?;
            Ok(Pair {
                len: text.len(),
                text,
            })
        });

        let watcher = Arc::new(
            Watcher::new(&path, parser, fast_options(), &CancellationToken::new())
                .await
                .unwrap(),
        );
        let stop = CancellationToken::new();

        let mut readers = Vec::new();
        for _ in 0..8 {
            let watcher = Arc::clone(&watcher);
            let stop = stop.clone();
            readers.push(tokio::spawn(async move {
                let mut reads = 0u64;
                while !stop.is_cancelled() {
                    let snap = watcher.get();
                    assert_eq!(snap.text.len(), snap.len, "torn snapshot");
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                reads
            }));
        }

        for i in 0..10 {
            replace(&path, &"z".repeat(i * 7 + 1));
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        assert!(wait_until(|| watcher.get().len == 64).await);
        stop.cancel();

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
    }
}
