use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser as CliParser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use snapwatch::{DirView, MetricsSnapshot, Parser, WatchMetrics, WatchOptions, Watcher};

#[derive(CliParser)]
#[command(name = "snapwatch", version, about = "Load a file or directory and follow its changes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Size and timing flags shared by both subcommands. Unset flags fall back
/// to `SNAPWATCH_*` environment variables, then to built-in defaults.
#[derive(clap::Args)]
struct OptionArgs {
    /// Soft size limit in bytes (warn, keep loading)
    #[arg(long)]
    soft_limit: Option<u64>,

    /// Hard size limit in bytes (refuse to load); default 10x the soft limit
    #[arg(long)]
    hard_limit: Option<u64>,

    /// Mtime poll interval in seconds; 0 or negative disables polling
    #[arg(long, allow_negative_numbers = true)]
    poll_secs: Option<i64>,

    /// Quiet period after a filesystem event before reloading, in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Give up waiting for the path to appear after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl OptionArgs {
    fn resolve(&self) -> anyhow::Result<WatchOptions> {
        Ok(WatchOptions::from_env()?.with_overrides(
            self.soft_limit,
            self.hard_limit,
            self.poll_secs,
            self.debounce_ms,
            self.timeout_secs,
        ))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load once and print the parsed document, its mtime and watch set
    Load {
        /// File or directory to load
        path: PathBuf,

        /// Parse file contents as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        options: OptionArgs,
    },

    /// Load, then print the document again every time it changes
    Watch {
        /// File or directory to watch (may not exist yet)
        path: PathBuf,

        /// Parse file contents as JSON
        #[arg(long)]
        json: bool,

        /// Treat the path as a directory even before it exists
        #[arg(long)]
        dir: bool,

        /// Emit one JSON object per snapshot instead of text
        #[arg(long)]
        jsonl: bool,

        /// Log directory for rolling log files (default: stderr)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        #[command(flatten)]
        options: OptionArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Watch can log to a rolling file; everything else logs to stderr.
    let _guard;
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("snapwatch=info".parse()?);
    match &cli.command {
        Commands::Watch {
            log_dir: Some(log_dir),
            ..
        } => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("creating {}", log_dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "snapwatch.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            _guard = Some(guard);

            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
        }
        _ => {
            _guard = None;
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    match cli.command {
        Commands::Load {
            path,
            json,
            options,
        } => cmd_load(&path, json, &options.resolve()?),
        Commands::Watch {
            path,
            json,
            dir,
            jsonl,
            log_dir: _,
            options,
        } => {
            let options = options.resolve()?;
            let parser = parser_for(&path, dir, json);
            // A single reload loop needs no more than one thread.
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(cmd_watch(path, parser, options, jsonl))
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed documents
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Document {
    Text(String),
    Json(serde_json::Value),
    Tree(BTreeMap<String, Document>),
}

impl Document {
    fn decode(bytes: Vec<u8>, json: bool) -> anyhow::Result<Self> {
        if json {
            let value = serde_json::from_slice(&bytes).context("invalid JSON")?;
            Ok(Document::Json(value))
        } else {
            Ok(Document::Text(String::from_utf8(bytes).context("not valid UTF-8")?))
        }
    }

    fn render(&self) -> anyhow::Result<String> {
        match self {
            Document::Text(text) => Ok(text.clone()),
            Document::Json(_) | Document::Tree(_) => Ok(serde_json::to_string_pretty(self)?),
        }
    }
}

fn parser_for(path: &Path, force_dir: bool, json: bool) -> Parser<Document> {
    if force_dir || path.is_dir() {
        Parser::dir(move |view: &DirView<'_>| {
            let mut tree = BTreeMap::new();
            for rel in view.files()? {
                let bytes = view.read(&rel)?;
                let doc = Document::decode(bytes, json)
                    .with_context(|| format!("decoding {}", rel.display()))?;
                tree.insert(rel.display().to_string(), doc);
            }
            Ok(Document::Tree(tree))
        })
    } else {
        Parser::file(move |r: &mut dyn Read| {
            let mut bytes = Vec::new();
            r.read_to_end(&mut bytes)?;
            Document::decode(bytes, json)
        })
    }
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

// ---------------------------------------------------------------------------
// load subcommand
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct LoadReport<'a> {
    path: &'a Path,
    mtime: String,
    watch_paths: &'a [PathBuf],
    document: &'a Document,
    metrics: MetricsSnapshot,
}

fn cmd_load(path: &Path, json: bool, options: &WatchOptions) -> anyhow::Result<()> {
    let metrics = WatchMetrics::new();
    let parser = parser_for(path, false, json);
    let loaded = snapwatch::load(path, &parser, options.limits(), &metrics)
        .with_context(|| format!("loading {}", path.display()))?;

    let report = LoadReport {
        path,
        mtime: rfc3339(loaded.mtime),
        watch_paths: &loaded.watch_paths,
        document: &loaded.value,
        metrics: metrics.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// watch subcommand
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SnapshotLine<'a> {
    path: &'a Path,
    generation: u64,
    mtime: String,
    document: &'a Document,
}

fn print_snapshot(watcher: &Watcher<Document>, generation: u64, jsonl: bool) -> anyhow::Result<()> {
    let snap = watcher.get();
    if jsonl {
        let line = SnapshotLine {
            path: watcher.path(),
            generation,
            mtime: rfc3339(snap.mtime()),
            document: snap.value(),
        };
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!(
            "--- {} (generation {}, modified {})",
            watcher.path().display(),
            generation,
            rfc3339(snap.mtime())
        );
        println!("{}", snap.value().render()?);
    }
    Ok(())
}

async fn cmd_watch(
    path: PathBuf,
    parser: Parser<Document>,
    options: WatchOptions,
    jsonl: bool,
) -> anyhow::Result<()> {
    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            ctx.cancel();
        });
    }

    let watcher = Watcher::new(&path, parser, options, &ctx)
        .await
        .with_context(|| format!("watching {}", path.display()))?;

    let mut generations = watcher.subscribe();
    print_snapshot(&watcher, 0, jsonl)?;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            changed = generations.changed() => {
                if changed.is_err() {
                    tracing::warn!("Watcher stopped unexpectedly");
                    break;
                }
                let generation = *generations.borrow_and_update();
                print_snapshot(&watcher, generation, jsonl)?;
            }
        }
    }

    watcher.close();
    watcher.closed().await;
    let metrics = watcher.metrics().snapshot();
    tracing::info!(
        reloads_ok = metrics.reloads_ok,
        reloads_failed = metrics.reloads_failed,
        fs_events = metrics.fs_events,
        "Watch finished"
    );
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Could not install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_text_and_json() {
        match Document::decode(b"plain".to_vec(), false).unwrap() {
            Document::Text(t) => assert_eq!(t, "plain"),
            other => panic!("unexpected {other:?}"),
        }
        match Document::decode(br#"{"port": 80}"#.to_vec(), true).unwrap() {
            Document::Json(v) => assert_eq!(v["port"], 80),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Document::decode(b"{oops".to_vec(), true).is_err());
        assert!(Document::decode(vec![0xff, 0xfe], false).is_err());
    }

    #[test]
    fn test_directory_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"x":1}"#).unwrap();
        std::fs::create_dir(dir.path().join("n")).unwrap();
        std::fs::write(dir.path().join("n/b.json"), "[2]").unwrap();

        let parser = parser_for(dir.path(), false, true);
        let loaded = snapwatch::load(
            dir.path(),
            &parser,
            WatchOptions::default().limits(),
            &WatchMetrics::new(),
        )
        .unwrap();
        let rendered = serde_json::to_value(&loaded.value).unwrap();
        assert_eq!(rendered, serde_json::json!({"a.json": {"x": 1}, "n/b.json": [2]}));
    }

    #[test]
    fn test_cli_parses_negative_poll() {
        let cli = Cli::try_parse_from(["snapwatch", "watch", "/etc/app", "--poll-secs", "-1", "--dir"])
            .unwrap();
        match cli.command {
            Commands::Watch { dir, options, .. } => {
                assert!(dir);
                assert_eq!(options.poll_secs, Some(-1));
            }
            Commands::Load { .. } => panic!("expected watch"),
        }
    }
}
