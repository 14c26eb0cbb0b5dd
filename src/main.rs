//! Media Manager CLI
//!
//! Indexes a media directory, renders previews in the background and keeps
//! the index in step with the filesystem until interrupted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use serde_json::json;

use media_manager::utils::absolute_path;
use media_manager::{
    Config, Database, DirectoryScanner, FileWatcher, MediaIndex, PreviewCache, PreviewScheduler,
    ProcessRunner, TaskManager, Tool, WatchHandler,
};

/// Headless media library indexer
#[derive(Parser)]
#[command(name = "media-manager")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to index; defaults to the configured media_dirs, then the
    /// current directory
    dir: Option<PathBuf>,

    /// Delete the preview cache and the index before starting
    #[arg(long, visible_alias = "dev-reset")]
    reset_all: bool,

    /// Delete every animated preview, clear all preview paths and exit
    #[arg(long)]
    clear_previews: bool,

    /// Scan, wait for previews to finish, print a JSON report and exit
    #[arg(long)]
    no_watch: bool,

    /// Config file to use instead of ~/.media-manager/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());

    let db_path = PathBuf::from(&config.database_path);
    let cache_dir = PathBuf::from(&config.cache_folder);

    if cli.reset_all {
        reset_all(&db_path, &cache_dir)?;
    }

    let db = Arc::new(
        Database::open(&db_path)
            .with_context(|| format!("Failed to open index at {}", db_path.display()))?,
    );
    if env_flag("CLEAR_DB_ON_START") {
        db.clear_all_preview_paths()?;
    }

    let runner = Arc::new(
        ProcessRunner::new(&config.ffprobe_path, &config.ffmpeg_path).with_timeout(config.tool_timeout()),
    );
    let video_enabled = runner.is_available(Tool::Encoder) && runner.is_available(Tool::Probe);
    if !video_enabled {
        warn!(
            "{} or {} not found; video previews are disabled",
            config.ffmpeg_path, config.ffprobe_path
        );
    }

    let cache = Arc::new(
        PreviewCache::new(&cache_dir, runner, config.preview_settings()?)?
            .with_video_enabled(video_enabled),
    );

    if cli.clear_previews {
        let removed = cache.clear_animated_previews()?;
        let cleared = db.clear_all_preview_paths()?;
        info!("Cleared {} animated previews and {} preview paths", removed, cleared);
        return Ok(());
    }

    let tasks = Arc::new(TaskManager::new(config.workers)?);
    let index: Arc<dyn MediaIndex> = db.clone();
    let scheduler = Arc::new(PreviewScheduler::new(cache, index.clone(), tasks.clone()));
    let scanner = Arc::new(DirectoryScanner::new(index, Some(scheduler)));

    let scanned = scanner.scan_roots(&requested_roots(&cli, &config)?)?;
    if scanned.is_empty() {
        anyhow::bail!("No directory could be scanned");
    }
    let summaries: Vec<_> = scanned
        .iter()
        .map(|(root, summary)| json!({ "root": root, "summary": summary }))
        .collect();
    let roots: Vec<PathBuf> = scanned.into_iter().map(|(root, _)| root).collect();

    if cli.no_watch {
        info!("Waiting for {} background task(s)", tasks.get_info().pending);
        tasks.wait_idle();

        let report = json!({
            "scans": summaries,
            "indexed": db.count()?,
            "tasks": tasks.get_info(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let handler = WatchHandler::new(scanner, tasks);
    let mut watcher = FileWatcher::new(handler, config.watch_debounce())?;
    for root in &roots {
        watcher
            .watch(root)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
    }

    info!("Watching {} folder(s); press Ctrl+C to stop", roots.len());
    watcher.wait();
    Ok(())
}

fn requested_roots(cli: &Cli, config: &Config) -> Result<Vec<PathBuf>> {
    let roots = match &cli.dir {
        Some(dir) => vec![dir.clone()],
        None if !config.media_dirs.is_empty() => config.media_dirs.iter().map(PathBuf::from).collect(),
        None => vec![std::env::current_dir().context("Cannot determine current directory")?],
    };
    Ok(roots.iter().map(|r| absolute_path(r)).collect())
}

fn reset_all(db_path: &Path, cache_dir: &Path) -> Result<()> {
    warn!(
        "Resetting index {} and cache {}",
        db_path.display(),
        cache_dir.display()
    );

    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let path = PathBuf::from(path);
        match fs::remove_file(&path) {
            Ok(()) => info!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    match fs::remove_dir_all(cache_dir) {
        Ok(()) => info!("Removed {}", cache_dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", cache_dir.display())),
    }
    Ok(())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
