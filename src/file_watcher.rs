use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};

use crate::models::{classify, is_hidden};
use crate::scanner::DirectoryScanner;
use crate::task_manager::{TaskManager, TaskOutcome};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// One debounced batch as delivered to the event loop.
pub type WatchBatch = Result<Vec<Event>, Vec<notify::Error>>;

type WatchedFolders = Arc<Mutex<Vec<PathBuf>>>;

fn lock(folders: &WatchedFolders) -> MutexGuard<'_, Vec<PathBuf>> {
    folders.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns filesystem events into index updates. Artifacts are evicted
/// through the scanner's preview cache.
pub struct WatchHandler {
    scanner: Arc<DirectoryScanner>,
    tasks: Arc<TaskManager>,
    watched_folders: WatchedFolders,
}

impl WatchHandler {
    pub fn new(scanner: Arc<DirectoryScanner>, tasks: Arc<TaskManager>) -> Self {
        Self {
            scanner,
            tasks,
            watched_folders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handles one debounced batch. Creates and removes are applied inline.
    /// A content change refreshes the file's row and preview in place. Every
    /// modification and rename also queues a rescan of the affected
    /// directory, at most one per directory.
    pub fn handle_events(&self, events: &[Event]) {
        let mut rescans = BTreeSet::new();
        let mut created = HashSet::new();

        for event in events {
            for path in &event.paths {
                if self.is_ignored(path) {
                    continue;
                }

                match &event.kind {
                    EventKind::Create(_) if path.is_dir() => {
                        rescans.insert(path.clone());
                    }
                    EventKind::Create(_) => {
                        self.file_created(path);
                        created.insert(path.clone());
                    }
                    EventKind::Remove(_) => self.removed(path),
                    EventKind::Modify(ModifyKind::Name(_)) => {
                        rescans.insert(affected_dir(path));
                    }
                    EventKind::Modify(_) if path.is_dir() => {
                        rescans.insert(path.clone());
                    }
                    EventKind::Modify(_) if classify(path).is_some() => {
                        // A file written right after its creation in this
                        // batch already has a fresh preview queued.
                        if path.is_file() && !created.contains(path) {
                            self.file_modified(path);
                        }
                        rescans.insert(affected_dir(path));
                    }
                    _ => {}
                }
            }
        }

        for dir in rescans {
            self.dispatch_rescan(dir);
        }
    }

    fn file_created(&self, path: &Path) {
        match self.scanner.index_file(path) {
            Ok(Some(outcome)) if outcome.is_inserted() => {
                info!("New media file detected: {}", path.display())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to index {}: {}", path.display(), e),
        }
    }

    fn file_modified(&self, path: &Path) {
        match self.scanner.refresh_file(path) {
            Ok(Some(_)) => debug!("Media file changed: {}", path.display()),
            Ok(None) => {}
            Err(e) => warn!("Failed to refresh {}: {}", path.display(), e),
        }
    }

    fn removed(&self, path: &Path) {
        match self.scanner.forget(path) {
            Ok(0) => {}
            Ok(n) => info!("Removed {} index row(s) for {}", n, path.display()),
            Err(e) => warn!("Failed to drop {} from the index: {}", path.display(), e),
        }
    }

    fn dispatch_rescan(&self, dir: PathBuf) {
        let scanner = Arc::clone(&self.scanner);
        self.tasks
            .spawn(format!("rescan {}", dir.display()), move |_| {
                match scanner.rescan_directory(&dir) {
                    Ok(summary) => {
                        debug!("Rescanned {}: {:?}", dir.display(), summary);
                        TaskOutcome::Done
                    }
                    Err(e) => {
                        warn!("Rescan of {} failed: {}", dir.display(), e);
                        TaskOutcome::Failed
                    }
                }
            });
    }

    /// Hidden entries below a watched root. Paths outside every root only
    /// have their own name checked.
    fn is_ignored(&self, path: &Path) -> bool {
        let folders = lock(&self.watched_folders);
        match folders.iter().find_map(|root| path.strip_prefix(root).ok()) {
            Some(relative) => relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.')),
            None => is_hidden(path),
        }
    }
}

/// Directory to rescan for a change at `path`.
fn affected_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        return path.to_path_buf();
    }
    path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf())
}

/// Drains `events` until every sender is gone.
pub fn run_event_loop(events: Receiver<WatchBatch>, handler: WatchHandler) {
    for batch in events {
        match batch {
            Ok(events) => handler.handle_events(&events),
            Err(errors) => {
                for error in errors {
                    warn!("File watcher error: {:?}", error);
                }
            }
        }
    }
    debug!("File watcher event loop finished");
}

pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    watched_folders: WatchedFolders,
    event_loop: JoinHandle<()>,
}

impl FileWatcher {
    pub fn new(handler: WatchHandler, debounce: Duration) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel::<WatchBatch>();
        let watched_folders = Arc::clone(&handler.watched_folders);

        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let batch = result.map(|events| events.into_iter().map(|e| e.event).collect());
            if tx.send(batch).is_err() {
                debug!("File watcher event loop is gone, dropping batch");
            }
        })?;

        let event_loop = thread::Builder::new()
            .name("file-watcher".to_string())
            .spawn(move || run_event_loop(rx, handler))
            .map_err(notify::Error::io)?;

        Ok(Self {
            debouncer,
            watched_folders,
            event_loop,
        })
    }

    pub fn watch(&mut self, folder: &Path) -> notify::Result<()> {
        info!("Starting to watch folder: {}", folder.display());
        self.debouncer
            .watcher()
            .watch(folder, RecursiveMode::Recursive)?;
        self.debouncer.cache().add_root(folder, RecursiveMode::Recursive);

        let mut folders = lock(&self.watched_folders);
        if !folders.iter().any(|f| f == folder) {
            folders.push(folder.to_path_buf());
        }
        Ok(())
    }

    pub fn unwatch(&mut self, folder: &Path) -> notify::Result<()> {
        info!("Stopping watch on folder: {}", folder.display());
        self.debouncer.watcher().unwatch(folder)?;
        self.debouncer.cache().remove_root(folder);

        lock(&self.watched_folders).retain(|f| f != folder);
        Ok(())
    }

    pub fn watched_folders(&self) -> Vec<PathBuf> {
        lock(&self.watched_folders).clone()
    }

    /// Blocks while the watcher runs.
    pub fn wait(self) {
        let Self {
            debouncer,
            event_loop,
            ..
        } = self;
        if event_loop.join().is_err() {
            warn!("File watcher event loop panicked");
        }
        drop(debouncer);
    }

    /// Stops delivering events and waits for the loop to drain what it has.
    pub fn stop(self) {
        let Self {
            debouncer,
            event_loop,
            ..
        } = self;
        debouncer.stop();
        if event_loop.join().is_err() {
            warn!("File watcher event loop panicked");
        }
    }
}
