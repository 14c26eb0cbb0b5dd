use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::ScanError;
use crate::index::{MediaIndex, UpsertOutcome};
use crate::models::{classify, is_hidden, FileType, MediaFile};
use crate::preview::PreviewScheduler;
use crate::utils::absolute_path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Media files found by the walk.
    pub discovered: usize,
    pub inserted: usize,
    pub existing: usize,
    /// Files with an extension outside the allow-lists.
    pub skipped: usize,
    pub failed: usize,
}

/// Walks directory trees and reconciles what it finds with the index.
pub struct DirectoryScanner {
    index: Arc<dyn MediaIndex>,
    scheduler: Option<Arc<PreviewScheduler>>,
}

impl DirectoryScanner {
    /// Without a scheduler the scanner only indexes: no previews are queued
    /// or evicted.
    pub fn new(index: Arc<dyn MediaIndex>, scheduler: Option<Arc<PreviewScheduler>>) -> Self {
        Self { index, scheduler }
    }

    pub fn index(&self) -> &Arc<dyn MediaIndex> {
        &self.index
    }

    /// Indexes every media file under `root` and records the scan on the
    /// root's folder row. Per-file failures are logged and counted.
    pub fn scan_directory(&self, root: &Path) -> Result<ScanSummary, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidRoot(root.to_path_buf()));
        }
        let root = absolute_path(root);
        info!("Scanning {}", root.display());

        let summary = self.walk(&root);
        self.index
            .record_folder_scan(&root.to_string_lossy(), summary.discovered)?;

        info!(
            "Scanned {}: {} media files ({} new, {} known), {} skipped, {} failed",
            root.display(),
            summary.discovered,
            summary.inserted,
            summary.existing,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }

    /// Startup pass: queues previews still missing from earlier runs, then
    /// scans every root. Repair runs first so files inserted by this scan are
    /// queued once, by the scan. Roots that cannot be scanned are logged and
    /// left out of the result.
    pub fn scan_roots(&self, roots: &[PathBuf]) -> Result<Vec<(PathBuf, ScanSummary)>, ScanError> {
        self.repair_missing_previews()?;

        let mut scanned = Vec::new();
        for root in roots {
            match self.scan_directory(root) {
                Ok(summary) => scanned.push((root.clone(), summary)),
                Err(e) => error!("Skipping {}: {}", root.display(), e),
            }
        }
        Ok(scanned)
    }

    /// Classifies, stats and upserts a single file, queueing its preview when
    /// the row is new. `None` for hidden files and unsupported extensions.
    pub fn index_file(&self, path: &Path) -> Result<Option<UpsertOutcome>, ScanError> {
        let Some((mut file, _)) = self.describe(path)? else {
            return Ok(None);
        };
        let outcome = self.index.upsert(&file)?;

        if let UpsertOutcome::Inserted(id) = outcome {
            file.id = id;
            self.schedule(&file);
        }
        Ok(Some(outcome))
    }

    /// Re-reads a file whose content changed: its artifacts are evicted, the
    /// row keeps its id and tags but takes the new size and modification
    /// time, and a fresh preview is queued. Unindexed files are indexed.
    pub fn refresh_file(&self, path: &Path) -> Result<Option<UpsertOutcome>, ScanError> {
        let Some((mut file, path)) = self.describe(path)? else {
            return Ok(None);
        };
        self.evict(&path);

        match self.index.refresh(&file)? {
            Some(id) => {
                file.id = id;
                self.schedule(&file);
                Ok(Some(UpsertOutcome::Existing(id)))
            }
            None => self.index_file(&path),
        }
    }

    /// Drops `path` and everything indexed beneath it, evicting their
    /// artifacts. Returns the number of rows removed.
    pub fn forget(&self, path: &Path) -> Result<usize, ScanError> {
        let key = path.to_string_lossy();
        let doomed = self.index.paths_under(&key)?;
        let removed = self.index.delete_by_directory_prefix(&key)?;

        for source in &doomed {
            self.evict(Path::new(source));
        }
        if classify(path).is_some() && !doomed.iter().any(|p| Path::new(p) == path) {
            self.evict(path);
        }
        Ok(removed)
    }

    /// Reconciles the index with `dir`: rows whose files are gone are dropped
    /// and their artifacts evicted, rows still backed by a file are kept as
    /// they are, and new files are inserted.
    pub fn rescan_directory(&self, dir: &Path) -> Result<ScanSummary, ScanError> {
        let dir = absolute_path(dir);

        let mut dropped = 0;
        for path in self.index.paths_under(&dir.to_string_lossy())? {
            let source = Path::new(&path);
            if source.is_file() {
                continue;
            }
            dropped += self.index.delete(&path)?;
            self.evict(source);
        }
        debug!("Rescanning {} ({} vanished rows dropped)", dir.display(), dropped);

        if !dir.is_dir() {
            return Ok(ScanSummary::default());
        }
        Ok(self.walk(&dir))
    }

    /// Queues generation for indexed images and videos that have no preview
    /// yet and still exist on disk. Returns the number of jobs queued.
    pub fn repair_missing_previews(&self) -> Result<usize, ScanError> {
        let Some(scheduler) = &self.scheduler else {
            return Ok(0);
        };

        let mut scheduled = 0;
        for file_type in [FileType::Video, FileType::Image] {
            for file in self.index.query_missing_previews(file_type)? {
                if !Path::new(&file.path).is_file() {
                    debug!("Source gone, not repairing {}", file.path);
                    continue;
                }
                if scheduler.schedule(&file) {
                    scheduled += 1;
                }
            }
        }

        if scheduled > 0 {
            info!("Queued {} missing preview(s)", scheduled);
        }
        Ok(scheduled)
    }

    /// The record `path` would be indexed as, with the absolute path it was
    /// built from.
    fn describe(&self, path: &Path) -> Result<Option<(MediaFile, PathBuf)>, ScanError> {
        let path = if path.is_relative() {
            absolute_path(path)
        } else {
            path.to_path_buf()
        };
        if is_hidden(&path) {
            return Ok(None);
        }
        let Some(file_type) = classify(&path) else {
            return Ok(None);
        };

        let metadata = fs::metadata(&path).map_err(|source| ScanError::Io {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let file = MediaFile::from_metadata(&path, &metadata, file_type);
        Ok(Some((file, path)))
    }

    fn schedule(&self, file: &MediaFile) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule(file);
        }
    }

    fn evict(&self, source: &Path) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if let Err(e) = scheduler.cache().evict(source) {
            warn!("Failed to evict previews of {}: {}", source.display(), e);
        }
    }

    fn walk(&self, root: &Path) -> ScanSummary {
        let mut summary = ScanSummary::default();

        let walker = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(root));
                    warn!("Failed to read {}: {}", path.display(), e);
                    summary.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            match self.index_file(entry.path()) {
                Ok(Some(outcome)) => {
                    summary.discovered += 1;
                    if outcome.is_inserted() {
                        summary.inserted += 1;
                    } else {
                        summary.existing += 1;
                    }
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    warn!("Failed to index {}: {}", entry.path().display(), e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"data").unwrap();
    }

    fn scanner() -> (DirectoryScanner, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (DirectoryScanner::new(db.clone(), None), db)
    }

    fn indexed_paths(db: &Database, root: &Path) -> Vec<String> {
        let mut paths: Vec<String> = db
            .query_missing_previews(FileType::Image)
            .unwrap()
            .into_iter()
            .chain(db.query_missing_previews(FileType::Video).unwrap())
            .map(|f| f.path)
            .collect();
        paths.sort();
        let root = absolute_path(root).to_string_lossy().to_string();
        paths
            .into_iter()
            .map(|p| p.trim_start_matches(&root).to_string())
            .collect()
    }

    #[test]
    fn rescanning_an_unchanged_tree_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.jpg"));
        touch(&dir.path().join("sub/b.MP4"));
        let (scanner, db) = scanner();

        let first = scanner.scan_directory(dir.path()).unwrap();
        assert_eq!((first.discovered, first.inserted), (2, 2));
        assert_eq!(db.count().unwrap(), 2);

        let second = scanner.scan_directory(dir.path()).unwrap();
        assert_eq!((second.inserted, second.existing), (0, 2));
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn hidden_entries_and_unknown_extensions_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("keep.png"));
        touch(&dir.path().join(".hidden.png"));
        touch(&dir.path().join(".cache/inside.png"));
        touch(&dir.path().join("notes.txt"));
        let (scanner, db) = scanner();

        let summary = scanner.scan_directory(dir.path()).unwrap();
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(indexed_paths(&db, dir.path()), vec!["/keep.png".to_string()]);
    }

    #[test]
    fn hidden_root_is_still_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".library");
        touch(&root.join("a.gif"));
        let (scanner, db) = scanner();

        assert_eq!(scanner.scan_directory(&root).unwrap().discovered, 1);
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn rescan_restores_exactly_the_present_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("album/one.jpg"));
        touch(&dir.path().join("album/two.jpg"));
        touch(&dir.path().join("album2/other.jpg"));
        let (scanner, db) = scanner();
        scanner.scan_directory(dir.path()).unwrap();
        assert_eq!(db.count().unwrap(), 3);

        fs::remove_file(dir.path().join("album/two.jpg")).unwrap();
        touch(&dir.path().join("album/three.webp"));

        let summary = scanner.rescan_directory(&dir.path().join("album")).unwrap();
        assert_eq!((summary.inserted, summary.existing), (1, 1));
        assert_eq!(
            indexed_paths(&db, dir.path()),
            vec![
                "/album/one.jpg".to_string(),
                "/album/three.webp".to_string(),
                "/album2/other.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn prefix_delete_then_scan_restores_the_present_set() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("album/one.jpg"));
        touch(&dir.path().join("album/two.jpg"));
        touch(&dir.path().join("album2/other.jpg"));
        let (scanner, db) = scanner();
        scanner.scan_directory(dir.path()).unwrap();

        fs::remove_file(dir.path().join("album/two.jpg")).unwrap();
        touch(&dir.path().join("album/three.webp"));
        let album = absolute_path(&dir.path().join("album"));
        db.delete_by_directory_prefix(&album.to_string_lossy()).unwrap();
        scanner.scan_directory(&album).unwrap();

        assert_eq!(
            indexed_paths(&db, dir.path()),
            vec![
                "/album/one.jpg".to_string(),
                "/album/three.webp".to_string(),
                "/album2/other.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn rescan_keeps_rows_of_files_still_present() {
        let dir = tempfile::tempdir().unwrap();
        let photo = absolute_path(dir.path()).join("album/one.jpg");
        touch(&photo);
        let (scanner, db) = scanner();
        scanner.scan_directory(dir.path()).unwrap();

        let key = photo.to_string_lossy().to_string();
        db.set_preview(
            &key,
            &crate::index::PreviewInfo {
                preview_path: "/cache/one.jpg".into(),
                width: Some(40),
                height: Some(30),
                duration: None,
            },
        )
        .unwrap();
        let before = db.get(&key).unwrap().unwrap();

        scanner.rescan_directory(&dir.path().join("album")).unwrap();
        assert_eq!(db.get(&key).unwrap().unwrap(), before);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entries_are_counted_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.jpg"));
        touch(&dir.path().join("b.png"));
        std::os::unix::fs::symlink(dir.path().join("nowhere.jpg"), dir.path().join("bad.jpg")).unwrap();
        let (scanner, db) = scanner();

        let summary = scanner.scan_directory(dir.path()).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.discovered, 2);
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn rescan_of_a_vanished_directory_drops_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("gone/a.jpg"));
        touch(&dir.path().join("stay.jpg"));
        let (scanner, db) = scanner();
        scanner.scan_directory(dir.path()).unwrap();

        fs::remove_dir_all(dir.path().join("gone")).unwrap();
        assert_eq!(
            scanner.rescan_directory(&dir.path().join("gone")).unwrap(),
            ScanSummary::default()
        );
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn invalid_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        touch(&file);
        let (scanner, _) = scanner();

        assert!(matches!(
            scanner.scan_directory(&dir.path().join("missing")),
            Err(ScanError::InvalidRoot(_))
        ));
        assert!(matches!(scanner.scan_directory(&file), Err(ScanError::InvalidRoot(_))));
    }

    #[test]
    fn scan_records_the_root_folder() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.jpg"));
        let (scanner, db) = scanner();
        scanner.scan_directory(dir.path()).unwrap();

        let folders = db.folders().unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].path, absolute_path(dir.path()).to_string_lossy());
        assert_eq!(folders[0].file_count, 1);
        assert!(folders[0].last_scanned.is_some());
    }

    #[test]
    fn index_file_ignores_unsupported_paths() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        touch(&notes);
        let (scanner, db) = scanner();

        assert_eq!(scanner.index_file(&notes).unwrap(), None);
        assert!(matches!(
            scanner.index_file(&dir.path().join("missing.jpg")),
            Err(ScanError::Io { .. })
        ));
        assert_eq!(db.count().unwrap(), 0);
    }

    mod with_previews {
        use super::*;
        use crate::preview::{ArtifactKind, PreviewCache, PreviewSettings};
        use crate::process::ProcessRunner;
        use crate::task_manager::TaskManager;
        use image::{ImageBuffer, Rgb};
        use std::time::Duration;

        struct Pipeline {
            library: PathBuf,
            db: Arc<Database>,
            cache: Arc<PreviewCache>,
            tasks: Arc<TaskManager>,
            scanner: DirectoryScanner,
        }

        fn pipeline(dir: &Path) -> Pipeline {
            let library = absolute_path(dir).join("library");
            fs::create_dir_all(&library).unwrap();

            let db = Arc::new(Database::open_in_memory().unwrap());
            let cache = Arc::new(
                PreviewCache::new(
                    dir.join("cache"),
                    Arc::new(ProcessRunner::default()),
                    PreviewSettings::default(),
                )
                .unwrap(),
            );
            let tasks = Arc::new(TaskManager::new(2).unwrap());
            let scheduler = Arc::new(PreviewScheduler::new(cache.clone(), db.clone(), tasks.clone()));
            Pipeline {
                scanner: DirectoryScanner::new(db.clone(), Some(scheduler)),
                library,
                db,
                cache,
                tasks,
            }
        }

        fn photo(path: &Path, width: u32, height: u32) {
            ImageBuffer::from_pixel(width, height, Rgb([5u8, 5, 5])).save(path).unwrap();
        }

        fn wait(tasks: &TaskManager) {
            assert!(tasks.wait_idle_timeout(Duration::from_secs(10)));
        }

        #[test]
        fn new_images_get_previews_and_repair_fills_gaps() {
            let dir = tempfile::tempdir().unwrap();
            let p = pipeline(dir.path());
            photo(&p.library.join("photo.png"), 40, 30);

            p.scanner.scan_directory(&p.library).unwrap();
            wait(&p.tasks);
            assert!(p.db.query_missing_previews(FileType::Image).unwrap().is_empty());

            // Nothing is missing, so repair has no work.
            assert_eq!(p.scanner.repair_missing_previews().unwrap(), 0);

            p.db.clear_all_preview_paths().unwrap();
            assert_eq!(p.scanner.repair_missing_previews().unwrap(), 1);
            wait(&p.tasks);
            assert!(p.db.query_missing_previews(FileType::Image).unwrap().is_empty());
        }

        #[test]
        fn rescan_keeps_measurements() {
            let dir = tempfile::tempdir().unwrap();
            let p = pipeline(dir.path());
            let source = p.library.join("photo.png");
            photo(&source, 40, 30);
            let key = source.to_string_lossy().to_string();

            p.scanner.scan_directory(&p.library).unwrap();
            wait(&p.tasks);
            p.scanner.rescan_directory(&p.library).unwrap();
            wait(&p.tasks);

            let row = p.db.get(&key).unwrap().unwrap();
            assert_eq!((row.width, row.height), (Some(40), Some(30)));
            assert!(row.preview_path.is_some());
        }

        #[test]
        fn rows_written_back_after_a_cache_hit_are_measured() {
            let dir = tempfile::tempdir().unwrap();
            let p = pipeline(dir.path());
            let source = p.library.join("photo.png");
            photo(&source, 40, 30);
            let key = source.to_string_lossy().to_string();

            p.scanner.scan_directory(&p.library).unwrap();
            wait(&p.tasks);

            // Row lost while the artifact stayed on disk.
            p.db.delete(&key).unwrap();
            p.scanner.scan_directory(&p.library).unwrap();
            wait(&p.tasks);

            let row = p.db.get(&key).unwrap().unwrap();
            assert_eq!((row.width, row.height), (Some(40), Some(30)));
        }

        #[test]
        fn rescan_evicts_artifacts_of_vanished_files() {
            let dir = tempfile::tempdir().unwrap();
            let p = pipeline(dir.path());
            let gone = p.library.join("gone.png");
            let kept = p.library.join("kept.png");
            photo(&gone, 20, 20);
            photo(&kept, 20, 20);

            p.scanner.scan_directory(&p.library).unwrap();
            wait(&p.tasks);
            let gone_thumb = p.cache.artifact_path(&gone, ArtifactKind::Thumbnail);
            assert!(gone_thumb.is_file());

            fs::remove_file(&gone).unwrap();
            p.scanner.rescan_directory(&p.library).unwrap();

            assert!(!gone_thumb.exists());
            assert!(p.cache.artifact_path(&kept, ArtifactKind::Thumbnail).is_file());
            assert_eq!(p.db.count().unwrap(), 1);
        }

        #[test]
        fn startup_queues_each_file_once() {
            let dir = tempfile::tempdir().unwrap();
            let p = pipeline(dir.path());
            for i in 0..10 {
                photo(&p.library.join(format!("old-{}.png", i)), 8, 8);
            }
            // Indexed by an earlier run that never rendered previews.
            DirectoryScanner::new(p.db.clone(), None)
                .scan_directory(&p.library)
                .unwrap();
            for i in 0..10 {
                photo(&p.library.join(format!("new-{}.png", i)), 8, 8);
            }

            let roots = vec![p.library.clone(), dir.path().join("missing")];
            let scanned = p.scanner.scan_roots(&roots).unwrap();
            wait(&p.tasks);

            assert_eq!(scanned.len(), 1);
            assert_eq!(scanned[0].1.inserted, 10);
            let info = p.tasks.get_info();
            assert_eq!((info.completed, info.failed), (20, 0));
            assert!(p.db.query_missing_previews(FileType::Image).unwrap().is_empty());
        }
    }
}
