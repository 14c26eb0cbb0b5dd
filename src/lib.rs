//! Scan-index-preview pipeline for a media library: walks directory trees,
//! keeps a SQLite index in step with the filesystem and renders cached
//! thumbnails and animated previews through `ffmpeg`.

pub mod config;
pub mod db;
pub mod error;
pub mod file_watcher;
pub mod index;
pub mod models;
pub mod preview;
pub mod process;
pub mod scanner;
pub mod task_manager;
pub mod utils;

pub use config::Config;
pub use db::Database;
pub use error::{IndexError, PreviewError, ScanError, ToolError};
pub use file_watcher::{FileWatcher, WatchHandler};
pub use index::{MediaIndex, PreviewInfo, UpsertOutcome};
pub use models::{FileType, MediaFile, Tag};
pub use preview::{Artifact, ArtifactKind, PreviewCache, PreviewScheduler, PreviewSettings};
pub use process::{ProcessRunner, Tool};
pub use scanner::{DirectoryScanner, ScanSummary};
pub use task_manager::{CancelToken, TaskInfo, TaskManager};
