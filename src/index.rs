//! The contract the pipeline uses to reach the persisted media index.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::IndexError;
use crate::models::{FileType, MediaFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created with this id.
    Inserted(i64),
    /// The path was already indexed; nothing changed.
    Existing(i64),
}

impl UpsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// Artifact reference written back after a preview has been generated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewInfo {
    pub preview_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Folder {
    pub path: String,
    pub name: String,
    pub last_scanned: Option<DateTime<Utc>>,
    pub file_count: i64,
}

/// Persisted mapping from file path to `MediaFile`. Implementations must be
/// safe to call from many threads at once.
pub trait MediaIndex: Send + Sync {
    /// Inserts `file` unless its path is already indexed.
    fn upsert(&self, file: &MediaFile) -> Result<UpsertOutcome, IndexError>;

    fn get(&self, path: &str) -> Result<Option<MediaFile>, IndexError>;

    fn count(&self) -> Result<usize, IndexError>;

    fn delete(&self, path: &str) -> Result<usize, IndexError>;

    /// Deletes `dir` and every path beneath it.
    fn delete_by_directory_prefix(&self, dir: &str) -> Result<usize, IndexError>;

    /// Indexed paths equal to `dir` or beneath it, sorted.
    fn paths_under(&self, dir: &str) -> Result<Vec<String>, IndexError>;

    /// Takes size, modification time and MIME type from `file` for an
    /// already indexed path and forgets its preview and measurements.
    /// Returns the row id, or `None` when the path is not indexed.
    fn refresh(&self, file: &MediaFile) -> Result<Option<i64>, IndexError>;

    fn set_preview(&self, path: &str, preview: &PreviewInfo) -> Result<(), IndexError>;

    fn clear_all_preview_paths(&self) -> Result<usize, IndexError>;

    fn query_missing_previews(&self, file_type: FileType) -> Result<Vec<MediaFile>, IndexError>;

    fn record_folder_scan(&self, dir: &str, file_count: usize) -> Result<(), IndexError>;

    fn folders(&self) -> Result<Vec<Folder>, IndexError>;
}
