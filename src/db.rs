use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use crate::error::IndexError;
use crate::index::{Folder, MediaIndex, PreviewInfo, UpsertOutcome};
use crate::models::{FileType, MediaFile, Tag};

const MEDIA_COLUMNS: &str = "id, path, filename, size, modified_at, file_type, mime_type,
                             preview_path, width, height, duration";

/// SQLite-backed `MediaIndex`. One connection, serialized behind a mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, IndexError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| IndexError::Location {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        debug!("Opened index at {}", db_path.display());

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        init_schema(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, IndexError> {
        self.conn.lock().map_err(|_| IndexError::Poisoned)
    }
}

fn init_schema(conn: &Connection) -> SqlResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS media_files (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            size INTEGER NOT NULL,
            modified_at TEXT NOT NULL,
            file_type TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            preview_path TEXT,
            width INTEGER,
            height INTEGER,
            duration REAL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            last_scanned TEXT,
            file_count INTEGER DEFAULT 0,
            added_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            color TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS media_tags (
            media_id INTEGER NOT NULL REFERENCES media_files(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (media_id, tag_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_media_type
         ON media_files(file_type)",
        [],
    )?;

    Ok(())
}

fn parse_timestamp(idx: usize, value: String) -> SqlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn media_file_from_row(row: &Row<'_>) -> SqlResult<MediaFile> {
    let file_type: String = row.get(5)?;
    Ok(MediaFile {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        size: row.get(3)?,
        modified_at: parse_timestamp(4, row.get(4)?)?,
        file_type: file_type.parse().unwrap_or(FileType::Unknown),
        mime_type: row.get(6)?,
        preview_path: row.get(7)?,
        width: row.get(8)?,
        height: row.get(9)?,
        duration: row.get(10)?,
    })
}

fn tag_from_row(row: &Row<'_>) -> SqlResult<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        created_at: parse_timestamp(3, row.get(3)?)?,
    })
}

/// `dir` without trailing separators, and the prefix every descendant starts with.
fn directory_bounds(dir: &str) -> (String, String) {
    let trimmed = dir.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        return (dir.to_string(), dir.to_string());
    }
    (trimmed.to_string(), format!("{}{}", trimmed, MAIN_SEPARATOR_STR))
}

impl MediaIndex for Database {
    fn upsert(&self, file: &MediaFile) -> Result<UpsertOutcome, IndexError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO media_files
             (path, filename, size, modified_at, file_type, mime_type, preview_path, width, height, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(path) DO NOTHING",
            params![
                file.path,
                file.filename,
                file.size,
                file.modified_at.to_rfc3339(),
                file.file_type.as_str(),
                file.mime_type,
                file.preview_path,
                file.width,
                file.height,
                file.duration,
            ],
        )?;

        if inserted == 1 {
            return Ok(UpsertOutcome::Inserted(conn.last_insert_rowid()));
        }

        let id = conn.query_row(
            "SELECT id FROM media_files WHERE path = ?1",
            [&file.path],
            |row| row.get(0),
        )?;
        Ok(UpsertOutcome::Existing(id))
    }

    fn get(&self, path: &str) -> Result<Option<MediaFile>, IndexError> {
        let conn = self.conn()?;
        let file = conn
            .query_row(
                &format!("SELECT {} FROM media_files WHERE path = ?1", MEDIA_COLUMNS),
                [path],
                media_file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    fn count(&self) -> Result<usize, IndexError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn delete(&self, path: &str) -> Result<usize, IndexError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM media_files WHERE path = ?1", [path])?)
    }

    fn delete_by_directory_prefix(&self, dir: &str) -> Result<usize, IndexError> {
        let (dir, prefix) = directory_bounds(dir);
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM media_files
             WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
            params![dir, prefix],
        )?;
        debug!("Deleted {} index row(s) under {}", deleted, dir);
        Ok(deleted)
    }

    fn paths_under(&self, dir: &str) -> Result<Vec<String>, IndexError> {
        let (dir, prefix) = directory_bounds(dir);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT path FROM media_files
             WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
             ORDER BY path",
        )?;

        let paths = stmt
            .query_map(params![dir, prefix], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(paths)
    }

    fn refresh(&self, file: &MediaFile) -> Result<Option<i64>, IndexError> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "UPDATE media_files
                 SET size = ?2, modified_at = ?3, mime_type = ?4,
                     preview_path = NULL, width = NULL, height = NULL, duration = NULL
                 WHERE path = ?1
                 RETURNING id",
                params![
                    file.path,
                    file.size,
                    file.modified_at.to_rfc3339(),
                    file.mime_type
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn set_preview(&self, path: &str, preview: &PreviewInfo) -> Result<(), IndexError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE media_files
             SET preview_path = ?2,
                 width = COALESCE(?3, width),
                 height = COALESCE(?4, height),
                 duration = COALESCE(?5, duration)
             WHERE path = ?1",
            params![path, preview.preview_path, preview.width, preview.height, preview.duration],
        )?;
        Ok(())
    }

    fn clear_all_preview_paths(&self) -> Result<usize, IndexError> {
        let conn = self.conn()?;
        let cleared = conn.execute(
            "UPDATE media_files SET preview_path = NULL
             WHERE preview_path IS NOT NULL AND preview_path != ''",
            [],
        )?;
        info!("Cleared previews: {} records updated", cleared);
        Ok(cleared)
    }

    fn query_missing_previews(&self, file_type: FileType) -> Result<Vec<MediaFile>, IndexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM media_files
             WHERE file_type = ?1 AND (preview_path IS NULL OR preview_path = '')
             ORDER BY path",
            MEDIA_COLUMNS
        ))?;

        let files = stmt
            .query_map([file_type.as_str()], media_file_from_row)?
            .collect::<SqlResult<Vec<MediaFile>>>()?;

        Ok(files)
    }

    fn record_folder_scan(&self, dir: &str, file_count: usize) -> Result<(), IndexError> {
        let name = Path::new(dir)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.to_string());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO folders (path, name, last_scanned, file_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                last_scanned = excluded.last_scanned,
                file_count = excluded.file_count",
            params![dir, name, Utc::now().to_rfc3339(), file_count as i64],
        )?;
        Ok(())
    }

    fn folders(&self) -> Result<Vec<Folder>, IndexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT path, name, last_scanned, file_count FROM folders ORDER BY path",
        )?;

        let folders = stmt
            .query_map([], |row| {
                let last_scanned: Option<String> = row.get(2)?;
                Ok(Folder {
                    path: row.get(0)?,
                    name: row.get(1)?,
                    last_scanned: last_scanned.map(|s| parse_timestamp(2, s)).transpose()?,
                    file_count: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<Folder>>>()?;

        Ok(folders)
    }
}

impl Database {
    /// Creates the tag `name`, or returns the existing one. A given `color`
    /// replaces the stored one.
    pub fn create_tag(&self, name: &str, color: Option<&str>) -> Result<Tag, IndexError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IndexError::InvalidTag(name.to_string()));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tags (name, color, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET color = COALESCE(excluded.color, tags.color)",
            params![name, color, Utc::now().to_rfc3339()],
        )?;
        let tag = conn.query_row(
            "SELECT id, name, color, created_at FROM tags WHERE name = ?1",
            [name],
            tag_from_row,
        )?;
        Ok(tag)
    }

    pub fn tags(&self) -> Result<Vec<Tag>, IndexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, color, created_at FROM tags ORDER BY name")?;
        let tags = stmt
            .query_map([], tag_from_row)?
            .collect::<SqlResult<Vec<Tag>>>()?;
        Ok(tags)
    }

    /// Removes a tag and every link to it.
    pub fn delete_tag(&self, tag_id: i64) -> Result<bool, IndexError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM tags WHERE id = ?1", [tag_id])? == 1)
    }

    /// Links the indexed file at `path` to a tag. False when the path is not
    /// indexed or the link already exists.
    pub fn tag_file(&self, path: &str, tag_id: i64) -> Result<bool, IndexError> {
        let conn = self.conn()?;
        let linked = conn.execute(
            "INSERT OR IGNORE INTO media_tags (media_id, tag_id)
             SELECT id, ?2 FROM media_files WHERE path = ?1",
            params![path, tag_id],
        )?;
        Ok(linked == 1)
    }

    pub fn untag_file(&self, path: &str, tag_id: i64) -> Result<bool, IndexError> {
        let conn = self.conn()?;
        let unlinked = conn.execute(
            "DELETE FROM media_tags
             WHERE tag_id = ?2 AND media_id = (SELECT id FROM media_files WHERE path = ?1)",
            params![path, tag_id],
        )?;
        Ok(unlinked == 1)
    }

    pub fn tags_for(&self, path: &str) -> Result<Vec<Tag>, IndexError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name, t.color, t.created_at
             FROM tags t
             JOIN media_tags mt ON mt.tag_id = t.id
             JOIN media_files m ON m.id = mt.media_id
             WHERE m.path = ?1
             ORDER BY t.name",
        )?;
        let tags = stmt
            .query_map([path], tag_from_row)?
            .collect::<SqlResult<Vec<Tag>>>()?;
        Ok(tags)
    }
}

/// Default index location: `~/.media-manager/media.db`.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".media-manager").join("media.db"))
}
