//! Error types for the scan-index-preview pipeline

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::Tool;

/// Errors raised by the persisted media index
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to prepare database location {path:?}: {source}")]
    Location {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index lock poisoned")]
    Poisoned,

    #[error("invalid tag name: {0:?}")]
    InvalidTag(String),
}

/// Errors raised while walking a directory tree
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("not a directory: {0:?}")]
    InvalidRoot(PathBuf),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Failures of an external tool invocation
#[derive(Debug, Error)]
pub enum ToolError {
    /// The executable is not installed or not on `PATH`.
    #[error("{tool} not found at {program:?}")]
    NotFound { tool: Tool, program: PathBuf },

    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {code:?}: {output}")]
    NonZeroExit {
        tool: Tool,
        code: Option<i32>,
        output: String,
    },

    #[error("{tool} reported success but produced no output at {path:?}: {output}")]
    MissingOutput {
        tool: Tool,
        path: PathBuf,
        output: String,
    },

    #[error("{tool} did not finish within {after:?}")]
    TimedOut { tool: Tool, after: Duration },

    #[error("{tool} was cancelled")]
    Cancelled { tool: Tool },

    #[error("could not parse {tool} output {output:?}")]
    Probe { tool: Tool, output: String },

    #[error("i/o error while running {tool}: {source}")]
    Io {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// True when the tool itself is unavailable, as opposed to failing on a
    /// particular input.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ToolError::NotFound { .. })
    }
}

/// Errors raised while producing a preview artifact
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("unsupported file type: {0:?}")]
    Unsupported(PathBuf),

    #[error("source file is empty: {0:?}")]
    EmptySource(PathBuf),

    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("video previews are disabled")]
    VideoDisabled,

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A concurrent request for the same artifact failed; carries its message.
    #[error("generation of {target:?} failed: {message}")]
    Shared { target: PathBuf, message: String },
}

impl PreviewError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PreviewError::Io {
            path: path.into(),
            source,
        }
    }
}
