//! Re-extraction of an animated preview's frames as still images, for
//! viewers that flip through stills instead of rendering the GIF.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{PreviewError, ToolError};
use crate::process::{ProcessRunner, Tool};
use crate::task_manager::CancelToken;

pub const COMPLETE_MARKER: &str = ".complete";
const FRAME_PREFIX: &str = "frame_";

/// Frame files in `dir`, in playback order.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, PreviewError> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PreviewError::io(dir, e))? {
        let entry = entry.map_err(|e| PreviewError::io(dir, e))?;
        let path = entry.path();
        let is_frame = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(FRAME_PREFIX) && n.ends_with(".png"))
            .unwrap_or(false);
        if is_frame && path.is_file() {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Deletes every 1×1 frame (a silent failure mode of the filter graph) and
/// returns the remaining frames in their original order.
pub fn discard_degenerate_frames(frames: Vec<PathBuf>) -> Result<Vec<PathBuf>, PreviewError> {
    let mut kept = Vec::with_capacity(frames.len());
    for frame in frames {
        let dimensions = image::image_dimensions(&frame).map_err(|source| PreviewError::Decode {
            path: frame.clone(),
            source,
        })?;

        if dimensions == (1, 1) {
            debug!("Removing degenerate frame {}", frame.display());
            fs::remove_file(&frame).map_err(|e| PreviewError::io(&frame, e))?;
            continue;
        }
        kept.push(frame);
    }
    Ok(kept)
}

/// Extracts `gif` at `fps` into `frames_dir`. The directory is assembled in a
/// staging directory next to it and renamed into place once complete.
pub(crate) fn extract_frames(
    runner: &ProcessRunner,
    gif: &Path,
    frames_dir: &Path,
    fps: u32,
    cancel: Option<&CancelToken>,
) -> Result<Vec<PathBuf>, PreviewError> {
    if frames_dir.join(COMPLETE_MARKER).is_file() {
        return list_frames(frames_dir);
    }

    let parent = frames_dir.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix(".frames-")
        .tempdir_in(parent)
        .map_err(|e| PreviewError::io(parent, e))?;

    let pattern = staging.path().join(format!("{}%04d.png", FRAME_PREFIX));
    let args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        gif.into(),
        "-vf".into(),
        format!("fps={}", fps).into(),
        "-f".into(),
        "image2".into(),
        pattern.clone().into(),
    ];
    let output = runner.run(Tool::Encoder, &args, cancel)?;

    let frames = list_frames(staging.path())?;
    if frames.is_empty() {
        return Err(ToolError::MissingOutput {
            tool: Tool::Encoder,
            path: pattern,
            output,
        }
        .into());
    }

    let kept = discard_degenerate_frames(frames)?;
    let marker = staging.path().join(COMPLETE_MARKER);
    fs::write(&marker, b"").map_err(|e| PreviewError::io(&marker, e))?;

    if frames_dir.exists() {
        // Left over from an interrupted run: no marker, so nothing references it.
        fs::remove_dir_all(frames_dir).map_err(|e| PreviewError::io(frames_dir, e))?;
    }

    let staged = staging.into_path();
    if let Err(e) = fs::rename(&staged, frames_dir) {
        if let Err(cleanup) = fs::remove_dir_all(&staged) {
            warn!("Failed to remove staging dir {}: {}", staged.display(), cleanup);
        }
        return Err(PreviewError::io(frames_dir, e));
    }

    Ok(kept
        .iter()
        .filter_map(|p| p.file_name())
        .map(|name| frames_dir.join(name))
        .collect())
}

pub(crate) fn remove_dir_if_exists(dir: &Path) -> Result<bool, PreviewError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PreviewError::io(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_frame(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        ImageBuffer::from_pixel(w, h, Rgb([10u8, 20, 30])).save(&path).unwrap();
        path
    }

    #[test]
    fn one_by_one_frames_are_deleted_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_frame(dir.path(), "frame_0001.png", 180, 101);
        let b = write_frame(dir.path(), "frame_0002.png", 1, 1);
        let c = write_frame(dir.path(), "frame_0003.png", 180, 101);
        let d = write_frame(dir.path(), "frame_0004.png", 1, 1);

        let frames = list_frames(dir.path()).unwrap();
        assert_eq!(frames, vec![a.clone(), b.clone(), c.clone(), d.clone()]);

        let kept = discard_degenerate_frames(frames).unwrap();
        assert_eq!(kept, vec![a, c]);
        assert!(!b.exists());
        assert!(!d.exists());
        assert_eq!(list_frames(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn thin_but_not_degenerate_frames_survive() {
        let dir = tempfile::tempdir().unwrap();
        let thin = write_frame(dir.path(), "frame_0001.png", 1, 2);
        let kept = discard_degenerate_frames(vec![thin.clone()]).unwrap();
        assert_eq!(kept, vec![thin]);
    }

    #[test]
    fn list_ignores_marker_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "frame_0001.png", 4, 4);
        fs::write(dir.path().join(COMPLETE_MARKER), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(list_frames(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn unreadable_frame_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("frame_0001.png");
        fs::write(&bad, b"garbage").unwrap();
        assert!(matches!(
            discard_degenerate_frames(vec![bad]),
            Err(PreviewError::Decode { .. })
        ));
    }
}
