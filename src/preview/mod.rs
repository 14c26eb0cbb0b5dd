//! Content-addressed preview artifacts.
//!
//! Every artifact lives flat under the cache directory and is named after the
//! BLAKE3 digest of its source's absolute path, so the same source always maps
//! to the same file and a present file is a finished one.

pub mod animated;
pub mod frames;
pub(crate) mod in_flight;
pub mod scheduler;
pub mod thumbnail;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tempfile::NamedTempFile;

pub use animated::{AnimatedPreviewGenerator, EncodeStrategy, HwBackend, Segment, SegmentPlan};
pub use scheduler::PreviewScheduler;
pub use thumbnail::ThumbnailGenerator;

use crate::error::PreviewError;
use crate::index::PreviewInfo;
use crate::models::{classify, FileType};
use crate::process::ProcessRunner;
use crate::task_manager::CancelToken;
use crate::utils::hash_path;
use in_flight::InFlight;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Thumbnail,
    VideoFrame,
    AnimatedPreview,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Thumbnail,
        ArtifactKind::VideoFrame,
        ArtifactKind::AnimatedPreview,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            ArtifactKind::Thumbnail => ".jpg",
            ArtifactKind::VideoFrame => ".frame.jpg",
            ArtifactKind::AnimatedPreview => ".gif",
        }
    }
}

/// Result of a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// True when the artifact already existed and no work was done.
    pub cache_hit: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub segments: Option<usize>,
}

impl Artifact {
    pub(crate) fn generated(target: &Path, kind: ArtifactKind) -> Self {
        Self {
            path: target.to_path_buf(),
            kind,
            cache_hit: false,
            width: None,
            height: None,
            duration: None,
            segments: None,
        }
    }

    fn hit(target: &Path, kind: ArtifactKind) -> Self {
        Self {
            cache_hit: true,
            ..Self::generated(target, kind)
        }
    }

    pub fn preview_info(&self) -> PreviewInfo {
        PreviewInfo {
            preview_path: self.path.to_string_lossy().to_string(),
            width: self.width,
            height: self.height,
            duration: self.duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSettings {
    pub width: u32,
    pub height: u32,
    pub crop: bool,
    pub jpeg_quality: u8,
    pub gif_fps: u32,
    pub segment_seconds: f64,
    pub frame_extract_fps: u32,
    /// Timestamp of the still grabbed for `ArtifactKind::VideoFrame`.
    pub video_frame_at: f64,
    pub strategy: EncodeStrategy,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            width: 180,
            height: 101,
            crop: true,
            jpeg_quality: 85,
            gif_fps: 12,
            segment_seconds: 1.0,
            frame_extract_fps: 4,
            video_frame_at: 1.0,
            strategy: EncodeStrategy::Cpu,
        }
    }
}

/// Hidden scratch file next to `target`, removed on drop unless published.
pub(crate) fn stage_file(target: &Path, suffix: &str) -> Result<NamedTempFile, PreviewError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new()
        .prefix(".staging-")
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|e| PreviewError::io(dir, e))
}

/// Renames a finished staging file onto `target`. Empty files are refused so
/// a present artifact is always a usable one.
pub(crate) fn publish(staged: NamedTempFile, target: &Path) -> Result<(), PreviewError> {
    let len = fs::metadata(staged.path())
        .map_err(|e| PreviewError::io(staged.path(), e))?
        .len();
    if len == 0 {
        return Err(PreviewError::io(
            target,
            io::Error::new(io::ErrorKind::UnexpectedEof, "generated artifact is empty"),
        ));
    }

    staged
        .persist(target)
        .map_err(|e| PreviewError::io(target, e.error))?;
    Ok(())
}

pub struct PreviewCache {
    cache_dir: PathBuf,
    settings: PreviewSettings,
    thumbnails: ThumbnailGenerator,
    animated: AnimatedPreviewGenerator,
    runner: Arc<ProcessRunner>,
    video_enabled: bool,
    artifacts: InFlight<Artifact>,
    frames: InFlight<Vec<PathBuf>>,
}

impl PreviewCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        runner: Arc<ProcessRunner>,
        settings: PreviewSettings,
    ) -> Result<Self, PreviewError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| PreviewError::io(&cache_dir, e))?;

        Ok(Self {
            thumbnails: ThumbnailGenerator::new(settings.clone(), Arc::clone(&runner)),
            animated: AnimatedPreviewGenerator::new(settings.clone(), Arc::clone(&runner)),
            cache_dir,
            settings,
            runner,
            video_enabled: true,
            artifacts: InFlight::new(),
            frames: InFlight::new(),
        })
    }

    /// With video disabled every video request fails fast with
    /// `PreviewError::VideoDisabled`; used when the encoder is missing.
    pub fn with_video_enabled(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn settings(&self) -> &PreviewSettings {
        &self.settings
    }

    pub fn artifact_path(&self, source: &Path, kind: ArtifactKind) -> PathBuf {
        self.cache_dir
            .join(format!("{}{}", hash_path(source), kind.suffix()))
    }

    pub fn frames_dir(&self, source: &Path) -> PathBuf {
        self.cache_dir.join(format!("{}_frames", hash_path(source)))
    }

    /// The primary artifact for `source`: a thumbnail for images, an animated
    /// preview for videos.
    pub fn generate(&self, source: &Path, cancel: Option<&CancelToken>) -> Result<Artifact, PreviewError> {
        match classify(source) {
            Some(FileType::Image) => self.thumbnail(source),
            Some(FileType::Video) => self.animated_preview(source, cancel),
            _ => Err(PreviewError::Unsupported(source.to_path_buf())),
        }
    }

    pub fn thumbnail(&self, source: &Path) -> Result<Artifact, PreviewError> {
        self.produce(source, ArtifactKind::Thumbnail, FileType::Image, None, |target| {
            self.thumbnails.image(source, target)
        })
    }

    pub fn video_frame(&self, source: &Path, cancel: Option<&CancelToken>) -> Result<Artifact, PreviewError> {
        self.produce(source, ArtifactKind::VideoFrame, FileType::Video, cancel, |target| {
            self.thumbnails.video_frame(source, target, cancel)
        })
    }

    pub fn animated_preview(&self, source: &Path, cancel: Option<&CancelToken>) -> Result<Artifact, PreviewError> {
        self.produce(source, ArtifactKind::AnimatedPreview, FileType::Video, cancel, |target| {
            self.animated.generate(source, target, cancel)
        })
    }

    /// Stills of the animated preview, generating the GIF first if needed.
    pub fn extract_frames(&self, source: &Path, cancel: Option<&CancelToken>) -> Result<Vec<PathBuf>, PreviewError> {
        let gif = self.animated_preview(source, cancel)?;
        let dir = self.frames_dir(source);
        self.frames.run(&dir, || {
            frames::extract_frames(
                &self.runner,
                &gif.path,
                &dir,
                self.settings.frame_extract_fps,
                cancel,
            )
        })
    }

    /// Deletes every artifact derived from `source`. Returns how many were removed.
    pub fn evict(&self, source: &Path) -> Result<usize, PreviewError> {
        let mut removed = 0;
        for kind in ArtifactKind::ALL {
            let path = self.artifact_path(source, kind);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(PreviewError::io(&path, e)),
            }
        }
        if frames::remove_dir_if_exists(&self.frames_dir(source))? {
            removed += 1;
        }

        if removed > 0 {
            debug!("Evicted {} artifact(s) for {}", removed, source.display());
        }
        Ok(removed)
    }

    /// Deletes every animated preview and extracted frame directory. Returns
    /// the number of GIFs removed.
    pub fn clear_animated_previews(&self) -> Result<usize, PreviewError> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.cache_dir).map_err(|e| PreviewError::io(&self.cache_dir, e))?;

        for entry in entries {
            let path = entry.map_err(|e| PreviewError::io(&self.cache_dir, e))?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if path.is_dir() && name.ends_with("_frames") {
                frames::remove_dir_if_exists(&path)?;
            } else if path.is_file() && name.ends_with(ArtifactKind::AnimatedPreview.suffix()) {
                fs::remove_file(&path).map_err(|e| PreviewError::io(&path, e))?;
                removed += 1;
            }
        }

        info!("Removed {} animated preview(s) from {}", removed, self.cache_dir.display());
        Ok(removed)
    }

    fn produce<F>(
        &self,
        source: &Path,
        kind: ArtifactKind,
        expected: FileType,
        cancel: Option<&CancelToken>,
        generate: F,
    ) -> Result<Artifact, PreviewError>
    where
        F: FnOnce(&Path) -> Result<Artifact, PreviewError>,
    {
        if classify(source) != Some(expected) {
            return Err(PreviewError::Unsupported(source.to_path_buf()));
        }
        if expected == FileType::Video && !self.video_enabled {
            return Err(PreviewError::VideoDisabled);
        }

        let target = self.artifact_path(source, kind);
        if target.is_file() {
            debug!("Cache hit for {}", source.display());
            return Ok(self.measure_hit(source, &target, kind, cancel));
        }

        self.artifacts.run(&target, || {
            // Published by a leader that finished between our check and the registry.
            if target.is_file() {
                return Ok(self.measure_hit(source, &target, kind, cancel));
            }
            generate(&target)
        })
    }

    /// A cache hit carrying the same source measurements a fresh generation
    /// would report. Measurement failures leave the fields empty.
    fn measure_hit(
        &self,
        source: &Path,
        target: &Path,
        kind: ArtifactKind,
        cancel: Option<&CancelToken>,
    ) -> Artifact {
        let mut artifact = Artifact::hit(target, kind);
        match kind {
            ArtifactKind::Thumbnail => match thumbnail::image_dimensions(source) {
                Ok((width, height)) => {
                    artifact.width = Some(width);
                    artifact.height = Some(height);
                }
                Err(e) => debug!("Cannot measure {}: {}", source.display(), e),
            },
            ArtifactKind::AnimatedPreview => match self.runner.probe_duration(source, cancel) {
                Ok(duration) => {
                    let plan = SegmentPlan::for_duration(duration, self.settings.segment_seconds);
                    artifact.duration = Some(duration);
                    artifact.segments = Some(plan.len());
                }
                Err(e) => debug!("Cannot measure {}: {}", source.display(), e),
            },
            ArtifactKind::VideoFrame => {}
        }
        artifact
    }
}
