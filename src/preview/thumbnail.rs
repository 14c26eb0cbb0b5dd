use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};

use super::{publish, stage_file, Artifact, ArtifactKind, PreviewSettings};
use crate::error::PreviewError;
use crate::process::{ProcessRunner, Tool};
use crate::task_manager::CancelToken;

/// Scale+crop expression that fills a `width`×`height` box, or fits inside
/// it when cropping is off.
pub(crate) fn box_filter(width: u32, height: u32, crop: bool) -> String {
    if crop {
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
            w = width,
            h = height
        )
    } else {
        format!("scale={}:{}:force_original_aspect_ratio=decrease", width, height)
    }
}

/// Reader whose format is sniffed from the content; extensions are not trusted.
fn open_image(source: &Path) -> Result<ImageReader<BufReader<File>>, PreviewError> {
    ImageReader::open(source)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| PreviewError::io(source, e))
}

/// Pixel size of an image without decoding it.
pub(crate) fn image_dimensions(source: &Path) -> Result<(u32, u32), PreviewError> {
    open_image(source)?
        .into_dimensions()
        .map_err(|source_err| PreviewError::Decode {
            path: source.to_path_buf(),
            source: source_err,
        })
}

/// Static JPEG thumbnails for images, and single-frame stills for videos.
pub struct ThumbnailGenerator {
    settings: PreviewSettings,
    runner: Arc<ProcessRunner>,
}

impl ThumbnailGenerator {
    pub fn new(settings: PreviewSettings, runner: Arc<ProcessRunner>) -> Self {
        Self { settings, runner }
    }

    pub fn image(&self, source: &Path, target: &Path) -> Result<Artifact, PreviewError> {
        let metadata = fs::metadata(source).map_err(|e| PreviewError::io(source, e))?;
        if metadata.len() == 0 {
            return Err(PreviewError::EmptySource(source.to_path_buf()));
        }

        let img = open_image(source)?
            .decode()
            .map_err(|source_err| PreviewError::Decode {
                path: source.to_path_buf(),
                source: source_err,
            })?;
        let (width, height) = (img.width(), img.height());

        let thumbnail = self.fit(&img);
        let staged = stage_file(target, ".jpg")?;
        self.write_jpeg(&thumbnail, staged.path())?;
        publish(staged, target)?;

        Ok(Artifact {
            path: target.to_path_buf(),
            kind: ArtifactKind::Thumbnail,
            cache_hit: false,
            width: Some(width),
            height: Some(height),
            duration: None,
            segments: None,
        })
    }

    /// One encoder invocation grabbing the frame at `video_frame_at` seconds.
    pub fn video_frame(
        &self,
        source: &Path,
        target: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<Artifact, PreviewError> {
        let s = &self.settings;
        let staged = stage_file(target, ".jpg")?;

        let args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-ss".into(),
            format!("{:.3}", s.video_frame_at).into(),
            "-i".into(),
            source.into(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            box_filter(s.width, s.height, s.crop).into(),
            "-q:v".into(),
            "3".into(),
            // Explicit muxer: without it a single-file output is treated as a
            // sequence pattern.
            "-f".into(),
            "image2".into(),
            staged.path().into(),
        ];

        self.runner
            .run_producing(Tool::Encoder, &args, staged.path(), cancel)?;
        publish(staged, target)?;

        Ok(Artifact::generated(target, ArtifactKind::VideoFrame))
    }

    fn fit(&self, img: &DynamicImage) -> DynamicImage {
        let (w, h) = (self.settings.width, self.settings.height);
        if self.settings.crop {
            img.resize_to_fill(w, h, FilterType::Lanczos3)
        } else {
            img.resize(w, h, FilterType::Lanczos3)
        }
    }

    fn write_jpeg(&self, img: &DynamicImage, path: &Path) -> Result<(), PreviewError> {
        let file = fs::File::create(path).map_err(|e| PreviewError::io(path, e))?;
        let mut writer = BufWriter::new(file);

        let encoder = JpegEncoder::new_with_quality(&mut writer, self.settings.jpeg_quality);
        DynamicImage::ImageRgb8(img.to_rgb8())
            .write_with_encoder(encoder)
            .map_err(|source| PreviewError::Encode {
                path: path.to_path_buf(),
                source,
            })?;

        writer.flush().map_err(|e| PreviewError::io(path, e))?;
        Ok(())
    }
}
