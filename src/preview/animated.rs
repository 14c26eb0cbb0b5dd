//! Sampled animated GIF previews for videos.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;

use super::thumbnail::box_filter;
use super::{publish, stage_file, Artifact, ArtifactKind, PreviewSettings};
use crate::error::PreviewError;
use crate::process::{ProcessRunner, Tool};
use crate::task_manager::CancelToken;

pub const MAX_SEGMENTS: usize = 10;

/// Number of segments sampled from a clip of `duration` seconds:
/// `clamp(min(10, whole - 1), 1, 10)`, where `whole` counts the whole seconds
/// that begin strictly before the end of the clip.
pub fn segment_count(duration: f64) -> usize {
    if !duration.is_finite() || duration <= 0.0 {
        return 1;
    }
    let whole = (duration.ceil() as i64 - 1).max(0);
    (whole - 1).min(MAX_SEGMENTS as i64).clamp(1, MAX_SEGMENTS as i64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub length: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    segments: Vec<Segment>,
}

impl SegmentPlan {
    /// Evenly spaces `segment_count(duration)` segments from the start of the
    /// clip to `duration - length`.
    pub fn for_duration(duration: f64, segment_length: f64) -> Self {
        let count = segment_count(duration);
        let known = duration.is_finite() && duration > 0.0;
        let length = if known {
            segment_length.min(duration)
        } else {
            segment_length
        };
        let span = if known { (duration - length).max(0.0) } else { 0.0 };
        let step = if count > 1 { span / (count - 1) as f64 } else { 0.0 };

        let segments = (0..count)
            .map(|i| Segment {
                start: i as f64 * step,
                length,
            })
            .collect();

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwBackend {
    Vaapi,
    Cuda,
    VideoToolbox,
}

/// How the encoder decodes the source. `Cpu` is the default; hardware
/// backends decode on the accelerator and download frames before filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeStrategy {
    #[default]
    Cpu,
    Hardware(HwBackend),
}

impl FromStr for EncodeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "cpu" => Ok(EncodeStrategy::Cpu),
            "vaapi" => Ok(EncodeStrategy::Hardware(HwBackend::Vaapi)),
            "cuda" | "nvdec" => Ok(EncodeStrategy::Hardware(HwBackend::Cuda)),
            "videotoolbox" => Ok(EncodeStrategy::Hardware(HwBackend::VideoToolbox)),
            other => Err(format!("unknown hardware acceleration backend: {}", other)),
        }
    }
}

impl EncodeStrategy {
    pub fn input_args(&self) -> &'static [&'static str] {
        match self {
            EncodeStrategy::Cpu => &[],
            EncodeStrategy::Hardware(HwBackend::Vaapi) => {
                &["-hwaccel", "vaapi", "-hwaccel_output_format", "vaapi"]
            }
            EncodeStrategy::Hardware(HwBackend::Cuda) => {
                &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]
            }
            EncodeStrategy::Hardware(HwBackend::VideoToolbox) => &["-hwaccel", "videotoolbox"],
        }
    }

    /// Filters applied to the decoded stream before it is split into segments.
    fn source_filter(&self) -> Option<&'static str> {
        match self {
            EncodeStrategy::Cpu => None,
            EncodeStrategy::Hardware(HwBackend::Vaapi | HwBackend::Cuda) => {
                Some("hwdownload,format=nv12")
            }
            EncodeStrategy::Hardware(HwBackend::VideoToolbox) => Some("format=yuv420p"),
        }
    }

    /// One graph that trims every segment, concatenates them in order,
    /// resamples to `fps`, fits the box and builds a GIF palette. The result
    /// is exposed as `[out]`.
    pub fn filter_graph(&self, plan: &SegmentPlan, width: u32, height: u32, crop: bool, fps: u32) -> String {
        let mut graph = String::new();
        let n = plan.len();

        let mut input = "[0:v]".to_string();
        if let Some(filter) = self.source_filter() {
            let _ = write!(graph, "{}{}[src];", input, filter);
            input = "[src]".to_string();
        }

        let labels: Vec<String> = if n > 1 {
            let labels: Vec<String> = (0..n).map(|i| format!("[v{}]", i)).collect();
            let _ = write!(graph, "{}split={}{};", input, n, labels.concat());
            labels
        } else {
            vec![input]
        };

        for (i, (segment, label)) in plan.segments().iter().zip(&labels).enumerate() {
            let _ = write!(
                graph,
                "{}trim=start={:.3}:duration={:.3},setpts=PTS-STARTPTS[s{}];",
                label, segment.start, segment.length, i
            );
        }

        for i in 0..n {
            let _ = write!(graph, "[s{}]", i);
        }
        let _ = write!(
            graph,
            "concat=n={}:v=1:a=0,fps={},{},split[g0][g1];[g0]palettegen[pal];[g1][pal]paletteuse[out]",
            n,
            fps,
            box_filter(width, height, crop)
        );

        graph
    }
}

pub struct AnimatedPreviewGenerator {
    settings: PreviewSettings,
    runner: Arc<ProcessRunner>,
}

impl AnimatedPreviewGenerator {
    pub fn new(settings: PreviewSettings, runner: Arc<ProcessRunner>) -> Self {
        Self { settings, runner }
    }

    pub fn generate(
        &self,
        source: &Path,
        target: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<Artifact, PreviewError> {
        let s = &self.settings;
        let duration = self.runner.probe_duration(source, cancel)?;
        let plan = SegmentPlan::for_duration(duration, s.segment_seconds);
        let graph = s
            .strategy
            .filter_graph(&plan, s.width, s.height, s.crop, s.gif_fps);

        debug!(
            "Animated preview for {}: {:.2}s, {} segment(s)",
            source.display(),
            duration,
            plan.len()
        );

        let staged = stage_file(target, ".gif")?;

        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
        ];
        args.extend(s.strategy.input_args().iter().map(OsString::from));
        args.extend([
            OsString::from("-i"),
            source.into(),
            "-filter_complex".into(),
            graph.into(),
            "-map".into(),
            "[out]".into(),
            "-an".into(),
            "-f".into(),
            "gif".into(),
            "-loop".into(),
            "0".into(),
            staged.path().into(),
        ]);

        self.runner
            .run_producing(Tool::Encoder, &args, staged.path(), cancel)?;
        publish(staged, target)?;

        Ok(Artifact {
            duration: Some(duration),
            segments: Some(plan.len()),
            ..Artifact::generated(target, ArtifactKind::AnimatedPreview)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_count_law() {
        assert_eq!(segment_count(2.0), 1);
        assert_eq!(segment_count(3.0), 1);
        assert_eq!(segment_count(3.5), 2);
        assert_eq!(segment_count(11.5), 10);
        assert_eq!(segment_count(20.0), 10);
        assert_eq!(segment_count(3600.0), 10);
        assert_eq!(segment_count(0.4), 1);
        assert_eq!(segment_count(0.0), 1);
        assert_eq!(segment_count(f64::NAN), 1);
    }

    #[test]
    fn segments_are_evenly_spaced_and_in_range() {
        let plan = SegmentPlan::for_duration(20.0, 1.0);
        assert_eq!(plan.len(), 10);

        let starts: Vec<f64> = plan.segments().iter().map(|s| s.start).collect();
        assert_eq!(starts[0], 0.0);
        assert!((starts[9] - 19.0).abs() < 1e-9);
        for pair in starts.windows(2) {
            assert!((pair[1] - pair[0] - 19.0 / 9.0).abs() < 1e-9);
        }
        assert!(plan.segments().iter().all(|s| s.length == 1.0));
    }

    #[test]
    fn short_clip_gets_one_shortened_segment() {
        let plan = SegmentPlan::for_duration(0.5, 1.0);
        assert_eq!(plan.segments(), &[Segment { start: 0.0, length: 0.5 }]);
    }

    #[test]
    fn single_segment_graph_has_no_split() {
        let plan = SegmentPlan::for_duration(2.0, 1.0);
        let graph = EncodeStrategy::Cpu.filter_graph(&plan, 180, 101, true, 12);
        assert_eq!(
            graph,
            "[0:v]trim=start=0.000:duration=1.000,setpts=PTS-STARTPTS[s0];\
             [s0]concat=n=1:v=1:a=0,fps=12,\
             scale=180:101:force_original_aspect_ratio=increase,crop=180:101,\
             split[g0][g1];[g0]palettegen[pal];[g1][pal]paletteuse[out]"
        );
    }

    #[test]
    fn multi_segment_graph_splits_and_concats_in_order() {
        let plan = SegmentPlan::for_duration(4.0, 1.0);
        assert_eq!(plan.len(), 2);
        let graph = EncodeStrategy::Cpu.filter_graph(&plan, 180, 101, true, 12);

        assert!(graph.starts_with("[0:v]split=2[v0][v1];"));
        assert!(graph.contains("[v0]trim=start=0.000:duration=1.000"));
        assert!(graph.contains("[v1]trim=start=3.000:duration=1.000"));
        assert!(graph.contains("[s0][s1]concat=n=2:v=1:a=0"));
    }

    #[test]
    fn hardware_strategies_use_distinct_graphs() {
        let plan = SegmentPlan::for_duration(20.0, 1.0);
        let cpu = EncodeStrategy::Cpu.filter_graph(&plan, 180, 101, true, 12);
        let vaapi = EncodeStrategy::Hardware(HwBackend::Vaapi).filter_graph(&plan, 180, 101, true, 12);
        let vt = EncodeStrategy::Hardware(HwBackend::VideoToolbox).filter_graph(&plan, 180, 101, true, 12);

        assert!(vaapi.starts_with("[0:v]hwdownload,format=nv12[src];[src]split=10"));
        assert!(vt.starts_with("[0:v]format=yuv420p[src];"));
        assert_ne!(cpu, vaapi);
        assert!(EncodeStrategy::Cpu.input_args().is_empty());
        assert_eq!(
            EncodeStrategy::Hardware(HwBackend::Cuda).input_args(),
            &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]
        );
    }

    #[test]
    fn strategy_parses_from_config_text() {
        assert_eq!("".parse::<EncodeStrategy>().unwrap(), EncodeStrategy::Cpu);
        assert_eq!(
            "VAAPI".parse::<EncodeStrategy>().unwrap(),
            EncodeStrategy::Hardware(HwBackend::Vaapi)
        );
        assert!("quantum".parse::<EncodeStrategy>().is_err());
    }
}
