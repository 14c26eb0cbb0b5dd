use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::preview::{EncodeStrategy, PreviewSettings};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub media_dirs: Vec<String>,
    pub database_path: String,
    pub cache_folder: String,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub crop_thumbnails: bool,
    pub jpeg_quality: u8,
    pub gif_fps: u32,
    pub segment_seconds: f64,
    pub frame_extract_fps: u32,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Deadline for a single tool invocation; 0 disables it.
    pub tool_timeout_secs: u64,
    pub watch_debounce_ms: u64,
    /// Worker threads for preview generation; 0 uses every core.
    pub workers: usize,
    /// `none`, `vaapi`, `cuda` or `videotoolbox`.
    pub hardware_accel: String,
}

impl Default for Config {
    fn default() -> Self {
        let base = app_dir().unwrap_or_else(|_| PathBuf::from(".media-manager"));

        Self {
            media_dirs: Vec::new(),
            database_path: base.join("media.db").to_string_lossy().to_string(),
            cache_folder: base.join("thumbnails").to_string_lossy().to_string(),
            thumbnail_width: 180,
            thumbnail_height: 101,
            crop_thumbnails: true,
            jpeg_quality: 85,
            gif_fps: 12,
            segment_seconds: 1.0,
            frame_extract_fps: 4,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            tool_timeout_secs: 120,
            watch_debounce_ms: 2000,
            workers: 0,
            hardware_accel: "none".to_string(),
        }
    }
}

impl Config {
    /// Loads the config from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path()?)
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Applies `MEDIA_MANAGER_DB` (or `DB_PATH`) and `THUMBNAIL_DIR`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(db) = non_empty("MEDIA_MANAGER_DB").or_else(|| non_empty("DB_PATH")) {
            self.database_path = db;
        }
        if let Some(dir) = non_empty("THUMBNAIL_DIR") {
            self.cache_folder = dir;
        }
    }

    pub fn encode_strategy(&self) -> Result<EncodeStrategy> {
        self.hardware_accel
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    pub fn preview_settings(&self) -> Result<PreviewSettings> {
        Ok(PreviewSettings {
            width: self.thumbnail_width,
            height: self.thumbnail_height,
            crop: self.crop_thumbnails,
            jpeg_quality: self.jpeg_quality,
            gif_fps: self.gif_fps,
            segment_seconds: self.segment_seconds,
            frame_extract_fps: self.frame_extract_fps,
            strategy: self.encode_strategy()?,
            ..PreviewSettings::default()
        })
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.thumbnail_width == 0 || self.thumbnail_height == 0 {
            anyhow::bail!(
                "Thumbnail size must be non-zero, got {}x{}",
                self.thumbnail_width,
                self.thumbnail_height
            );
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            anyhow::bail!("jpeg_quality must be between 1 and 100, got {}", self.jpeg_quality);
        }
        if self.gif_fps == 0 || self.frame_extract_fps == 0 {
            anyhow::bail!("Frame rates must be non-zero");
        }
        if self.segment_seconds.is_nan() || self.segment_seconds <= 0.0 {
            anyhow::bail!("segment_seconds must be positive, got {}", self.segment_seconds);
        }
        self.encode_strategy()?;
        Ok(())
    }
}

fn app_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?;
    Ok(home.join(".media-manager"))
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(app_dir()?.join("config.toml"))
}
