use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Configuration shared by every component of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent directory of the four staging areas
    pub cache_root: PathBuf,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Interval between frame-directory polls while extraction is running
    pub poll_interval_ms: u64,
    /// Fraction of the estimated frame count that ends the dispatch phase (e.g., 0.95)
    pub extraction_threshold: f64,
    /// Bounded wait on the progress channel per drain poll
    pub drain_timeout_ms: u64,
    /// Recount processed files every N poll intervals while awaiting workers
    pub recount_every: u32,
    /// Approximate number of progress events a single frame emits
    pub progress_updates_per_frame: u32,
    /// Constant quality factor for the final encode
    pub crf: u8,
    /// Pixel format for the final encode
    pub pixel_format: String,
    /// Clear the staging areas when a run fails
    pub clean_on_failure: bool,
    /// Fail if no new frame shows up for this many seconds (0 disables)
    pub extraction_stall_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            cache_root: PathBuf::from("./assets/cache"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            poll_interval_ms: 100,
            extraction_threshold: 0.95,
            drain_timeout_ms: 500,
            recount_every: 10,
            progress_updates_per_frame: 30,
            crf: 20,
            pixel_format: "yuv420p".to_string(),
            clean_on_failure: true,
            extraction_stall_secs: 120,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms.max(1))
    }

    /// Stall watchdog window, `None` when disabled
    pub fn extraction_stall(&self) -> Option<Duration> {
        (self.extraction_stall_secs > 0).then(|| Duration::from_secs(self.extraction_stall_secs))
    }
}

/// Per-run options chosen by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Worker pool size
    pub process_count: usize,
    /// Frames per second used for extraction and re-encoding
    pub frame_rate: f64,
    /// Lossless PNG frame cache when true, JPEG otherwise
    pub quality: bool,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.process_count == 0 {
            return Err(PipelineError::InvalidOptions(
                "process_count must be at least 1".to_string(),
            ));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(PipelineError::InvalidOptions(format!(
                "frame_rate must be a positive number, got {}",
                self.frame_rate
            )));
        }
        Ok(())
    }
}

/// Everything needed to start one conversion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Transform identifier, e.g. "Blocks Video"
    pub transform_kind: String,
    /// Block edge length in pixels
    pub scale_factor: u32,
    pub options: RunOptions,
}

impl RunRequest {
    /// The per-frame transform works on stills, so video modes map to their image counterpart
    pub fn image_transform_kind(&self) -> String {
        self.transform_kind.replace("Video", "Image")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options(process_count: usize, frame_rate: f64) -> RunOptions {
        RunOptions { process_count, frame_rate, quality: false }
    }

    #[test]
    fn test_missing_config_file_returns_defaults() {
        let config = PipelineConfig::load_config(Some(Path::new("/nonexistent/blockvid.toml"))).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.extraction_threshold, 0.95);
        assert!(config.clean_on_failure);
    }

    #[test]
    fn test_toml_config_overrides_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockvid.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "cache_root = \"/tmp/bv-cache\"\ncrf = 28\nextraction_threshold = 0.9").unwrap();

        let config = PipelineConfig::load_config(Some(&path)).unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/tmp/bv-cache"));
        assert_eq!(config.crf, 28);
        assert_eq!(config.extraction_threshold, 0.9);
        // untouched fields keep their defaults
        assert_eq!(config.pixel_format, "yuv420p");
    }

    #[test]
    fn test_json_config_and_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("blockvid.json");
        std::fs::write(&good, r#"{"drain_timeout_ms": 50, "clean_on_failure": false}"#).unwrap();
        let config = PipelineConfig::load_config(Some(&good)).unwrap();
        assert_eq!(config.drain_timeout_ms, 50);
        assert!(!config.clean_on_failure);

        let bad = dir.path().join("broken.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = PipelineConfig::load_config(Some(&bad)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON config"));
    }

    #[test]
    fn test_stall_watchdog_can_be_disabled() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.extraction_stall(), Some(Duration::from_secs(120)));
        config.extraction_stall_secs = 0;
        assert_eq!(config.extraction_stall(), None);
    }

    #[test]
    fn test_options_validation() {
        assert!(options(4, 30.0).validate().is_ok());
        assert!(matches!(options(0, 30.0).validate(), Err(PipelineError::InvalidOptions(_))));
        assert!(matches!(options(2, 0.0).validate(), Err(PipelineError::InvalidOptions(_))));
        assert!(matches!(options(2, f64::NAN).validate(), Err(PipelineError::InvalidOptions(_))));
    }

    #[test]
    fn test_video_kind_maps_to_image_kind() {
        let request = RunRequest {
            input: PathBuf::from("in.mp4"),
            output: PathBuf::from("out.mp4"),
            transform_kind: "Blocks Video".to_string(),
            scale_factor: 8,
            options: options(1, 24.0),
        };
        assert_eq!(request.image_transform_kind(), "Blocks Image");
    }
}
