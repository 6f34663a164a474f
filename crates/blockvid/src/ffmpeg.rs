use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::cache::{raw_frame_pattern, FrameFormat, AUDIO_FILE_NAME, FIRST_FRAME_INDEX};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ffprobe;
use crate::media::{frames_for_duration, MediaTool};
use crate::reencode::ReencodeCommand;

/// Runs the system ffmpeg/ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
}

impl FfmpegTool {
    /// Create the tool and check that ffmpeg answers
    pub async fn new(config: &PipelineConfig) -> Result<Self> {
        let tool = Self::from_config(config);
        let version = Self::detect_version(&tool.ffmpeg_bin).await?;
        info!("🎬 Using {}", version);
        Ok(tool)
    }

    /// Create the tool without probing the binaries
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
        }
    }

    async fn detect_version(ffmpeg_bin: &Path) -> Result<String> {
        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))
    }

    /// Run ffmpeg with the global flags every invocation shares.
    ///
    /// Non-zero exit is an error carrying the exit code and stderr; on success
    /// any diagnostic output is logged at debug level.
    pub async fn execute_ffmpeg(&self, args: Vec<String>) -> Result<()> {
        let mut full_args = global_args();
        full_args.extend(args);

        let cmd_str = format!("{} {}", self.ffmpeg_bin.display(), full_args.join(" "));
        debug!("Executing FFmpeg: {}", cmd_str);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&full_args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()
            .with_context(|| format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            ))?;

        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stdout"))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stderr"))?;

        // Drain both pipes so a chatty process never blocks on a full buffer
        let stdout_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut line_stream = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = line_stream.next_line().await {
                lines.push(line);
            }
            lines.join("\n")
        });

        let stderr_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut line_stream = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = line_stream.next_line().await {
                lines.push(line);
            }
            lines.join("\n")
        });

        let status = child.wait().await.context("Failed to wait for FFmpeg process")?;

        let stdout = stdout_handle.await.context("Failed to read FFmpeg stdout")?;
        let stderr = stderr_handle.await.context("Failed to read FFmpeg stderr")?;

        if !status.success() {
            return Err(anyhow!(
                "FFmpeg failed (exit code: {})\nCommand: {}\nSTDERR:\n{}",
                status.code().unwrap_or(-1),
                cmd_str,
                stderr
            ));
        }

        for line in stdout.lines().chain(stderr.lines()).filter(|l| !l.trim().is_empty()) {
            debug!("ffmpeg: {}", line);
        }
        Ok(())
    }
}

impl MediaTool for FfmpegTool {
    async fn estimate_frame_count(&self, input: &Path, frame_rate: f64) -> PipelineResult<u64> {
        let probe = ffprobe::probe_file(&self.ffprobe_bin, input)
            .await
            .map_err(|e| PipelineError::Estimation(format!("{:#}", e)))?;

        let duration = probe.duration_secs().ok_or_else(|| {
            PipelineError::Estimation(format!("no readable duration in {}", input.display()))
        })?;

        let frames = frames_for_duration(duration, frame_rate);
        if frames == 0 {
            return Err(PipelineError::Estimation(format!(
                "{} yields no frames at {} fps",
                input.display(),
                frame_rate
            )));
        }

        debug!("Estimated {} frames ({:.3}s at {} fps)", frames, duration, frame_rate);
        Ok(frames)
    }

    async fn extract_frames(
        &self,
        input: &Path,
        frame_rate: f64,
        format: FrameFormat,
        destination: &Path,
    ) -> PipelineResult<()> {
        let args = build_frame_extraction_args(input, frame_rate, format, destination);
        self.execute_ffmpeg(args)
            .await
            .map_err(|e| PipelineError::Extraction(format!("{:#}", e)))?;
        Ok(())
    }

    async fn extract_audio(&self, input: &Path, destination: &Path) -> PipelineResult<()> {
        let probe = ffprobe::probe_file(&self.ffprobe_bin, input).await?;
        if !probe.has_audio() {
            info!("🔇 No audio stream in {}, skipping audio extraction", input.display());
            return Ok(());
        }

        let args = build_audio_extraction_args(input, destination);
        self.execute_ffmpeg(args).await?;
        Ok(())
    }

    async fn reencode(&self, command: &ReencodeCommand) -> PipelineResult<()> {
        self.execute_ffmpeg(command.args())
            .await
            .map_err(|e| PipelineError::Reencode(format!("{:#}", e)))?;
        Ok(())
    }
}

fn global_args() -> Vec<String> {
    ["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Decode `input` into numbered stills at `frame_rate`.
///
/// Frames are written atomically so a listing never sees a half-written file
/// under its final name.
pub fn build_frame_extraction_args(
    input: &Path,
    frame_rate: f64,
    format: FrameFormat,
    destination: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        input.display().to_string(),
        "-vf".to_string(),
        format!("fps={}", frame_rate),
    ];

    if format == FrameFormat::Jpeg {
        args.push("-q:v".to_string());
        args.push("2".to_string());
    }

    args.push("-start_number".to_string());
    args.push(FIRST_FRAME_INDEX.to_string());
    args.push("-atomic_writing".to_string());
    args.push("1".to_string());
    args.push(destination.join(raw_frame_pattern(format)).display().to_string());
    args
}

pub fn build_audio_extraction_args(input: &Path, destination: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        input.display().to_string(),
        "-vn".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        destination.join(AUDIO_FILE_NAME).display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_extraction_targets_selected_format() {
        let args = build_frame_extraction_args(
            Path::new("/videos/in.mp4"),
            24.0,
            FrameFormat::Png,
            Path::new("/cache/img_cache_png"),
        );
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "fps=24"));
        assert!(args.windows(2).any(|w| w[0] == "-start_number" && w[1] == "1"));
        assert!(!args.iter().any(|a| a == "-q:v"));
        assert_eq!(args.last().map(String::as_str), Some("/cache/img_cache_png/file%06d.png"));
    }

    #[test]
    fn test_jpeg_extraction_sets_quality() {
        let args = build_frame_extraction_args(
            Path::new("in.mkv"),
            29.97,
            FrameFormat::Jpeg,
            Path::new("/cache/img_cache_jpg"),
        );
        assert!(args.windows(2).any(|w| w[0] == "-q:v" && w[1] == "2"));
        assert!(args.last().is_some_and(|a| a.ends_with("file%06d.jpg")));
    }

    #[test]
    fn test_audio_extraction_drops_video() {
        let args = build_audio_extraction_args(Path::new("in.mp4"), Path::new("/cache/audio_cache"));
        assert!(args.contains(&"-vn".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/cache/audio_cache/audio.m4a"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let tool = FfmpegTool {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe"),
        };
        let err = tool.execute_ffmpeg(vec!["-version".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn FFmpeg process"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_decides_outcome() {
        let ok = FfmpegTool { ffmpeg_bin: PathBuf::from("true"), ffprobe_bin: PathBuf::from("true") };
        ok.execute_ffmpeg(vec!["-version".to_string()]).await.unwrap();

        let failing = FfmpegTool { ffmpeg_bin: PathBuf::from("false"), ffprobe_bin: PathBuf::from("false") };
        let err = failing.execute_ffmpeg(Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("exit code: 1"), "{}", err);
    }

    #[tokio::test]
    async fn test_estimation_error_for_missing_input() {
        let tool = FfmpegTool::from_config(&PipelineConfig::default());
        let err = tool
            .estimate_frame_count(Path::new("/nonexistent/input.mp4"), 30.0)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Estimation(_)));
    }
}
