use std::path::{Path, PathBuf};

use crate::cache::{processed_frame_pattern, CacheArea, CacheStore, FIRST_FRAME_INDEX};
use crate::config::PipelineConfig;

/// Final encode: processed frame sequence plus optional audio into one video
#[derive(Debug, Clone, PartialEq)]
pub struct ReencodeCommand {
    pub frames_dir: PathBuf,
    pub audio: Option<PathBuf>,
    pub frame_rate: f64,
    pub crf: u8,
    pub pixel_format: String,
    pub output: PathBuf,
}

impl ReencodeCommand {
    pub fn new(
        cache: &CacheStore,
        audio: Option<PathBuf>,
        frame_rate: f64,
        cfg: &PipelineConfig,
        output: &Path,
    ) -> Self {
        Self {
            frames_dir: cache.dir(CacheArea::Processed),
            audio,
            frame_rate,
            crf: cfg.crf,
            pixel_format: cfg.pixel_format.clone(),
            output: output.to_path_buf(),
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Encoder arguments, without the global flags the runner adds
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(audio) = &self.audio {
            args.push("-i".to_string());
            args.push(audio.display().to_string());
        }

        // Frame-rate tagged image sequence input
        args.push("-r".to_string());
        args.push(self.frame_rate.to_string());
        args.push("-start_number".to_string());
        args.push(FIRST_FRAME_INDEX.to_string());
        args.push("-i".to_string());
        args.push(self.frames_dir.join(processed_frame_pattern()).display().to_string());

        args.push("-crf".to_string());
        args.push(self.crf.to_string());
        args.push("-pix_fmt".to_string());
        args.push(self.pixel_format.clone());

        args.push(self.output.display().to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn command(audio: Option<PathBuf>, frame_rate: f64, crf: u8) -> ReencodeCommand {
        let cfg = PipelineConfig { crf, ..PipelineConfig::default() };
        let cache = CacheStore::new("/cache");
        ReencodeCommand::new(&cache, audio, frame_rate, &cfg, Path::new("/out/result.mp4"))
    }

    #[test]
    fn test_command_without_audio() {
        let args = command(None, 30.0, 20).args();
        assert_eq!(
            args,
            vec![
                "-r", "30", "-start_number", "1",
                "-i", "/cache/img_process_cache/%06d.png",
                "-crf", "20", "-pix_fmt", "yuv420p", "/out/result.mp4",
            ]
        );
    }

    #[test]
    fn test_command_with_audio_puts_audio_input_first() {
        let args = command(Some(PathBuf::from("/cache/audio_cache/audio.m4a")), 29.97, 20).args();
        assert_eq!(&args[..2], &["-i", "/cache/audio_cache/audio.m4a"]);
        assert_eq!(&args[2..4], &["-r", "29.97"]);
        assert_eq!(args.last().map(String::as_str), Some("/out/result.mp4"));
    }

    proptest! {
        #[test]
        fn test_audio_segment_present_iff_audio(
            has_audio in prop::bool::ANY,
            frame_rate in 1.0f64..120.0,
            crf in 0u8..51,
        ) {
            let audio = has_audio.then(|| PathBuf::from("/cache/audio_cache/audio.m4a"));
            let cmd = command(audio, frame_rate, crf);
            let args = cmd.args();

            let inputs = args.iter().filter(|a| *a == "-i").count();
            let mentions_audio = args.iter().any(|a| a.ends_with("audio.m4a"));

            prop_assert_eq!(cmd.has_audio(), has_audio);
            prop_assert_eq!(inputs, if has_audio { 2 } else { 1 });
            prop_assert_eq!(mentions_audio, has_audio);
            prop_assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == crf.to_string()));
        }
    }
}
