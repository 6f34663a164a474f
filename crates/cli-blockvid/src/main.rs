use anyhow::{Context, Result};
use blockvid::{
    BlockMosaic, FfmpegTool, LogProgress, Pipeline, PipelineConfig, RunOptions, RunRequest, RunSummary,
};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};

/// Turn a video into a block mosaic, frame by frame
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source video
    input: PathBuf,

    /// Destination video
    output: PathBuf,

    /// Transform kind
    #[arg(short, long, default_value = "Blocks Video")]
    kind: String,

    /// Block edge length in pixels
    #[arg(short, long, default_value_t = 16)]
    scale: u32,

    /// Parallel frame workers (defaults to available parallelism)
    #[arg(short, long)]
    processes: Option<usize>,

    /// Frames per second for extraction and re-encoding
    #[arg(short, long, default_value_t = 30.0)]
    frame_rate: f64,

    /// Keep lossless PNG frames instead of JPEG
    #[arg(short, long)]
    quality: bool,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the run summary as JSON
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over the default level
    let mut logger = env_logger::Builder::new();
    logger.filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    logger.parse_default_env().format_timestamp_secs().init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("Blockvid starting");
    info!("Configuration loaded:");
    info!("  Cache root: {}", cfg.cache_root.display());
    info!("  FFmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  Extraction threshold: {}", cfg.extraction_threshold);
    info!("  CRF: {} ({})", cfg.crf, cfg.pixel_format);

    let process_count = args.processes.unwrap_or_else(default_process_count);
    let request = RunRequest {
        input: args.input,
        output: args.output,
        transform_kind: args.kind,
        scale_factor: args.scale,
        options: RunOptions {
            process_count,
            frame_rate: args.frame_rate,
            quality: args.quality,
        },
    };

    let media = FfmpegTool::new(&cfg)
        .await
        .context("FFmpeg is not available")?;
    let pipeline = Pipeline::new(cfg, media, BlockMosaic);

    let summary = match pipeline.run(&request, &LogProgress).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Conversion of {} failed: {}", request.input.display(), e);
            return Err(e.into());
        }
    };

    print_summary(&summary);
    if let Some(path) = &args.summary {
        write_summary(path, &summary)?;
        info!("📝 Summary written to {}", path.display());
    }

    Ok(())
}

fn default_process_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn print_summary(summary: &RunSummary) {
    let elapsed = summary.finished_at - summary.started_at;
    println!(
        "{} frames -> {} ({} audio, {} swept late, {:.1}s)",
        summary.frame_count,
        summary.output.display(),
        if summary.had_audio { "with" } else { "no" },
        summary.state.frames_swept,
        elapsed.num_milliseconds() as f64 / 1000.0
    );
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary: {}", path.display()))?;
    Ok(())
}
