//! cie-bench: CLI tool for running the CIE pipeline on image files.
//!
//! Decodes an image, runs the four analysis stages with configurable
//! options, and prints a per-stage diagnostics report. Useful for:
//!
//! - Tuning the quality threshold against real photos
//! - Comparing white balance methods (`gray_world` vs `skin_aware`)
//! - Exercising pose validation with a rotated synthetic face
//! - Measuring per-stage durations and timeout behavior
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin cie-bench -- [OPTIONS] <IMAGE_PATH>
//! ```
//!
//! Set `RUST_LOG=cie_pipeline=debug` to see per-stage log lines.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use cie_pipeline::{
    CiePipeline, MockLandmarkDetector, PipelineOptions, PipelineResult, PipelineStage,
    WhiteBalanceMethod,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Face image analysis diagnostics.
///
/// Runs the quality gate, face localization, white balance and lighting
/// stages on a given image and prints per-stage timing and scores.
#[derive(Parser)]
#[command(name = "cie-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Skip stage 1 (quality gate).
    #[arg(long)]
    skip_quality: bool,

    /// Skip stage 3 (white balance correction).
    #[arg(long)]
    skip_awb: bool,

    /// Skip stage 4 (lighting score).
    #[arg(long)]
    skip_lighting: bool,

    /// Keep going when the quality gate rejects the image.
    #[arg(long)]
    continue_on_quality_fail: bool,

    /// White balance method (none, gray_world, von_kries, skin_aware).
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_AWB_METHOD)]
    awb_method: WhiteBalanceMethod,

    /// Minimum quality score (0-100).
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_QUALITY_THRESHOLD)]
    quality_threshold: f64,

    /// Face ROI padding as a fraction of the face box.
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_ROI_PADDING)]
    roi_padding: f64,

    /// Time budget per run in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Pitch of the synthetic face in degrees.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    mock_pitch: f64,

    /// Yaw of the synthetic face in degrees.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    mock_yaw: f64,

    /// Roll of the synthetic face in degrees.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    mock_roll: f64,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output results as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline options as a JSON string.
    ///
    /// When provided, all other option flags are ignored. Missing fields
    /// take their defaults.
    #[arg(long)]
    options_json: Option<String>,
}

/// Build [`PipelineOptions`] from CLI arguments.
///
/// If `--options-json` is provided, the JSON is parsed directly and all
/// individual option flags are ignored.
fn options_from_cli(cli: &Cli) -> Result<PipelineOptions, String> {
    if let Some(ref json) = cli.options_json {
        return serde_json::from_str(json)
            .map_err(|e| format!("Error parsing --options-json: {e}"));
    }

    Ok(PipelineOptions {
        skip_quality_check: cli.skip_quality,
        skip_awb_correction: cli.skip_awb,
        skip_lighting_analysis: cli.skip_lighting,
        continue_on_quality_fail: cli.continue_on_quality_fail,
        quality_threshold: cli.quality_threshold,
        awb_method: cli.awb_method,
        roi_padding: cli.roi_padding,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let options = match options_from_cli(&cli) {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let image_bytes = match std::fs::read(&cli.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };
    let image = match cie_pipeline::decode_rgb(&image_bytes) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Error decoding {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "Image: {} ({} bytes, {}x{})",
        cli.image_path.display(),
        image_bytes.len(),
        image.width(),
        image.height(),
    );
    eprintln!("Options: {options:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let detector = MockLandmarkDetector::with_pose(
        cli.mock_pitch.to_radians(),
        cli.mock_yaw.to_radians(),
        cli.mock_roll.to_radians(),
    );
    let pipeline = CiePipeline::new(options)
        .with_detector(Arc::new(detector))
        .with_progress(|stage: PipelineStage, percent: u8| {
            tracing::debug!(%stage, percent, "progress");
        });

    let mut results = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let result = match cli.timeout_ms {
            Some(ms) => {
                pipeline
                    .run_with_timeout(image.clone(), Duration::from_millis(ms))
                    .await
            }
            None => pipeline.run(&image),
        };

        if cli.json {
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing result: {e}");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            println!("{}", result.report());
        }

        results.push(result);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&results);
    }

    if results.iter().all(PipelineResult::success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(results: &[PipelineResult]) {
    println!();
    println!("Summary ({} runs)\n{}", results.len(), "=".repeat(60));

    if results.is_empty() {
        println!("Warning: no results to summarize");
        return;
    }

    let durations: Vec<f64> = results
        .iter()
        .map(|r| r.total_processing_time.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    let succeeded = results.iter().filter(|r| r.success()).count();
    println!("Completed: {succeeded}/{}", results.len());

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    for stage in PipelineStage::PROCESSING {
        let stage_durations: Vec<f64> = results
            .iter()
            .filter_map(|r| r.metadata.stage_times.get(&stage))
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{:<24} {stage_mean:>10.3}ms", stage.label());
    }
}
