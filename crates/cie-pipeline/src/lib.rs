//! cie-pipeline: Pure face image analysis pipeline (sans-IO).
//!
//! Takes a face photo and prepares it for downstream color and skin
//! classification through four stages:
//! quality gate -> face localization -> white balance -> lighting score.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! buffers and returns structured data. The landmark model is an
//! external collaborator behind [`LandmarkDetector`]; a synthetic
//! detector stands in when none is available.

pub mod color;
pub mod decode;
pub mod diagnostics;
pub mod face;
pub mod geometry;
pub mod landmarks;
pub mod lighting;
pub mod pipeline;
pub mod quality;
pub mod skin;
pub mod types;
pub mod white_balance;

use std::time::Duration;

pub use decode::decode_rgb;
pub use diagnostics::PipelineMetadata;
pub use face::{DetectedFace, FaceDetection, PixelRect};
pub use landmarks::{DetectorError, LandmarkDetector, MockLandmarkDetector, RawLandmarks};
pub use lighting::LightingReport;
pub use pipeline::{CiePipeline, PipelineResult, ProgressObserver};
pub use quality::QualityReport;
pub use types::{
    Dimensions, PipelineError, PipelineOptions, PipelineStage, RejectionReason, RgbImageData,
};
pub use white_balance::{WhiteBalanceMethod, WhiteBalanceResult};

/// Run the full pipeline with the synthetic landmark detector.
///
/// # Pipeline steps
///
/// 1. Quality gate: sharpness, brightness, color temperature
/// 2. Face localization and pose validation
/// 3. White balance correction
/// 4. Lighting quality score
///
/// Never fails: problems are reported through
/// [`PipelineResult::rejection`].
#[must_use]
pub fn run_cie_pipeline(image: &RgbImageData, options: &PipelineOptions) -> PipelineResult {
    CiePipeline::new(options.clone()).run(image)
}

/// [`run_cie_pipeline`] with a time budget.
///
/// Must be called from within a tokio runtime.
pub async fn run_cie_pipeline_with_timeout(
    image: RgbImageData,
    options: PipelineOptions,
    budget: Duration,
) -> PipelineResult {
    CiePipeline::new(options).run_with_timeout(image, budget).await
}
