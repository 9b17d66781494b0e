//! Pipeline orchestration: run the four stages in order, honoring skip
//! flags, and assemble a [`PipelineResult`].
//!
//! ```text
//! cie1 (quality) -> cie2 (face) -> cie3 (white balance) -> cie4 (lighting) -> complete
//!                                                                     any -> failed
//! ```
//!
//! Stage 2 always runs; the others can be skipped through
//! [`PipelineOptions`]. A run never returns an error: failures end in
//! [`PipelineStage::Failed`] with a [`RejectionReason`].
//!
//! [`CiePipeline::run`] is synchronous. [`CiePipeline::run_with_timeout`]
//! moves the same work onto tokio's blocking pool and races it against a
//! time budget. Both share a [`RunLedger`] that records stage progress as
//! it happens, so a timed-out run still reports what it finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::diagnostics::PipelineMetadata;
use crate::face::{FaceDetection, FaceLocalization, generate_mock_face, localize_face};
use crate::landmarks::{LandmarkDetector, MockLandmarkDetector};
use crate::lighting::{LightingReport, analyze_lighting, generate_mock_lighting};
use crate::quality::{QualityReport, assess_quality, generate_mock_quality};
use crate::types::{Dimensions, PipelineOptions, PipelineStage, RejectionReason, RgbImageData};
use crate::white_balance::{WhiteBalanceResult, correct_white_balance, generate_corrected_fallback};

/// Upper bound on every confidence reported by synthesized results.
pub const FALLBACK_MAX_CONFIDENCE: f64 = 0.5;

const CIE1_WEIGHT: f64 = 0.3;
const CIE2_WEIGHT: f64 = 0.3;
const CIE3_WEIGHT: f64 = 0.2;
const CIE4_WEIGHT: f64 = 0.2;

/// Receives progress notifications while a run advances.
///
/// Called once after each executed stage with that stage's percentage,
/// including a stage whose result fails the run, and once with 100 when
/// the run completes. Cancelled runs stop notifying.
/// Implemented for any `Fn(PipelineStage, u8) + Send + Sync` closure.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, stage: PipelineStage, percent: u8);
}

impl<F> ProgressObserver for F
where
    F: Fn(PipelineStage, u8) + Send + Sync,
{
    fn on_progress(&self, stage: PipelineStage, percent: u8) {
        self(stage, percent);
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Stage 1 report, when the stage ran.
    pub cie1: Option<QualityReport>,
    /// Stage 2 face, when one was localized (including a face rejected
    /// for its angle).
    pub cie2: Option<FaceDetection>,
    /// Stage 3 correction, when the stage ran.
    pub cie3: Option<WhiteBalanceResult>,
    /// Stage 4 report, when the stage ran.
    pub cie4: Option<LightingReport>,
    /// Last stage reached: [`PipelineStage::Complete`] or
    /// [`PipelineStage::Failed`].
    pub stage: PipelineStage,
    /// Why the run failed, or a quality rejection that was tolerated
    /// through `continue_on_quality_fail`.
    pub rejection: Option<RejectionReason>,
    /// Whether downstream classifiers should trust the corrected image.
    pub is_suitable_for_analysis: bool,
    pub dimensions: Dimensions,
    /// Wall-clock duration of the whole run (seconds).
    #[serde(with = "crate::diagnostics::duration_serde")]
    pub total_processing_time: Duration,
    pub metadata: PipelineMetadata,
}

impl PipelineResult {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.stage, PipelineStage::Complete)
    }

    /// The white-balanced image, when stage 3 ran in this process.
    #[must_use]
    pub fn corrected_image(&self) -> Option<&RgbImageData> {
        self.cie3
            .as_ref()
            .map(|w| &w.corrected_image)
            .filter(|image| !image.is_empty())
    }

    /// User-facing guidance collected from the rejection and every stage.
    #[must_use]
    pub fn feedback(&self) -> Vec<String> {
        let mut feedback = Vec::new();
        if let Some(reason) = &self.rejection {
            feedback.push(reason.to_string());
        }
        if let Some(q) = &self.cie1 {
            feedback.extend(q.feedback.iter().cloned());
        }
        if let Some(l) = &self.cie4 {
            feedback.extend(l.feedback.iter().cloned());
        }
        feedback
    }
}

/// Progress shared between a running pipeline and whoever awaits it.
#[derive(Debug, Default)]
pub struct RunLedger {
    metadata: Mutex<PipelineMetadata>,
    cancelled: AtomicBool,
}

impl RunLedger {
    fn record_stage(&self, stage: PipelineStage, duration: Duration) {
        self.lock().record_stage(stage, duration);
    }

    fn record_skip(&self, stage: PipelineStage) {
        self.lock().record_skip(stage);
    }

    /// Ask the run to stop at the next stage boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Copy of the metadata recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> PipelineMetadata {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineMetadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stage outputs accumulated during a run.
#[derive(Default)]
struct StageOutputs {
    cie1: Option<QualityReport>,
    cie2: Option<FaceDetection>,
    cie3: Option<WhiteBalanceResult>,
    cie4: Option<LightingReport>,
    /// A tolerated stage 1 rejection.
    quality_warning: Option<RejectionReason>,
}

/// Configured pipeline runner.
///
/// Cheap to clone; the detector and progress observer are shared.
#[derive(Clone)]
pub struct CiePipeline {
    options: PipelineOptions,
    detector: Arc<dyn LandmarkDetector>,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl CiePipeline {
    /// A runner using the synthetic landmark detector.
    #[must_use]
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            detector: Arc::new(MockLandmarkDetector::default()),
            progress: None,
        }
    }

    /// Use `detector` for stage 2. When it reports itself unavailable at
    /// run time the synthetic detector is used instead.
    #[must_use]
    pub fn with_detector(mut self, detector: Arc<dyn LandmarkDetector>) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.progress = Some(Arc::new(observer));
        self
    }

    #[must_use]
    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run all enabled stages on `image`.
    #[must_use]
    pub fn run(&self, image: &RgbImageData) -> PipelineResult {
        self.run_with_ledger(image, &RunLedger::default())
    }

    /// Run on the blocking pool, giving up after `budget`.
    ///
    /// On expiry the run is cancelled at its next stage boundary and a
    /// [`RejectionReason::Timeout`] result is returned with the stages
    /// finished so far.
    pub async fn run_with_timeout(&self, image: RgbImageData, budget: Duration) -> PipelineResult {
        let start = Instant::now();
        let dimensions = image.dimensions();
        let ledger = Arc::new(RunLedger::default());

        let pipeline = self.clone();
        let task_ledger = Arc::clone(&ledger);
        let task =
            tokio::task::spawn_blocking(move || pipeline.run_with_ledger(&image, &task_ledger));

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                warn!(error = %join_error, "pipeline task failed");
                failed_result(
                    dimensions,
                    RejectionReason::InternalError(join_error.to_string()),
                    ledger.snapshot(),
                    start.elapsed(),
                )
            }
            Err(_) => {
                ledger.cancel();
                let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
                warn!(budget_ms, "pipeline timed out");
                failed_result(
                    dimensions,
                    RejectionReason::Timeout { budget_ms },
                    ledger.snapshot(),
                    start.elapsed(),
                )
            }
        }
    }

    /// Run all enabled stages, recording progress in `ledger`.
    #[tracing::instrument(
        name = "cie_pipeline",
        skip_all,
        fields(width = image.width(), height = image.height())
    )]
    pub fn run_with_ledger(&self, image: &RgbImageData, ledger: &RunLedger) -> PipelineResult {
        let start = Instant::now();
        let mut outputs = StageOutputs::default();
        let outcome = self.execute(image, ledger, &mut outputs);

        let metadata = ledger.snapshot();
        let result = assemble(image.dimensions(), outputs, outcome, metadata, start.elapsed());
        if result.success() {
            self.notify(ledger, PipelineStage::Complete);
            info!(
                quality = result.metadata.overall_quality_score,
                confidence = result.metadata.overall_confidence,
                suitable = result.is_suitable_for_analysis,
                elapsed_ms = crate::diagnostics::duration_ms(result.total_processing_time),
                "pipeline complete",
            );
        } else if let Some(reason) = &result.rejection {
            warn!(stage = %last_executed(&result.metadata), %reason, "pipeline failed");
        }
        result
    }

    /// Drive the stages. `Err` carries the reason the run failed.
    fn execute(
        &self,
        image: &RgbImageData,
        ledger: &RunLedger,
        outputs: &mut StageOutputs,
    ) -> Result<(), RejectionReason> {
        let options = &self.options;
        if image.is_empty() {
            return Err(RejectionReason::InvalidInput(format!(
                "image has zero area ({}x{})",
                image.width(),
                image.height()
            )));
        }

        if options.skip_quality_check {
            ledger.record_skip(PipelineStage::Cie1);
        }
        if options.skip_awb_correction {
            ledger.record_skip(PipelineStage::Cie3);
        }
        if options.skip_lighting_analysis {
            ledger.record_skip(PipelineStage::Cie4);
        }

        if !options.skip_quality_check {
            check_cancelled(ledger)?;
            let report = self.run_stage(ledger, PipelineStage::Cie1, || {
                assess_quality(image, options.quality_threshold)
            });
            debug!(
                score = report.overall_score,
                sharpness = report.sharpness,
                brightness = report.brightness,
                cct = report.cct.cct,
                "cie1"
            );
            let rejection = (!report.is_acceptable).then(|| RejectionReason::QualityRejected {
                score: report.overall_score,
                threshold: options.quality_threshold,
            });
            outputs.cie1 = Some(report);
            if let Some(reason) = rejection {
                if !options.continue_on_quality_fail {
                    return Err(reason);
                }
                warn!(%reason, "continuing past quality rejection");
                outputs.quality_warning = Some(reason);
            }
        }

        check_cancelled(ledger)?;
        let synthetic = MockLandmarkDetector::default();
        let detector: &dyn LandmarkDetector = if self.detector.is_available() {
            self.detector.as_ref()
        } else {
            warn!(
                detector = self.detector.name(),
                "landmark detector unavailable, using synthetic landmarks"
            );
            &synthetic
        };
        let localization = self
            .run_stage(ledger, PipelineStage::Cie2, || {
                localize_face(image, detector, options.roi_padding)
            })
            .map_err(|e| RejectionReason::InternalError(e.to_string()))?;
        let detection = match localization {
            FaceLocalization::Detected(detection) => detection,
            FaceLocalization::NoFace => return Err(RejectionReason::NoFaceDetected),
            FaceLocalization::Ambiguous { face_count } => {
                return Err(RejectionReason::AmbiguousFace { face_count });
            }
            FaceLocalization::AngleInvalid {
                detection,
                feedback,
            } => {
                outputs.cie2 = Some(detection);
                return Err(RejectionReason::AngleOutOfRange { feedback });
            }
        };
        debug!(
            faces = detection.face_count,
            frontality = detection.face.frontality_score,
            "cie2"
        );
        let roi = detection.roi;
        outputs.cie2 = Some(detection);

        if !options.skip_awb_correction {
            check_cancelled(ledger)?;
            let corrected = self.run_stage(ledger, PipelineStage::Cie3, || {
                correct_white_balance(image, options.awb_method, Some(roi))
            })?;
            debug!(
                method = %corrected.method,
                original_cct = corrected.original_cct,
                corrected_cct = corrected.corrected_cct,
                confidence = corrected.confidence,
                "cie3"
            );
            outputs.cie3 = Some(corrected);
        }

        if !options.skip_lighting_analysis {
            check_cancelled(ledger)?;
            let target = outputs.cie3.as_ref().map_or(image, |w| &w.corrected_image);
            let report = self.run_stage(ledger, PipelineStage::Cie4, || {
                analyze_lighting(target, Some(roi))
            });
            debug!(score = report.overall_score, success = report.success, "cie4");
            outputs.cie4 = Some(report);
        }

        check_cancelled(ledger)
    }

    /// Run `f` as `stage`, recording its duration and reporting progress.
    ///
    /// Progress is reported whether or not the stage's output later fails
    /// the run.
    fn run_stage<T>(&self, ledger: &RunLedger, stage: PipelineStage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let value = f();
        let elapsed = start.elapsed();
        ledger.record_stage(stage, elapsed);
        debug!(%stage, elapsed_ms = crate::diagnostics::duration_ms(elapsed), "stage finished");
        self.notify(ledger, stage);
        value
    }

    fn notify(&self, ledger: &RunLedger, stage: PipelineStage) {
        if ledger.is_cancelled() {
            return;
        }
        if let (Some(observer), Some(percent)) = (&self.progress, stage.progress_percent()) {
            observer.on_progress(stage, percent);
        }
    }
}

fn check_cancelled(ledger: &RunLedger) -> Result<(), RejectionReason> {
    if ledger.is_cancelled() {
        Err(RejectionReason::InternalError("run cancelled".to_owned()))
    } else {
        Ok(())
    }
}

fn last_executed(metadata: &PipelineMetadata) -> PipelineStage {
    metadata
        .executed_stages
        .last()
        .copied()
        .unwrap_or(PipelineStage::Failed)
}

fn assemble(
    dimensions: Dimensions,
    outputs: StageOutputs,
    outcome: Result<(), RejectionReason>,
    mut metadata: PipelineMetadata,
    elapsed: Duration,
) -> PipelineResult {
    let (overall_quality_score, overall_confidence) = aggregate_scores(&outputs);
    metadata.overall_quality_score = overall_quality_score;
    metadata.overall_confidence = overall_confidence;

    let (stage, rejection) = match outcome {
        Ok(()) => (PipelineStage::Complete, outputs.quality_warning),
        Err(reason) => (PipelineStage::Failed, Some(reason)),
    };
    let is_suitable_for_analysis = stage == PipelineStage::Complete
        && rejection.is_none()
        && outputs.cie4.as_ref().is_none_or(|l| l.success);

    PipelineResult {
        cie1: outputs.cie1,
        cie2: outputs.cie2,
        cie3: outputs.cie3,
        cie4: outputs.cie4,
        stage,
        rejection,
        is_suitable_for_analysis,
        dimensions,
        total_processing_time: elapsed,
        metadata,
    }
}

/// Weighted mean of the available stage scores and plain mean of the
/// available confidences, clamped to `[0, 100]` and `[0, 1]`.
fn aggregate_scores(outputs: &StageOutputs) -> (f64, f64) {
    let scores = [
        outputs.cie1.as_ref().map(|q| (q.overall_score, CIE1_WEIGHT)),
        outputs.cie2.as_ref().map(|d| (d.face.frontality_score, CIE2_WEIGHT)),
        outputs.cie3.as_ref().map(|w| (w.confidence * 100.0, CIE3_WEIGHT)),
        outputs.cie4.as_ref().map(|l| (l.overall_score, CIE4_WEIGHT)),
    ];
    let (weighted, weights) = scores
        .iter()
        .flatten()
        .fold((0.0, 0.0), |(s, w), &(score, weight)| (score.mul_add(weight, s), w + weight));
    let quality = if weights > 0.0 { weighted / weights } else { 0.0 };

    let confidences: Vec<f64> = [
        outputs.cie1.as_ref().map(|q| q.cct.confidence),
        outputs.cie2.as_ref().map(|d| d.face.confidence),
        outputs.cie3.as_ref().map(|w| w.confidence),
        outputs.cie4.as_ref().map(|l| l.overall_score / 100.0),
    ]
    .into_iter()
    .flatten()
    .collect();
    #[allow(clippy::cast_precision_loss)]
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    (quality.clamp(0.0, 100.0), confidence.clamp(0.0, 1.0))
}

fn failed_result(
    dimensions: Dimensions,
    reason: RejectionReason,
    metadata: PipelineMetadata,
    elapsed: Duration,
) -> PipelineResult {
    PipelineResult {
        cie1: None,
        cie2: None,
        cie3: None,
        cie4: None,
        stage: PipelineStage::Failed,
        rejection: Some(reason),
        is_suitable_for_analysis: false,
        dimensions,
        total_processing_time: elapsed,
        metadata,
    }
}

// ---------------------------------------------------------------------------
// Fallbacks
// ---------------------------------------------------------------------------

/// Failed result reporting that no face was found.
#[must_use]
pub fn generate_no_face_fallback(dimensions: Dimensions) -> PipelineResult {
    failed_result(
        dimensions,
        RejectionReason::NoFaceDetected,
        PipelineMetadata::default(),
        Duration::ZERO,
    )
}

/// Failed result carrying an internal error message.
#[must_use]
pub fn generate_error_fallback(
    message: impl Into<String>,
    dimensions: Dimensions,
) -> PipelineResult {
    failed_result(
        dimensions,
        RejectionReason::InternalError(message.into()),
        PipelineMetadata::default(),
        Duration::ZERO,
    )
}

/// Complete, randomized result for offline development. Every
/// confidence is capped at [`FALLBACK_MAX_CONFIDENCE`]; the stage 3
/// image is empty.
#[must_use]
pub fn generate_mock_result<R: Rng + ?Sized>(
    rng: &mut R,
    width: u32,
    height: u32,
) -> PipelineResult {
    let mut cie2 = generate_mock_face(width, height, PipelineOptions::DEFAULT_ROI_PADDING);
    cie2.face.confidence = cie2.face.confidence.min(FALLBACK_MAX_CONFIDENCE);
    let scene_cct = rng.gen_range(5500.0..7000.0);
    let mut cie3 = generate_corrected_fallback(&RgbImageData::default(), Some(scene_cct));
    cie3.confidence = cie3.confidence.min(FALLBACK_MAX_CONFIDENCE);

    let outputs = StageOutputs {
        cie1: Some(generate_mock_quality(rng, PipelineOptions::DEFAULT_QUALITY_THRESHOLD)),
        cie2: Some(cie2),
        cie3: Some(cie3),
        cie4: Some(generate_mock_lighting(rng)),
        quality_warning: None,
    };
    let mut metadata = PipelineMetadata::default();
    for stage in PipelineStage::PROCESSING {
        metadata.record_stage(stage, Duration::ZERO);
    }
    let dimensions = Dimensions { width, height };
    let mut result = assemble(dimensions, outputs, Ok(()), metadata, Duration::ZERO);
    result.metadata.overall_confidence = result
        .metadata
        .overall_confidence
        .min(FALLBACK_MAX_CONFIDENCE);
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::landmarks::{DetectorError, NoFaceDetector, RawLandmarks};

    fn gray(width: u32, height: u32) -> RgbImageData {
        RgbImageData::filled(width, height, [128, 128, 128])
    }

    /// Detector that claims to be unavailable.
    struct OfflineDetector;

    impl LandmarkDetector for OfflineDetector {
        fn is_available(&self) -> bool {
            false
        }

        fn detect(&self, _image: &RgbImageData) -> Result<Vec<RawLandmarks>, DetectorError> {
            Err(DetectorError::Unavailable)
        }

        fn name(&self) -> &'static str {
            "offline"
        }
    }

    /// Detector whose inference always fails.
    struct BrokenDetector;

    impl LandmarkDetector for BrokenDetector {
        fn is_available(&self) -> bool {
            true
        }

        fn detect(&self, _image: &RgbImageData) -> Result<Vec<RawLandmarks>, DetectorError> {
            Err(DetectorError::Inference("model crashed".to_owned()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    // --- Flow tests ---

    #[test]
    fn default_run_on_gray_completes() {
        let result = CiePipeline::new(PipelineOptions::default()).run(&gray(64, 48));
        assert!(result.success(), "{:?}", result.rejection);
        assert_eq!(result.stage, PipelineStage::Complete);
        assert_eq!(
            result.metadata.executed_stages,
            PipelineStage::PROCESSING.into_iter().collect(),
        );
        assert!(result.metadata.skipped_stages.is_empty());
        assert!(result.corrected_image().is_some());
    }

    #[test]
    fn zero_area_image_is_invalid_input() {
        let result = CiePipeline::new(PipelineOptions::default()).run(&gray(0, 10));
        assert_eq!(result.stage, PipelineStage::Failed);
        assert!(matches!(result.rejection, Some(RejectionReason::InvalidInput(_))));
        assert!(result.metadata.executed_stages.is_empty());
    }

    #[test]
    fn quality_rejection_stops_run() {
        let image = RgbImageData::filled(32, 32, [10, 10, 10]);
        let result = CiePipeline::new(PipelineOptions::default()).run(&image);
        assert_eq!(result.stage, PipelineStage::Failed);
        assert!(matches!(
            result.rejection,
            Some(RejectionReason::QualityRejected { .. })
        ));
        assert!(result.cie1.is_some());
        assert!(result.cie2.is_none());
    }

    #[test]
    fn quality_rejection_can_be_tolerated() {
        let image = RgbImageData::filled(32, 32, [10, 10, 10]);
        let options = PipelineOptions {
            continue_on_quality_fail: true,
            ..PipelineOptions::default()
        };
        let result = CiePipeline::new(options).run(&image);
        assert!(result.success());
        assert!(!result.is_suitable_for_analysis);
        assert!(matches!(
            result.rejection,
            Some(RejectionReason::QualityRejected { .. })
        ));
        assert!(result.metadata.was_executed(PipelineStage::Cie2));
    }

    #[test]
    fn unavailable_detector_falls_back_to_mock() {
        let pipeline = CiePipeline::new(PipelineOptions::default())
            .with_detector(Arc::new(OfflineDetector));
        let result = pipeline.run(&gray(64, 64));
        assert!(result.success(), "{:?}", result.rejection);
    }

    #[test]
    fn detector_failure_is_internal_error() {
        let pipeline = CiePipeline::new(PipelineOptions::default())
            .with_detector(Arc::new(BrokenDetector));
        let result = pipeline.run(&gray(64, 64));
        assert!(matches!(
            &result.rejection,
            Some(RejectionReason::InternalError(msg)) if msg.contains("model crashed")
        ));
    }

    #[test]
    fn no_face_fails_after_stage_two() {
        let pipeline = CiePipeline::new(PipelineOptions::default())
            .with_detector(Arc::new(NoFaceDetector));
        let result = pipeline.run(&gray(64, 64));
        assert_eq!(result.rejection, Some(RejectionReason::NoFaceDetected));
        assert!(result.metadata.was_executed(PipelineStage::Cie2));
        assert!(!result.metadata.was_executed(PipelineStage::Cie3));
    }

    #[test]
    fn black_image_is_insufficient_signal_at_stage_three() {
        let options = PipelineOptions {
            skip_quality_check: true,
            ..PipelineOptions::default()
        };
        let result = CiePipeline::new(options).run(&RgbImageData::filled(32, 32, [0, 0, 0]));
        assert!(matches!(
            result.rejection,
            Some(RejectionReason::InsufficientSignal(_))
        ));
        assert!(result.cie2.is_some());
    }

    // --- Progress tests ---

    #[test]
    fn progress_is_reported_per_executed_stage() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let options = PipelineOptions {
            skip_awb_correction: true,
            ..PipelineOptions::default()
        };
        let result = CiePipeline::new(options)
            .with_progress(move |stage: PipelineStage, pct: u8| {
                sink.lock().unwrap().push((stage, pct));
            })
            .run(&gray(32, 32));
        assert!(result.success());
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                (PipelineStage::Cie1, 25),
                (PipelineStage::Cie2, 50),
                (PipelineStage::Cie4, 90),
                (PipelineStage::Complete, 100),
            ],
        );
    }

    /// Run `pipeline` on `image`, returning the result and every progress event.
    fn run_recording(
        pipeline: CiePipeline,
        image: &RgbImageData,
    ) -> (PipelineResult, Vec<(PipelineStage, u8)>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let result = pipeline
            .with_progress(move |stage: PipelineStage, pct: u8| {
                sink.lock().unwrap().push((stage, pct));
            })
            .run(image);
        let events = events.lock().unwrap().clone();
        (result, events)
    }

    #[test]
    fn failing_stage_still_reports_progress() {
        let skip_quality = PipelineOptions {
            skip_quality_check: true,
            ..PipelineOptions::default()
        };
        let cases = [
            // Stage 1 rejects the frame.
            (
                CiePipeline::new(PipelineOptions::default()),
                RgbImageData::filled(64, 64, [10, 10, 10]),
                PipelineStage::Cie1,
            ),
            // Stage 2 finds nothing.
            (
                CiePipeline::new(PipelineOptions::default())
                    .with_detector(Arc::new(NoFaceDetector)),
                gray(64, 64),
                PipelineStage::Cie2,
            ),
            // Stage 2 rejects the pose.
            (
                CiePipeline::new(PipelineOptions::default()).with_detector(Arc::new(
                    MockLandmarkDetector::with_pose(0.0, 35f64.to_radians(), 0.0),
                )),
                gray(64, 64),
                PipelineStage::Cie2,
            ),
            // Stage 2 detector error.
            (
                CiePipeline::new(PipelineOptions::default())
                    .with_detector(Arc::new(BrokenDetector)),
                gray(64, 64),
                PipelineStage::Cie2,
            ),
            // Stage 3 has no signal.
            (
                CiePipeline::new(skip_quality),
                RgbImageData::filled(32, 32, [0, 0, 0]),
                PipelineStage::Cie3,
            ),
        ];

        for (pipeline, image, failing) in cases {
            let (result, events) = run_recording(pipeline, &image);
            assert_eq!(result.stage, PipelineStage::Failed, "{failing}");
            assert_eq!(last_executed(&result.metadata), failing);
            for stage in &result.metadata.executed_stages {
                assert!(
                    events.iter().any(|(s, _)| s == stage),
                    "{stage} executed without progress: {events:?}",
                );
            }
            assert!(events.iter().all(|&(_, pct)| pct < 100), "{events:?}");
            assert_eq!(events.len(), result.metadata.executed_stages.len());
        }
    }

    #[test]
    fn cancelled_run_reports_nothing() {
        let ledger = RunLedger::default();
        ledger.cancel();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let pipeline = CiePipeline::new(PipelineOptions::default()).with_progress(
            move |stage: PipelineStage, pct: u8| {
                sink.lock().unwrap().push((stage, pct));
            },
        );
        let result = pipeline.run_with_ledger(&gray(16, 16), &ledger);
        assert!(!result.success());
        assert!(events.lock().unwrap().is_empty());
    }

    // --- Aggregate tests ---

    #[test]
    fn aggregates_are_bounded() {
        let result = CiePipeline::new(PipelineOptions::default()).run(&gray(64, 64));
        let meta = &result.metadata;
        assert!((0.0..=100.0).contains(&meta.overall_quality_score));
        assert!((0.0..=1.0).contains(&meta.overall_confidence));
        assert!(meta.overall_quality_score > 0.0);
    }

    #[test]
    fn aggregates_of_nothing_are_zero() {
        let (quality, confidence) = aggregate_scores(&StageOutputs::default());
        assert!(quality.abs() < f64::EPSILON);
        assert!(confidence.abs() < f64::EPSILON);
    }

    // --- Cancellation tests ---

    #[test]
    fn cancelled_ledger_stops_before_first_stage() {
        let ledger = RunLedger::default();
        ledger.cancel();
        let result =
            CiePipeline::new(PipelineOptions::default()).run_with_ledger(&gray(16, 16), &ledger);
        assert_eq!(result.stage, PipelineStage::Failed);
        assert!(result.metadata.executed_stages.is_empty());
    }

    #[tokio::test]
    async fn generous_timeout_completes() {
        let result = CiePipeline::new(PipelineOptions::default())
            .run_with_timeout(gray(32, 32), Duration::from_secs(30))
            .await;
        assert!(result.success(), "{:?}", result.rejection);
    }

    #[tokio::test]
    async fn zero_budget_times_out_or_completes_cleanly() {
        let result = CiePipeline::new(PipelineOptions::default())
            .run_with_timeout(gray(640, 480), Duration::ZERO)
            .await;
        match result.stage {
            PipelineStage::Complete => assert!(result.rejection.is_none()),
            _ => {
                assert_eq!(result.rejection, Some(RejectionReason::Timeout { budget_ms: 0 }));
                for stage in result.metadata.stage_times.keys() {
                    assert!(result.metadata.was_executed(*stage));
                }
            }
        }
    }

    // --- Fallback tests ---

    #[test]
    fn fallbacks_are_failed_and_low_confidence() {
        let dims = Dimensions {
            width: 10,
            height: 10,
        };
        let no_face = generate_no_face_fallback(dims);
        assert_eq!(no_face.rejection, Some(RejectionReason::NoFaceDetected));
        assert!(!no_face.success());

        let error = generate_error_fallback("boom", dims);
        assert_eq!(
            error.rejection,
            Some(RejectionReason::InternalError("boom".to_owned()))
        );
        assert!(error.metadata.overall_confidence <= FALLBACK_MAX_CONFIDENCE);
    }

    #[test]
    fn mock_result_is_complete_and_capped() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            let result = generate_mock_result(&mut rng, 640, 480);
            assert!(result.success());
            assert!(result.metadata.overall_confidence <= FALLBACK_MAX_CONFIDENCE);
            assert!(result.cie2.as_ref().unwrap().face.confidence <= FALLBACK_MAX_CONFIDENCE);
            assert!(result.cie3.as_ref().unwrap().confidence <= FALLBACK_MAX_CONFIDENCE);
            assert!(result.corrected_image().is_none());
        }
    }

    #[test]
    fn result_serializes_without_pixels() {
        let result = CiePipeline::new(PipelineOptions::default()).run(&gray(16, 16));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stage"], "complete");
        assert!(json["cie3"].get("corrected_image").is_none());
        assert!(json["total_processing_time"].is_f64());
    }
}
