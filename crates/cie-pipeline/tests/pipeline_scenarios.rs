//! Integration tests: end-to-end pipeline runs through the public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cie_pipeline::landmarks::NoFaceDetector;
use cie_pipeline::{
    CiePipeline, MockLandmarkDetector, PipelineOptions, PipelineStage, RejectionReason,
    RgbImageData, WhiteBalanceMethod, decode_rgb, run_cie_pipeline,
    run_cie_pipeline_with_timeout,
};

const D65: f64 = 6500.0;

fn mid_gray(width: u32, height: u32) -> RgbImageData {
    RgbImageData::filled(width, height, [128, 128, 128])
}

fn all_skipped() -> PipelineOptions {
    PipelineOptions {
        skip_quality_check: true,
        skip_awb_correction: true,
        skip_lighting_analysis: true,
        ..PipelineOptions::default()
    }
}

#[test]
fn mid_gray_without_quality_gate_completes() {
    let options = PipelineOptions {
        skip_quality_check: true,
        ..PipelineOptions::default()
    };
    let result = run_cie_pipeline(&mid_gray(640, 480), &options);

    assert!(result.success(), "{:?}", result.rejection);
    assert_eq!(result.stage, PipelineStage::Complete);
    assert!(result.metadata.was_skipped(PipelineStage::Cie1));
    for stage in [PipelineStage::Cie2, PipelineStage::Cie3, PipelineStage::Cie4] {
        assert!(result.metadata.was_executed(stage), "{stage} not executed");
    }
    assert!(result.cie1.is_none());
    assert!(!result.metadata.stage_times.contains_key(&PipelineStage::Cie1));
    assert!(result.total_processing_time > Duration::ZERO);
    assert!(result.is_suitable_for_analysis);
}

#[test]
fn face_localization_runs_even_with_every_skip() {
    let result = run_cie_pipeline(&mid_gray(640, 480), &all_skipped());

    assert!(result.success());
    assert_eq!(
        result.metadata.executed_stages.iter().copied().collect::<Vec<_>>(),
        vec![PipelineStage::Cie2],
    );
    assert_eq!(result.metadata.skipped_stages.len(), 3);
    assert!(result.cie2.is_some());
    assert!(result.corrected_image().is_none());
}

#[tokio::test]
async fn one_millisecond_budget_yields_well_formed_result() {
    let result = run_cie_pipeline_with_timeout(
        mid_gray(640, 480),
        PipelineOptions::default(),
        Duration::from_millis(1),
    )
    .await;

    let meta = &result.metadata;
    for stage in meta.stage_times.keys() {
        assert!(meta.was_executed(*stage));
    }
    assert!(meta.executed_stages.is_disjoint(&meta.skipped_stages));
    if result.success() {
        assert!(result.rejection.is_none());
    } else {
        assert_eq!(result.stage, PipelineStage::Failed);
        assert!(result.rejection.is_some());
    }
}

#[test]
fn dark_frame_is_rejected_by_quality_gate() {
    let result = run_cie_pipeline(
        &RgbImageData::filled(64, 64, [10, 10, 10]),
        &PipelineOptions::default(),
    );

    assert!(!result.success());
    assert!(
        matches!(
            result.rejection,
            Some(RejectionReason::QualityRejected { score, threshold }) if score < threshold
        ),
        "unexpected rejection {:?}",
        result.rejection,
    );
    assert!(!result.report().is_empty());
}

#[test]
fn missing_face_stops_before_white_balance() {
    let result = CiePipeline::new(PipelineOptions::default())
        .with_detector(Arc::new(NoFaceDetector))
        .run(&mid_gray(64, 64));

    assert_eq!(result.rejection, Some(RejectionReason::NoFaceDetected));
    assert!(result.cie3.is_none());
    assert!(result.cie4.is_none());
    assert!(!result.is_suitable_for_analysis);
}

#[test]
fn turned_head_is_rejected_with_feedback() {
    let detector = MockLandmarkDetector::with_pose(0.0, 35f64.to_radians(), 0.0);
    let result = CiePipeline::new(PipelineOptions::default())
        .with_detector(Arc::new(detector))
        .run(&mid_gray(320, 240));

    assert!(matches!(
        &result.rejection,
        Some(RejectionReason::AngleOutOfRange { feedback }) if !feedback.is_empty()
    ));
    assert!(result.cie2.is_some(), "rejected face should still be reported");
}

#[test]
fn progress_percentages_increase_to_100() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let result = CiePipeline::new(PipelineOptions::default())
        .with_progress(move |_: PipelineStage, pct: u8| sink.lock().unwrap().push(pct))
        .run(&mid_gray(64, 64));

    assert!(result.success());
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![25, 50, 75, 90, 100]);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn tolerated_quality_failure_is_not_suitable() {
    let options = PipelineOptions {
        continue_on_quality_fail: true,
        ..PipelineOptions::default()
    };
    let result = run_cie_pipeline(&RgbImageData::filled(64, 64, [10, 10, 10]), &options);

    assert!(result.success());
    assert!(!result.is_suitable_for_analysis);
    assert!(result.cie1.is_some_and(|q| !q.is_acceptable));
}

#[test]
fn warm_cast_is_pulled_toward_daylight() {
    let options = PipelineOptions {
        skip_quality_check: true,
        awb_method: WhiteBalanceMethod::GrayWorld,
        ..PipelineOptions::default()
    };
    let result = run_cie_pipeline(&RgbImageData::filled(64, 64, [230, 190, 150]), &options);

    let wb = result.cie3.expect("white balance ran");
    let corrected = wb.corrected_cct.expect("corrected image has a color temperature");
    assert!((corrected - D65).abs() < (wb.original_cct - D65).abs());
}

#[test]
fn decoded_png_runs_end_to_end() {
    let img = image::RgbImage::from_pixel(48, 48, image::Rgb([128, 128, 128]));
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        img.as_raw(),
        img.width(),
        img.height(),
        image::ExtendedColorType::Rgb8,
    )
    .unwrap();

    let image = decode_rgb(&buf).unwrap();
    let result = run_cie_pipeline(&image, &PipelineOptions::default());
    assert!(result.success(), "{:?}", result.rejection);
    assert_eq!(result.dimensions.pixel_count(), 48 * 48);

    let json = serde_json::to_string(&result).unwrap();
    let back: cie_pipeline::PipelineResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back.stage, result.stage);
    assert_eq!(back.metadata.executed_stages, result.metadata.executed_stages);
}

#[test]
fn rejected_run_reports_progress_for_every_executed_stage() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let result = CiePipeline::new(PipelineOptions::default())
        .with_detector(Arc::new(NoFaceDetector))
        .with_progress(move |stage: PipelineStage, _: u8| sink.lock().unwrap().push(stage))
        .run(&mid_gray(64, 64));

    assert_eq!(result.rejection, Some(RejectionReason::NoFaceDetected));
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![PipelineStage::Cie1, PipelineStage::Cie2]);
    for stage in &result.metadata.executed_stages {
        assert!(seen.contains(stage), "{stage} executed without progress");
    }
}
