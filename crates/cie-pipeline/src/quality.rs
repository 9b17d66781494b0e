//! Stage 1: image quality gate.
//!
//! Scores sharpness (Laplacian variance), exposure (mean luma) and the
//! scene's color temperature against daylight, and combines them into a
//! single 0–100 score compared with the configured threshold.

use image::GrayImage;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::color::{D65_CCT, Rgb, estimate_cct_from_rgb};
use crate::pipeline::FALLBACK_MAX_CONFIDENCE;
use crate::types::RgbImageData;
use crate::white_balance::calculate_average_rgb;

/// Laplacian variance that earns a full sharpness score.
pub const SHARPNESS_REFERENCE_VARIANCE: f64 = 250.0;

/// Mean luma band with a full brightness score.
pub const IDEAL_BRIGHTNESS: (f64, f64) = (80.0, 200.0);

/// Lowest value [`calculate_cct_confidence`] approaches.
pub const CCT_CONFIDENCE_FLOOR: f64 = 0.1;
/// Distance from 6500 K at which confidence is halfway to the floor.
const CCT_CONFIDENCE_SCALE: f64 = 1500.0;

const SHARPNESS_WEIGHT: f64 = 0.4;
const BRIGHTNESS_WEIGHT: f64 = 0.3;
const CCT_WEIGHT: f64 = 0.3;

/// Color temperature bucket of the scene illuminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CctVerdict {
    TooWarm,
    Warm,
    Neutral,
    Cool,
    TooCool,
}

/// Color temperature part of a [`QualityReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CctAssessment {
    /// Estimated CCT in Kelvin; 0 when the image has no measurable
    /// chromaticity.
    pub cct: f64,
    pub verdict: CctVerdict,
    /// How close to daylight, 0–1.
    pub confidence: f64,
    pub feedback: String,
}

/// Stage 1 result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub is_acceptable: bool,
    /// 0–100.
    pub overall_score: f64,
    /// 0–100.
    pub sharpness: f64,
    /// 0–100.
    pub brightness: f64,
    pub cct: CctAssessment,
    /// One line per problem found, or a single confirmation.
    pub feedback: Vec<String>,
}

// ---------------------------------------------------------------------------
// Measures
// ---------------------------------------------------------------------------

/// Variance of the 4-neighbour Laplacian of the luma image.
#[must_use]
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let response = imageproc::filter::laplacian_filter(gray);
    let n = response.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let (sum, sum_sq) = response
        .as_raw()
        .iter()
        .fold((0.0f64, 0.0f64), |(s, sq), &v| {
            let v = f64::from(v);
            (s + v, v.mul_add(v, sq))
        });
    #[allow(clippy::cast_precision_loss)]
    let n = n as f64;
    let mean = sum / n;
    mean.mul_add(-mean, sum_sq / n).max(0.0)
}

/// Sharpness score, 0–100.
#[must_use]
pub fn calculate_sharpness(image: &RgbImageData) -> f64 {
    let gray = image::imageops::grayscale(&image.to_rgb_image());
    (laplacian_variance(&gray) / SHARPNESS_REFERENCE_VARIANCE).min(1.0) * 100.0
}

/// Mean BT.601 luma, 0–255.
#[must_use]
pub fn mean_luma(image: &RgbImageData) -> f64 {
    if image.is_empty() {
        return 0.0;
    }
    let sum: f64 = image.pixels().map(|p| Rgb::from_u8(p).luma()).sum();
    #[allow(clippy::cast_precision_loss)]
    let n = image.pixel_count() as f64;
    sum / n
}

/// Brightness score for a mean luma: 100 inside [`IDEAL_BRIGHTNESS`],
/// falling linearly to 0 at black and at white.
#[must_use]
pub fn brightness_score(luma: f64) -> f64 {
    let (low, high) = IDEAL_BRIGHTNESS;
    let score = if luma < low {
        100.0 * luma / low
    } else if luma > high {
        100.0 * (255.0 - luma) / (255.0 - high)
    } else {
        100.0
    };
    score.clamp(0.0, 100.0)
}

#[must_use]
pub fn calculate_brightness(image: &RgbImageData) -> f64 {
    brightness_score(mean_luma(image))
}

// ---------------------------------------------------------------------------
// CCT
// ---------------------------------------------------------------------------

/// Bucket a CCT (Kelvin).
#[must_use]
pub fn get_cct_verdict(cct: f64) -> CctVerdict {
    if cct < 4000.0 {
        CctVerdict::TooWarm
    } else if cct < 5500.0 {
        CctVerdict::Warm
    } else if cct < 6500.0 {
        CctVerdict::Neutral
    } else if cct < 7500.0 {
        CctVerdict::Cool
    } else {
        CctVerdict::TooCool
    }
}

/// 1.0 at 6500 K, falling toward [`CCT_CONFIDENCE_FLOOR`] with distance.
#[must_use]
pub fn calculate_cct_confidence(cct: f64) -> f64 {
    if !cct.is_finite() {
        return CCT_CONFIDENCE_FLOOR;
    }
    let d = (cct - D65_CCT) / CCT_CONFIDENCE_SCALE;
    CCT_CONFIDENCE_FLOOR + (1.0 - CCT_CONFIDENCE_FLOOR) / d.mul_add(d, 1.0)
}

#[must_use]
pub fn get_cct_feedback(verdict: CctVerdict) -> &'static str {
    match verdict {
        CctVerdict::TooWarm => {
            "lighting is very warm (incandescent); move to daylight or a neutral white light"
        }
        CctVerdict::Warm => "lighting is slightly warm; daylight gives more accurate colors",
        CctVerdict::Neutral => "lighting color is neutral",
        CctVerdict::Cool => "lighting is slightly cool; avoid shade or blue-tinted light",
        CctVerdict::TooCool => {
            "lighting is very cool (shade or fluorescent); move to direct daylight"
        }
    }
}

/// Assess a CCT value.
#[must_use]
pub fn assess_cct(cct: f64) -> CctAssessment {
    let verdict = get_cct_verdict(cct);
    CctAssessment {
        cct,
        verdict,
        confidence: calculate_cct_confidence(cct),
        feedback: get_cct_feedback(verdict).to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Stage 1
// ---------------------------------------------------------------------------

fn build_report(
    sharpness: f64,
    brightness: f64,
    cct: CctAssessment,
    threshold: f64,
) -> QualityReport {
    let overall_score = SHARPNESS_WEIGHT
        .mul_add(
            sharpness,
            BRIGHTNESS_WEIGHT.mul_add(brightness, CCT_WEIGHT * cct.confidence * 100.0),
        )
        .clamp(0.0, 100.0);

    let mut feedback = Vec::new();
    if sharpness < 50.0 {
        feedback.push("image is blurry; hold the camera steady and focus on the face".to_owned());
    }
    if brightness < 50.0 {
        feedback.push("image exposure is poor; adjust the lighting".to_owned());
    }
    if cct.verdict != CctVerdict::Neutral {
        feedback.push(cct.feedback.clone());
    }
    if feedback.is_empty() {
        feedback.push("image quality is good".to_owned());
    }

    QualityReport {
        is_acceptable: overall_score >= threshold,
        overall_score,
        sharpness,
        brightness,
        cct,
        feedback,
    }
}

/// Run the quality gate. Never fails; unmeasurable color temperature is
/// reported as 0 K.
#[must_use]
pub fn assess_quality(image: &RgbImageData, threshold: f64) -> QualityReport {
    let cct = estimate_cct_from_rgb(calculate_average_rgb(image)).unwrap_or(0.0);
    build_report(
        calculate_sharpness(image),
        calculate_brightness(image),
        assess_cct(cct),
        threshold,
    )
}

/// Placeholder report for runs where quality could not be measured.
#[must_use]
pub fn generate_quality_fallback(threshold: f64) -> QualityReport {
    let mut cct = assess_cct(D65_CCT);
    cct.confidence = FALLBACK_MAX_CONFIDENCE;
    let mut report = build_report(50.0, 50.0, cct, threshold);
    report.feedback = vec!["image quality was not measured".to_owned()];
    report
}

/// Plausible randomized report for offline development.
#[must_use]
pub fn generate_mock_quality<R: Rng + ?Sized>(rng: &mut R, threshold: f64) -> QualityReport {
    let sharpness = rng.gen_range(55.0..95.0);
    let brightness = rng.gen_range(60.0..100.0);
    let mut cct = assess_cct(rng.gen_range(5000.0..7500.0));
    cct.confidence = cct.confidence.min(FALLBACK_MAX_CONFIDENCE);
    build_report(sharpness, brightness, cct, threshold)
}
