//! Stage 4: lighting quality score.
//!
//! Three measures over the face region (or the whole frame): exposure of
//! the mean luma, uniformity of a coarse grid of block means, and the
//! share of clipped pixels.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::color::Rgb;
use crate::face::PixelRect;
use crate::types::RgbImageData;

/// Mean luma band with a full exposure score.
pub const IDEAL_EXPOSURE: (f64, f64) = (90.0, 180.0);

/// Grid size for the uniformity measure.
pub const UNIFORMITY_GRID: u32 = 4;

/// Coefficient of variation at which uniformity scores 0.
const MAX_UNIFORMITY_CV: f64 = 0.5;

/// Clipped-pixel fraction at which the clipping score reaches 0.
const MAX_CLIPPED_FRACTION: f64 = 0.2;

/// Channel values at or below this count as crushed shadows.
const SHADOW_CLIP: u8 = 5;
/// Channel values at or above this count as blown highlights.
const HIGHLIGHT_CLIP: u8 = 250;

const EXPOSURE_WEIGHT: f64 = 0.4;
const UNIFORMITY_WEIGHT: f64 = 0.4;
const CLIPPING_WEIGHT: f64 = 0.2;

/// Minimum overall score for a successful lighting check.
pub const LIGHTING_SUCCESS_THRESHOLD: f64 = 50.0;

/// Stage 4 result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingReport {
    pub success: bool,
    /// 0–100.
    pub overall_score: f64,
    pub exposure_score: f64,
    pub uniformity_score: f64,
    /// Fraction of pixels with any channel clipped, 0–1.
    pub clipping_ratio: f64,
    pub feedback: Vec<String>,
}

/// Exposure score for a mean luma.
#[must_use]
pub fn exposure_score(luma: f64) -> f64 {
    let (low, high) = IDEAL_EXPOSURE;
    if luma < low {
        (100.0 * luma / low).clamp(0.0, 100.0)
    } else if luma > high {
        (100.0 * (255.0 - luma) / (255.0 - high)).clamp(0.0, 100.0)
    } else {
        100.0
    }
}

/// Luma means of a `grid` x `grid` split of `region`. Blocks that end up
/// empty (regions smaller than the grid) are skipped.
#[must_use]
pub fn block_means(image: &RgbImageData, region: PixelRect, grid: u32) -> Vec<f64> {
    let grid = grid.max(1);
    let mut means = Vec::with_capacity((grid * grid) as usize);
    for by in 0..grid {
        let y0 = region.y + region.height * by / grid;
        let y1 = region.y + region.height * (by + 1) / grid;
        for bx in 0..grid {
            let x0 = region.x + region.width * bx / grid;
            let x1 = region.x + region.width * (bx + 1) / grid;
            let mut sum = 0.0;
            let mut n = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    if let Some(p) = image.pixel(x, y) {
                        sum += Rgb::from_u8(p).luma();
                        n += 1;
                    }
                }
            }
            if n > 0 {
                means.push(sum / f64::from(n));
            }
        }
    }
    means
}

/// Uniformity score from block means: 100 for equal blocks, falling
/// linearly with the coefficient of variation.
#[must_use]
pub fn uniformity_score(means: &[f64]) -> f64 {
    if means.len() < 2 {
        return 100.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = means.len() as f64;
    let mean = means.iter().sum::<f64>() / n;
    if mean <= f64::EPSILON {
        return 0.0;
    }
    let variance = means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;
    (100.0 * (1.0 - cv / MAX_UNIFORMITY_CV)).clamp(0.0, 100.0)
}

/// Fraction of pixels in `region` with any channel clipped.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn clipping_ratio(image: &RgbImageData, region: PixelRect) -> f64 {
    let mut clipped = 0usize;
    let mut total = 0usize;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            if let Some(p) = image.pixel(x, y) {
                total += 1;
                if p.iter().any(|&c| c <= SHADOW_CLIP || c >= HIGHLIGHT_CLIP) {
                    clipped += 1;
                }
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        clipped as f64 / total as f64
    }
}

fn region_mean_luma(image: &RgbImageData, region: PixelRect) -> f64 {
    let means = block_means(image, region, 1);
    means.first().copied().unwrap_or(0.0)
}

fn build_report(exposure: f64, uniformity: f64, clipping: f64) -> LightingReport {
    let clipping_score = (100.0 * (1.0 - clipping / MAX_CLIPPED_FRACTION)).clamp(0.0, 100.0);
    let overall_score = EXPOSURE_WEIGHT
        .mul_add(
            exposure,
            UNIFORMITY_WEIGHT.mul_add(uniformity, CLIPPING_WEIGHT * clipping_score),
        )
        .clamp(0.0, 100.0);

    let mut feedback = Vec::new();
    if exposure < 50.0 {
        feedback.push("face is under- or over-exposed; adjust the light level".to_owned());
    }
    if uniformity < 50.0 {
        feedback.push("lighting is uneven; face the light source directly".to_owned());
    }
    if clipping_score < 50.0 {
        feedback.push("parts of the face are clipped to black or white".to_owned());
    }
    if feedback.is_empty() {
        feedback.push("lighting is good".to_owned());
    }

    LightingReport {
        success: overall_score >= LIGHTING_SUCCESS_THRESHOLD,
        overall_score,
        exposure_score: exposure,
        uniformity_score: uniformity,
        clipping_ratio: clipping,
        feedback,
    }
}

/// Score the lighting of `image` inside `roi` (whole frame when `None`).
/// Never fails; an empty region scores 0 for exposure and uniformity.
#[must_use]
pub fn analyze_lighting(image: &RgbImageData, roi: Option<PixelRect>) -> LightingReport {
    let region = roi
        .unwrap_or_else(|| PixelRect::full(image.width(), image.height()))
        .clip_to(image.width(), image.height());
    if region.is_empty() {
        return build_report(0.0, 0.0, 0.0);
    }
    build_report(
        exposure_score(region_mean_luma(image, region)),
        uniformity_score(&block_means(image, region, UNIFORMITY_GRID)),
        clipping_ratio(image, region),
    )
}

/// Plausible randomized report for offline development.
#[must_use]
pub fn generate_mock_lighting<R: Rng + ?Sized>(rng: &mut R) -> LightingReport {
    build_report(
        rng.gen_range(60.0..100.0),
        rng.gen_range(55.0..100.0),
        rng.gen_range(0.0..0.05),
    )
}

/// Neutral report for runs where lighting could not be measured.
#[must_use]
pub fn generate_lighting_fallback() -> LightingReport {
    let mut report = build_report(50.0, 50.0, 0.0);
    report.feedback = vec!["lighting was not measured".to_owned()];
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn well_lit_uniform_image_succeeds() {
        let report = analyze_lighting(&RgbImageData::filled(64, 64, [140, 130, 120]), None);
        assert!(report.success);
        assert!((report.exposure_score - 100.0).abs() < f64::EPSILON);
        assert!((report.uniformity_score - 100.0).abs() < 1e-9);
        assert!(report.clipping_ratio.abs() < f64::EPSILON);
        assert_eq!(report.feedback, vec!["lighting is good".to_owned()]);
    }

    #[test]
    fn half_dark_face_is_uneven() {
        let image = RgbImageData::from_fn(64, 64, |x, _| {
            if x < 32 { [200, 190, 180] } else { [40, 35, 30] }
        });
        let report = analyze_lighting(&image, None);
        assert!(report.uniformity_score < 50.0, "{}", report.uniformity_score);
        assert!(report.feedback.iter().any(|f| f.contains("uneven")));
    }

    #[test]
    fn blown_out_image_fails() {
        let report = analyze_lighting(&RgbImageData::filled(16, 16, [255, 255, 255]), None);
        assert!((report.clipping_ratio - 1.0).abs() < f64::EPSILON);
        assert!(report.exposure_score.abs() < f64::EPSILON);
        assert!(!report.success);
    }

    #[test]
    fn roi_limits_measurement() {
        // Bright left half, black right half; ROI on the bright half only.
        let image = RgbImageData::from_fn(40, 20, |x, _| {
            if x < 20 { [150, 150, 150] } else { [0, 0, 0] }
        });
        let roi = PixelRect {
            x: 0,
            y: 0,
            width: 20,
            height: 20,
        };
        let report = analyze_lighting(&image, Some(roi));
        assert!(report.success);
        assert!(report.clipping_ratio.abs() < f64::EPSILON);
    }

    #[test]
    fn empty_region_never_panics() {
        let report = analyze_lighting(&RgbImageData::filled(0, 0, [0, 0, 0]), None);
        assert!(!report.success);
        let report = analyze_lighting(&RgbImageData::filled(2, 2, [120, 120, 120]), None);
        assert!(report.success);
    }

    #[test]
    fn exposure_band() {
        assert!((exposure_score(120.0) - 100.0).abs() < f64::EPSILON);
        assert!((exposure_score(45.0) - 50.0).abs() < 1e-12);
        assert!(exposure_score(255.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mock_lighting_is_in_range() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let report = generate_mock_lighting(&mut rng);
            assert!((0.0..=100.0).contains(&report.overall_score));
        }
        assert!(!generate_lighting_fallback().feedback.is_empty());
    }
}
