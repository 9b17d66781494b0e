//! Chrominance-based skin detection.
//!
//! A pixel is skin when its BT.601 chroma falls in the classic
//! Chai & Ngan box (`Cb ∈ [77, 127]`, `Cr ∈ [133, 173]`). Luma is
//! ignored, so the rule is only as good as the white balance of the
//! input; stage 3 uses it to find skin *before* correcting.

use serde::{Deserialize, Serialize};

use crate::color::{Rgb, rgb_to_ycbcr};
use crate::face::PixelRect;
use crate::types::RgbImageData;

/// Inclusive Cb range of the skin box.
pub const SKIN_CB_RANGE: (f64, f64) = (77.0, 127.0);
/// Inclusive Cr range of the skin box.
pub const SKIN_CR_RANGE: (f64, f64) = (133.0, 173.0);
/// Coverage above which skin counts as detected.
pub const MIN_SKIN_COVERAGE: f64 = 0.05;
/// Coverage above which the detection is implausible for a face crop
/// (large skin-colored backgrounds, strong color casts).
pub const MAX_PLAUSIBLE_COVERAGE: f64 = 0.4;

/// Result of [`detect_skin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinDetection {
    /// `coverage > MIN_SKIN_COVERAGE`.
    pub detected: bool,
    /// Fraction of examined pixels classified as skin, `0..=1`.
    pub coverage: f64,
    /// Row-major mask over the examined region (the ROI, or the whole
    /// image).
    pub mask: Vec<bool>,
    /// The region the mask covers.
    pub region: PixelRect,
    /// Mean color of the skin pixels, if any.
    pub mean_rgb: Option<Rgb>,
}

impl SkinDetection {
    /// Whether the detection is usable as a color reference.
    #[must_use]
    pub fn is_plausible(&self) -> bool {
        self.detected && self.coverage <= MAX_PLAUSIBLE_COVERAGE
    }

    /// Number of skin pixels.
    #[must_use]
    pub fn skin_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

/// Whether a single pixel falls inside the skin chroma box.
#[must_use]
pub fn is_skin_pixel(rgb: [u8; 3]) -> bool {
    let ycc = rgb_to_ycbcr(Rgb::from_u8(rgb));
    (SKIN_CB_RANGE.0..=SKIN_CB_RANGE.1).contains(&ycc.cb)
        && (SKIN_CR_RANGE.0..=SKIN_CR_RANGE.1).contains(&ycc.cr)
}

/// Classify pixels of `image` inside `roi` (or the whole image).
///
/// The ROI is clipped to the image; an empty region yields zero coverage.
#[must_use]
pub fn detect_skin(image: &RgbImageData, roi: Option<PixelRect>) -> SkinDetection {
    let region = roi
        .unwrap_or_else(|| PixelRect::full(image.width(), image.height()))
        .clip_to(image.width(), image.height());

    let mut mask = Vec::with_capacity(region.area());
    let mut sum = [0.0f64; 3];
    let mut skin = 0usize;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            let is_skin = image.pixel(x, y).is_some_and(|p| {
                let hit = is_skin_pixel(p);
                if hit {
                    for (s, &c) in sum.iter_mut().zip(p.iter()) {
                        *s += f64::from(c);
                    }
                }
                hit
            });
            skin += usize::from(is_skin);
            mask.push(is_skin);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let coverage = if mask.is_empty() {
        0.0
    } else {
        skin as f64 / mask.len() as f64
    };
    #[allow(clippy::cast_precision_loss)]
    let mean_rgb = (skin > 0).then(|| {
        let n = skin as f64;
        Rgb::new(sum[0] / n, sum[1] / n, sum[2] / n)
    });

    SkinDetection {
        detected: coverage > MIN_SKIN_COVERAGE,
        coverage,
        mask,
        region,
        mean_rgb,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SKIN: [u8; 3] = [224, 172, 138];
    const BLUE: [u8; 3] = [40, 60, 200];

    #[test]
    fn reference_skin_tone_is_skin() {
        assert!(is_skin_pixel(SKIN));
        assert!(is_skin_pixel([141, 85, 36]));
    }

    #[test]
    fn neutral_and_blue_are_not_skin() {
        assert!(!is_skin_pixel([128, 128, 128]));
        assert!(!is_skin_pixel(BLUE));
        assert!(!is_skin_pixel([0, 0, 0]));
    }

    #[test]
    fn full_skin_image_is_detected_but_implausible() {
        let image = RgbImageData::filled(20, 10, SKIN);
        let result = detect_skin(&image, None);
        assert!(result.detected);
        assert!((result.coverage - 1.0).abs() < 1e-12);
        assert_eq!(result.mask.len(), 200);
        assert!(!result.is_plausible());
        let mean = result.mean_rgb.unwrap();
        assert!((mean.r - 224.0).abs() < 1e-9);
    }

    #[test]
    fn partial_coverage_is_plausible() {
        // Left quarter of the image is skin.
        let image = RgbImageData::from_fn(40, 10, |x, _| if x < 10 { SKIN } else { BLUE });
        let result = detect_skin(&image, None);
        assert!((result.coverage - 0.25).abs() < 1e-12);
        assert!(result.detected);
        assert!(result.is_plausible());
        assert_eq!(result.skin_pixel_count(), 100);
    }

    #[test]
    fn roi_restricts_examined_pixels() {
        let image = RgbImageData::from_fn(40, 10, |x, _| if x < 10 { SKIN } else { BLUE });
        let roi = PixelRect {
            x: 20,
            y: 0,
            width: 10,
            height: 10,
        };
        let result = detect_skin(&image, Some(roi));
        assert_eq!(result.mask.len(), 100);
        assert!(!result.detected);
        assert!(result.mean_rgb.is_none());
    }

    #[test]
    fn roi_outside_image_yields_empty_mask() {
        let image = RgbImageData::filled(10, 10, SKIN);
        let roi = PixelRect {
            x: 50,
            y: 50,
            width: 10,
            height: 10,
        };
        let result = detect_skin(&image, Some(roi));
        assert!(result.mask.is_empty());
        assert!(result.coverage.abs() < f64::EPSILON);
        assert!(!result.detected);
    }
}
