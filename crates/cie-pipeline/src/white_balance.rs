//! Stage 3: automatic white balance.
//!
//! Estimates the scene illuminant from the image (bright pixels first,
//! the whole frame otherwise), derives per-channel gains in linear light
//! for the selected method, and applies them through 8-bit lookup tables
//! to produce a corrected copy of the image.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::color::{
    D65_CCT, D65_WHITE, Rgb, XyzColor, chromatic_adaptation_matrix, estimate_cct_from_rgb,
    linear_to_srgb, rgb_to_linear, rgb_to_xyz, srgb_to_linear, XYZ_TO_SRGB,
};
use crate::face::PixelRect;
use crate::geometry::Vec3;
use crate::pipeline::FALLBACK_MAX_CONFIDENCE;
use crate::quality::calculate_cct_confidence;
use crate::skin::detect_skin;
use crate::types::{RejectionReason, RgbImageData};

/// Channel-mean brightness above which a pixel counts toward the
/// bright-region illuminant estimate.
pub const BRIGHT_REGION_THRESHOLD: f64 = 100.0;

/// Minimum fraction of bright pixels for the bright-region estimate.
pub const MIN_BRIGHT_FRACTION: f64 = 0.1;

/// Per-channel gains are clamped to this range.
pub const GAIN_RANGE: (f64, f64) = (0.5, 2.0);

/// Medium skin tone under D65, the target for skin-aware correction.
pub const REFERENCE_SKIN_RGB: Rgb = Rgb::new(224.0, 172.0, 138.0);

/// Weight of the skin-derived gains in the skin-aware blend.
const SKIN_BLEND: f64 = 0.5;

/// Confidence multiplier when the illuminant came from the whole frame
/// instead of its bright region.
const NO_BRIGHT_REGION_PENALTY: f64 = 0.8;

/// Illuminant estimation and correction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteBalanceMethod {
    /// Measure only; gains are 1.
    None,
    /// Equalize the illuminant estimate's channels.
    GrayWorld,
    /// Von Kries adaptation of the illuminant estimate to D65.
    VonKries,
    /// Match detected skin to a reference tone, blended with gray world.
    #[default]
    SkinAware,
}

impl WhiteBalanceMethod {
    pub const ALL: [Self; 4] = [Self::None, Self::GrayWorld, Self::VonKries, Self::SkinAware];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GrayWorld => "gray_world",
            Self::VonKries => "von_kries",
            Self::SkinAware => "skin_aware",
        }
    }

    /// Method reliability before accounting for the result.
    const fn base_confidence(self) -> f64 {
        match self {
            Self::None => 0.6,
            Self::GrayWorld => 0.75,
            Self::VonKries => 0.8,
            Self::SkinAware => 0.9,
        }
    }
}

impl fmt::Display for WhiteBalanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WhiteBalanceMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                format!("unknown white balance method {s:?} (expected none, gray_world, von_kries or skin_aware)")
            })
    }
}

/// Linear-light multipliers per channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelGains {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl ChannelGains {
    pub const IDENTITY: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    /// Clamp each gain into [`GAIN_RANGE`]; non-finite gains become 1.
    #[must_use]
    pub fn clamped(self) -> Self {
        let c = |g: f64| {
            if g.is_finite() {
                g.clamp(GAIN_RANGE.0, GAIN_RANGE.1)
            } else {
                1.0
            }
        };
        Self {
            r: c(self.r),
            g: c(self.g),
            b: c(self.b),
        }
    }

    /// Channel-wise `self * (1 - t) + other * t`.
    #[must_use]
    pub fn blend(self, other: Self, t: f64) -> Self {
        let l = |a: f64, b: f64| crate::geometry::lerp(a, b, t);
        Self {
            r: l(self.r, other.r),
            g: l(self.g, other.g),
            b: l(self.b, other.b),
        }
    }

    const fn as_array(self) -> [f64; 3] {
        [self.r, self.g, self.b]
    }

    const fn from_array(a: [f64; 3]) -> Self {
        Self {
            r: a[0],
            g: a[1],
            b: a[2],
        }
    }
}

/// Stage 3 result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteBalanceResult {
    /// The corrected copy. Not serialized; results that cross a process
    /// boundary carry only the measurements.
    #[serde(skip)]
    pub corrected_image: RgbImageData,
    pub gains: ChannelGains,
    /// Illuminant CCT before correction (Kelvin).
    pub original_cct: f64,
    /// Illuminant CCT after correction, if measurable.
    pub corrected_cct: Option<f64>,
    /// The method actually applied (skin-aware may fall back to gray
    /// world).
    pub method: WhiteBalanceMethod,
    /// 0–1.
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Illuminant estimation
// ---------------------------------------------------------------------------

/// Mean color of all pixels; black for an empty image.
#[must_use]
pub fn calculate_average_rgb(image: &RgbImageData) -> Rgb {
    average(image.pixels()).unwrap_or_default()
}

/// Mean color of the pixels whose channel mean exceeds `threshold`, or
/// `None` when fewer than [`MIN_BRIGHT_FRACTION`] of pixels qualify.
#[must_use]
pub fn calculate_bright_region_average_rgb(image: &RgbImageData, threshold: f64) -> Option<Rgb> {
    let total = image.pixel_count();
    let mut bright = 0usize;
    let mean = average(
        image
            .pixels()
            .filter(|&p| Rgb::from_u8(p).brightness() > threshold)
            .inspect(|_| bright += 1),
    )?;
    #[allow(clippy::cast_precision_loss)]
    let fraction = bright as f64 / total as f64;
    (fraction >= MIN_BRIGHT_FRACTION).then_some(mean)
}

#[allow(clippy::cast_precision_loss)]
fn average(pixels: impl Iterator<Item = [u8; 3]>) -> Option<Rgb> {
    let mut sum = [0u64; 3];
    let mut n = 0u64;
    for p in pixels {
        for (s, c) in sum.iter_mut().zip(p) {
            *s += u64::from(c);
        }
        n += 1;
    }
    (n > 0).then(|| {
        let n = n as f64;
        Rgb::new(sum[0] as f64 / n, sum[1] as f64 / n, sum[2] as f64 / n)
    })
}

/// Illuminant color estimate and whether it came from the bright region.
#[must_use]
pub fn estimate_illuminant(image: &RgbImageData) -> (Rgb, bool) {
    calculate_bright_region_average_rgb(image, BRIGHT_REGION_THRESHOLD).map_or_else(
        || (calculate_average_rgb(image), false),
        |rgb| (rgb, true),
    )
}

/// CCT of the scene illuminant, or `None` for images without measurable
/// chromaticity.
#[must_use]
pub fn estimate_scene_cct(image: &RgbImageData) -> Option<f64> {
    estimate_cct_from_rgb(estimate_illuminant(image).0)
}

// ---------------------------------------------------------------------------
// Gains
// ---------------------------------------------------------------------------

/// Gains that make the illuminant neutral at its own mean level.
#[must_use]
pub fn gray_world_gains(illuminant: Rgb) -> ChannelGains {
    let e = rgb_to_linear(illuminant);
    let mean = e.iter().sum::<f64>() / 3.0;
    ChannelGains::from_array(e.map(|c| safe_ratio(mean, c))).clamped()
}

/// Gains equivalent to a von Kries adaptation of the illuminant to D65.
///
/// The illuminant is adapted in LMS space and mapped back to linear sRGB;
/// each gain is the ratio of the adapted channel to the original.
#[must_use]
pub fn von_kries_gains(illuminant: Rgb) -> ChannelGains {
    let e = rgb_to_linear(illuminant);
    let xyz = rgb_to_xyz(illuminant);
    if xyz.y <= f64::EPSILON {
        return ChannelGains::IDENTITY;
    }
    let scale = 100.0 / xyz.y;
    let source_white = XyzColor::new(xyz.x * scale, 100.0, xyz.z * scale);
    let adapted = chromatic_adaptation_matrix(source_white, D65_WHITE)
        .multiply_vec(Vec3::new(xyz.x, xyz.y, xyz.z));
    let target = XYZ_TO_SRGB.multiply_vec(adapted.scale(0.01));
    ChannelGains::from_array([
        safe_ratio(target.x, e[0]),
        safe_ratio(target.y, e[1]),
        safe_ratio(target.z, e[2]),
    ])
    .clamped()
}

/// Gains moving the mean skin color toward [`REFERENCE_SKIN_RGB`] at the
/// skin's own luminance, blended with gray-world gains.
#[must_use]
pub fn skin_aware_gains(skin_mean: Rgb, illuminant: Rgb) -> ChannelGains {
    let s = rgb_to_linear(skin_mean);
    let r = rgb_to_linear(REFERENCE_SKIN_RGB);
    let luminance = |c: [f64; 3]| 0.2126f64.mul_add(c[0], 0.7152f64.mul_add(c[1], 0.0722 * c[2]));
    let k = safe_ratio(luminance(s), luminance(r));
    let skin = ChannelGains::from_array([
        safe_ratio(r[0] * k, s[0]),
        safe_ratio(r[1] * k, s[1]),
        safe_ratio(r[2] * k, s[2]),
    ]);
    gray_world_gains(illuminant)
        .blend(skin, SKIN_BLEND)
        .clamped()
}

fn safe_ratio(num: f64, den: f64) -> f64 {
    if den.abs() <= 1e-9 { f64::NAN } else { num / den }
}

/// Per-channel 8-bit lookup tables applying `gains` in linear light.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn build_gain_luts(gains: ChannelGains) -> [[u8; 256]; 3] {
    gains.as_array().map(|gain| {
        std::array::from_fn(|v| {
            #[allow(clippy::cast_precision_loss)]
            let linear = srgb_to_linear(v as f64 / 255.0) * gain;
            (linear_to_srgb(linear.clamp(0.0, 1.0)) * 255.0)
                .round()
                .clamp(0.0, 255.0) as u8
        })
    })
}

/// A corrected copy of `image`.
#[must_use]
pub fn apply_gains(image: &RgbImageData, gains: ChannelGains) -> RgbImageData {
    image.map_channels(&build_gain_luts(gains))
}

// ---------------------------------------------------------------------------
// Stage 3
// ---------------------------------------------------------------------------

/// Correct the image's white balance.
///
/// `roi` restricts skin detection for [`WhiteBalanceMethod::SkinAware`];
/// the illuminant is always estimated from the whole frame. Skin-aware
/// falls back to gray world when no plausible skin is found.
///
/// # Errors
///
/// [`RejectionReason::InsufficientSignal`] when the illuminant has no
/// measurable chromaticity (for example a black frame).
pub fn correct_white_balance(
    image: &RgbImageData,
    method: WhiteBalanceMethod,
    roi: Option<PixelRect>,
) -> Result<WhiteBalanceResult, RejectionReason> {
    let (illuminant, from_bright_region) = estimate_illuminant(image);
    let original_cct = estimate_cct_from_rgb(illuminant).ok_or_else(|| {
        RejectionReason::InsufficientSignal(
            "image has no measurable color to estimate the illuminant".to_owned(),
        )
    })?;

    let (gains, method) = match method {
        WhiteBalanceMethod::None => (ChannelGains::IDENTITY, method),
        WhiteBalanceMethod::GrayWorld => (gray_world_gains(illuminant), method),
        WhiteBalanceMethod::VonKries => (von_kries_gains(illuminant), method),
        WhiteBalanceMethod::SkinAware => {
            let skin = detect_skin(image, roi);
            match skin.mean_rgb.filter(|_| skin.is_plausible()) {
                Some(mean) => (skin_aware_gains(mean, illuminant), method),
                None => (gray_world_gains(illuminant), WhiteBalanceMethod::GrayWorld),
            }
        }
    };

    let corrected_image = if gains == ChannelGains::IDENTITY {
        image.clone()
    } else {
        apply_gains(image, gains)
    };
    let corrected_cct = estimate_scene_cct(&corrected_image);
    let fit = calculate_cct_confidence(corrected_cct.unwrap_or(original_cct));
    let mut confidence = method.base_confidence() * 0.5f64.mul_add(fit, 0.5);
    if !from_bright_region {
        confidence *= NO_BRIGHT_REGION_PENALTY;
    }

    Ok(WhiteBalanceResult {
        corrected_image,
        gains,
        original_cct,
        corrected_cct,
        method,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

/// Pass-through result for runs where correction could not be performed.
#[must_use]
pub fn generate_corrected_fallback(
    image: &RgbImageData,
    original_cct: Option<f64>,
) -> WhiteBalanceResult {
    let cct = original_cct.unwrap_or(D65_CCT);
    WhiteBalanceResult {
        corrected_image: image.clone(),
        gains: ChannelGains::IDENTITY,
        original_cct: cct,
        corrected_cct: Some(cct),
        method: WhiteBalanceMethod::None,
        confidence: 0.3f64.min(FALLBACK_MAX_CONFIDENCE),
    }
}
