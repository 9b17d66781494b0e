//! Colorimetry: sRGB, linear RGB, CIE XYZ, LMS, CIE Lab, and YCbCr
//! conversions, color-difference formulas, correlated color temperature,
//! and von Kries chromatic adaptation.
//!
//! Conventions:
//!
//! - [`Rgb`] channels are sRGB-encoded on a `0..=255` scale (stored as
//!   `f64` so averages keep their precision).
//! - [`XyzColor`] uses the `Y = 100` scale for reference white.
//! - All Lab math is relative to the D65 white point.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::geometry::{Matrix3, Vec3};

/// An sRGB color on a `0..=255` scale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    #[must_use]
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    #[must_use]
    pub fn from_u8(rgb: [u8; 3]) -> Self {
        Self::new(f64::from(rgb[0]), f64::from(rgb[1]), f64::from(rgb[2]))
    }

    /// Round and clamp to 8-bit channels.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_u8(self) -> [u8; 3] {
        let q = |c: f64| c.round().clamp(0.0, 255.0) as u8;
        [q(self.r), q(self.g), q(self.b)]
    }

    /// Mean of the three channels.
    #[must_use]
    pub fn brightness(self) -> f64 {
        (self.r + self.g + self.b) / 3.0
    }

    /// BT.601 luma.
    #[must_use]
    pub fn luma(self) -> f64 {
        0.299f64.mul_add(self.r, 0.587f64.mul_add(self.g, 0.114 * self.b))
    }
}

/// CIE L\*a\*b\* color.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LabColor {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl LabColor {
    #[must_use]
    pub const fn new(l: f64, a: f64, b: f64) -> Self {
        Self { l, a, b }
    }
}

/// CIE 1931 XYZ tristimulus values (`Y = 100` for reference white).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct XyzColor {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl XyzColor {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Cone response (long, medium, short).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LmsColor {
    pub l: f64,
    pub m: f64,
    pub s: f64,
}

/// Full-range BT.601 luma/chroma.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct YCbCr {
    pub y: f64,
    pub cb: f64,
    pub cr: f64,
}

/// CIE 1931 xy chromaticity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Chromaticity {
    pub x: f64,
    pub y: f64,
}

/// Weighting factors for [`calculate_ciede2000`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ciede2000Weights {
    pub k_l: f64,
    pub k_c: f64,
    pub k_h: f64,
}

impl Default for Ciede2000Weights {
    fn default() -> Self {
        Self {
            k_l: 1.0,
            k_c: 1.0,
            k_h: 1.0,
        }
    }
}

/// Errors from parsing color notation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColorError {
    #[error("invalid hex color {0:?}: expected 6 hex digits with optional leading '#'")]
    InvalidHex(String),
}

/// D65 reference white.
pub const D65_WHITE: XyzColor = XyzColor::new(95.047, 100.0, 108.883);

/// Correlated color temperature of D65.
pub const D65_CCT: f64 = 6500.0;

/// Linear sRGB (0..1) to XYZ (0..1), D65.
pub const SRGB_TO_XYZ: Matrix3 = Matrix3([
    [0.4124, 0.3576, 0.1805],
    [0.2126, 0.7152, 0.0722],
    [0.0193, 0.1192, 0.9505],
]);

/// XYZ (0..1) to linear sRGB (0..1), D65.
pub const XYZ_TO_SRGB: Matrix3 = Matrix3([
    [3.2406, -1.5372, -0.4986],
    [-0.9689, 1.8758, 0.0415],
    [0.0557, -0.2040, 1.0570],
]);

/// XYZ to LMS, Hunt-Pointer-Estevez cone fundamentals as used by von
/// Kries adaptation.
pub const XYZ_TO_LMS: Matrix3 = Matrix3([
    [0.400_24, 0.707_60, -0.080_81],
    [-0.226_30, 1.165_32, 0.045_70],
    [0.0, 0.0, 0.918_22],
]);

/// Inverse of [`XYZ_TO_LMS`].
pub const LMS_TO_XYZ: Matrix3 = Matrix3([
    [1.859_936_4, -1.129_381_6, 0.219_897_4],
    [0.361_191_4, 0.638_812_5, -0.000_006_4],
    [0.0, 0.0, 1.089_063_6],
]);

/// Lab nonlinearity breakpoint `6/29`.
const LAB_DELTA: f64 = 6.0 / 29.0;

// ---------------------------------------------------------------------------
// Transfer functions
// ---------------------------------------------------------------------------

/// Decode one sRGB channel in `[0, 1]` to linear light.
#[must_use]
pub fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.039_28 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Encode one linear channel in `[0, 1]` to sRGB.
#[must_use]
pub fn linear_to_srgb(c: f64) -> f64 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055f64.mul_add(c.powf(1.0 / 2.4), -0.055)
    }
}

/// Linear-light channels (`0..1`) of an sRGB color.
#[must_use]
pub fn rgb_to_linear(rgb: Rgb) -> [f64; 3] {
    [
        srgb_to_linear(rgb.r / 255.0),
        srgb_to_linear(rgb.g / 255.0),
        srgb_to_linear(rgb.b / 255.0),
    ]
}

/// Encode linear-light channels back to sRGB (`0..=255`), clamping to
/// gamut.
#[must_use]
pub fn linear_to_rgb(linear: [f64; 3]) -> Rgb {
    let e = |c: f64| linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0;
    Rgb::new(e(linear[0]), e(linear[1]), e(linear[2]))
}

// ---------------------------------------------------------------------------
// XYZ / Lab / LMS
// ---------------------------------------------------------------------------

#[must_use]
pub fn rgb_to_xyz(rgb: Rgb) -> XyzColor {
    let [r, g, b] = rgb_to_linear(rgb);
    let v = SRGB_TO_XYZ.multiply_vec(Vec3::new(r, g, b));
    XyzColor::new(v.x * 100.0, v.y * 100.0, v.z * 100.0)
}

#[must_use]
pub fn xyz_to_rgb(xyz: XyzColor) -> Rgb {
    let v = XYZ_TO_SRGB.multiply_vec(Vec3::new(
        xyz.x / 100.0,
        xyz.y / 100.0,
        xyz.z / 100.0,
    ));
    linear_to_rgb([v.x, v.y, v.z])
}

fn lab_f(t: f64) -> f64 {
    if t > LAB_DELTA.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * LAB_DELTA * LAB_DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f64) -> f64 {
    if t > LAB_DELTA {
        t.powi(3)
    } else {
        3.0 * LAB_DELTA * LAB_DELTA * (t - 4.0 / 29.0)
    }
}

#[must_use]
pub fn xyz_to_lab(xyz: XyzColor) -> LabColor {
    let fx = lab_f(xyz.x / D65_WHITE.x);
    let fy = lab_f(xyz.y / D65_WHITE.y);
    let fz = lab_f(xyz.z / D65_WHITE.z);
    LabColor::new(116.0f64.mul_add(fy, -16.0), 500.0 * (fx - fy), 200.0 * (fy - fz))
}

#[must_use]
pub fn lab_to_xyz(lab: LabColor) -> XyzColor {
    let fy = (lab.l + 16.0) / 116.0;
    let fx = fy + lab.a / 500.0;
    let fz = fy - lab.b / 200.0;
    XyzColor::new(
        D65_WHITE.x * lab_f_inv(fx),
        D65_WHITE.y * lab_f_inv(fy),
        D65_WHITE.z * lab_f_inv(fz),
    )
}

/// sRGB to Lab (D65).
#[must_use]
pub fn rgb_to_lab(rgb: Rgb) -> LabColor {
    xyz_to_lab(rgb_to_xyz(rgb))
}

/// Lab to sRGB, clamped to gamut. Not rounded; use [`Rgb::to_u8`] for
/// 8-bit output.
#[must_use]
pub fn lab_to_rgb(lab: LabColor) -> Rgb {
    xyz_to_rgb(lab_to_xyz(lab))
}

#[must_use]
pub fn xyz_to_lms(xyz: XyzColor) -> LmsColor {
    let v = XYZ_TO_LMS.multiply_vec(Vec3::new(xyz.x, xyz.y, xyz.z));
    LmsColor {
        l: v.x,
        m: v.y,
        s: v.z,
    }
}

#[must_use]
pub fn lms_to_xyz(lms: LmsColor) -> XyzColor {
    let v = LMS_TO_XYZ.multiply_vec(Vec3::new(lms.l, lms.m, lms.s));
    XyzColor::new(v.x, v.y, v.z)
}

/// Full-range BT.601 YCbCr.
#[must_use]
pub fn rgb_to_ycbcr(rgb: Rgb) -> YCbCr {
    YCbCr {
        y: rgb.luma(),
        cb: 0.5f64.mul_add(
            rgb.b,
            (-0.331_264f64).mul_add(rgb.g, (-0.168_736f64).mul_add(rgb.r, 128.0)),
        ),
        cr: (-0.081_312f64).mul_add(
            rgb.b,
            (-0.418_688f64).mul_add(rgb.g, 0.5f64.mul_add(rgb.r, 128.0)),
        ),
    }
}

// ---------------------------------------------------------------------------
// Hex
// ---------------------------------------------------------------------------

/// Parse `#RRGGBB` / `RRGGBB` (case-insensitive).
///
/// # Errors
///
/// Returns [`ColorError::InvalidHex`] for anything other than six hex
/// digits after an optional `#`.
pub fn hex_to_rgb(hex: &str) -> Result<Rgb, ColorError> {
    let digits = hex.trim().strip_prefix('#').unwrap_or_else(|| hex.trim());
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ColorError::InvalidHex(hex.to_owned()));
    }
    let channel = |i: usize| {
        digits
            .get(i..i + 2)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| ColorError::InvalidHex(hex.to_owned()))
    };
    Ok(Rgb::from_u8([channel(0)?, channel(2)?, channel(4)?]))
}

/// Format as uppercase `#RRGGBB`.
#[must_use]
pub fn rgb_to_hex(rgb: Rgb) -> String {
    let mut out = String::with_capacity(7);
    out.push('#');
    for c in rgb.to_u8() {
        let _ = write!(out, "{c:02X}");
    }
    out
}

/// Parse a hex color and convert it to Lab.
///
/// # Errors
///
/// See [`hex_to_rgb`].
pub fn hex_to_lab(hex: &str) -> Result<LabColor, ColorError> {
    hex_to_rgb(hex).map(rgb_to_lab)
}

#[must_use]
pub fn lab_to_hex(lab: LabColor) -> String {
    rgb_to_hex(lab_to_rgb(lab))
}

// ---------------------------------------------------------------------------
// Lab-derived measures
// ---------------------------------------------------------------------------

#[must_use]
pub fn calculate_chroma(lab: LabColor) -> f64 {
    lab.a.hypot(lab.b)
}

/// Hue angle in degrees, `[0, 360)`.
#[must_use]
pub fn calculate_hue(lab: LabColor) -> f64 {
    hue_degrees(lab.b, lab.a)
}

fn hue_degrees(b: f64, a: f64) -> f64 {
    let h = b.atan2(a).to_degrees();
    if h < 0.0 { h + 360.0 } else { h }
}

/// Individual Typology Angle in degrees.
///
/// With `b = 0` the angle is ±90 depending on whether `L` is above 50.
#[must_use]
pub fn calculate_ita(lab: LabColor) -> f64 {
    if lab.b == 0.0 {
        return if lab.l > 50.0 { 90.0 } else { -90.0 };
    }
    ((lab.l - 50.0) / lab.b).atan().to_degrees()
}

/// CIE76 color difference.
#[must_use]
pub fn calculate_lab_distance(lab1: LabColor, lab2: LabColor) -> f64 {
    let dl = lab1.l - lab2.l;
    let da = lab1.a - lab2.a;
    let db = lab1.b - lab2.b;
    dl.mul_add(dl, da.mul_add(da, db * db)).sqrt()
}

/// CIEDE2000 color difference (Sharma, Wu & Dalal formulation), including
/// the blue-region rotation term.
#[must_use]
pub fn calculate_ciede2000(lab1: LabColor, lab2: LabColor, weights: Ciede2000Weights) -> f64 {
    const POW25_7: f64 = 6_103_515_625.0; // 25^7

    let c1 = lab1.a.hypot(lab1.b);
    let c2 = lab2.a.hypot(lab2.b);
    let c_bar7 = ((c1 + c2) / 2.0).powi(7);
    let g = 0.5 * (1.0 - (c_bar7 / (c_bar7 + POW25_7)).sqrt());

    let a1p = (1.0 + g) * lab1.a;
    let a2p = (1.0 + g) * lab2.a;
    let c1p = a1p.hypot(lab1.b);
    let c2p = a2p.hypot(lab2.b);
    let h1p = if c1p == 0.0 { 0.0 } else { hue_degrees(lab1.b, a1p) };
    let h2p = if c2p == 0.0 { 0.0 } else { hue_degrees(lab2.b, a2p) };

    let dl = lab2.l - lab1.l;
    let dc = c2p - c1p;
    let chroma_product = c1p * c2p;
    let dh_deg = if chroma_product == 0.0 {
        0.0
    } else {
        let d = h2p - h1p;
        if d > 180.0 {
            d - 360.0
        } else if d < -180.0 {
            d + 360.0
        } else {
            d
        }
    };
    let dh = 2.0 * chroma_product.sqrt() * (dh_deg.to_radians() / 2.0).sin();

    let l_bar = (lab1.l + lab2.l) / 2.0;
    let c_bar_p = (c1p + c2p) / 2.0;
    let h_bar = if chroma_product == 0.0 {
        h1p + h2p
    } else if (h1p - h2p).abs() <= 180.0 {
        (h1p + h2p) / 2.0
    } else if h1p + h2p < 360.0 {
        (h1p + h2p + 360.0) / 2.0
    } else {
        (h1p + h2p - 360.0) / 2.0
    };

    let t = 1.0 - 0.17 * (h_bar - 30.0).to_radians().cos()
        + 0.24 * (2.0 * h_bar).to_radians().cos()
        + 0.32 * (3.0f64.mul_add(h_bar, 6.0)).to_radians().cos()
        - 0.20 * (4.0f64.mul_add(h_bar, -63.0)).to_radians().cos();
    let d_theta = 30.0 * (-((h_bar - 275.0) / 25.0).powi(2)).exp();
    let c_bar_p7 = c_bar_p.powi(7);
    let r_c = 2.0 * (c_bar_p7 / (c_bar_p7 + POW25_7)).sqrt();
    let l50 = (l_bar - 50.0).powi(2);
    let s_l = 1.0 + 0.015 * l50 / (20.0 + l50).sqrt();
    let s_c = 0.045f64.mul_add(c_bar_p, 1.0);
    let s_h = (0.015 * c_bar_p).mul_add(t, 1.0);
    let r_t = -(2.0 * d_theta).to_radians().sin() * r_c;

    let tl = dl / (weights.k_l * s_l);
    let tc = dc / (weights.k_c * s_c);
    let th = dh / (weights.k_h * s_h);
    r_t.mul_add(tc * th, tl.mul_add(tl, tc.mul_add(tc, th * th)))
        .max(0.0)
        .sqrt()
}

// ---------------------------------------------------------------------------
// Chromaticity / CCT
// ---------------------------------------------------------------------------

/// xy chromaticity of an XYZ color, or `None` for black.
#[must_use]
pub fn xyz_to_chromaticity(xyz: XyzColor) -> Option<Chromaticity> {
    let sum = xyz.x + xyz.y + xyz.z;
    if !sum.is_finite() || sum <= 1e-9 {
        return None;
    }
    Some(Chromaticity {
        x: xyz.x / sum,
        y: xyz.y / sum,
    })
}

#[must_use]
pub fn rgb_to_chromaticity(rgb: Rgb) -> Option<Chromaticity> {
    xyz_to_chromaticity(rgb_to_xyz(rgb))
}

/// McCamy's cubic approximation of correlated color temperature (Kelvin).
///
/// Only meaningful near the Planckian locus; saturated colors produce
/// non-physical values (including negative or non-finite ones when `y`
/// reaches the epicenter's 0.1858), which callers must tolerate.
#[must_use]
pub fn estimate_cct(chromaticity: Chromaticity) -> f64 {
    let n = (chromaticity.x - 0.3320) / (0.1858 - chromaticity.y);
    449.0f64.mul_add(n.powi(3), 3525.0f64.mul_add(n * n, 6823.3f64.mul_add(n, 5520.33)))
}

/// CCT of an sRGB color, or `None` when it has no chromaticity or the
/// estimate is not finite.
#[must_use]
pub fn estimate_cct_from_rgb(rgb: Rgb) -> Option<f64> {
    rgb_to_chromaticity(rgb)
        .map(estimate_cct)
        .filter(|cct| cct.is_finite())
}

// ---------------------------------------------------------------------------
// Chromatic adaptation
// ---------------------------------------------------------------------------

/// Von Kries gains in LMS space mapping `source_white` onto
/// `target_white`, as a diagonal matrix.
///
/// Degenerate (zero) source cone responses map to a gain of 1.
#[must_use]
pub fn von_kries_adaptation(source_white: XyzColor, target_white: XyzColor) -> Matrix3 {
    let src = xyz_to_lms(source_white);
    let dst = xyz_to_lms(target_white);
    let gain = |d: f64, s: f64| if s.abs() <= 1e-12 { 1.0 } else { d / s };
    Matrix3::diagonal(gain(dst.l, src.l), gain(dst.m, src.m), gain(dst.s, src.s))
}

/// Full XYZ-to-XYZ von Kries transform from `source_white` to
/// `target_white`.
#[must_use]
pub fn chromatic_adaptation_matrix(source_white: XyzColor, target_white: XyzColor) -> Matrix3 {
    LMS_TO_XYZ * von_kries_adaptation(source_white, target_white) * XYZ_TO_LMS
}
