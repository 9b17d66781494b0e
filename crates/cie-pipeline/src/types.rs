//! Shared types for the CIE analysis pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::white_balance::WhiteBalanceMethod;

/// Re-export `RgbImage` so downstream crates can hand decoded images to
/// the pipeline without depending on `image` directly.
pub use image::RgbImage;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// An interleaved 8-bit RGB image.
///
/// The buffer always holds exactly `width * height * 3` bytes. Stages
/// never mutate an image they are given; corrections produce a new
/// value.
///
/// A zero-area image is representable (region extraction can yield one)
/// but the pipeline rejects it as input.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RgbImageProxy")]
pub struct RgbImageData {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// Unvalidated serde form of [`RgbImageData`].
#[derive(Deserialize)]
struct RgbImageProxy {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl TryFrom<RgbImageProxy> for RgbImageData {
    type Error = PipelineError;

    fn try_from(proxy: RgbImageProxy) -> Result<Self, Self::Error> {
        Self::new(proxy.width, proxy.height, proxy.data)
    }
}

impl RgbImageData {
    /// Number of interleaved channels.
    pub const CHANNELS: usize = 3;

    /// Wrap an interleaved RGB buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidImage`] if `data.len()` does not
    /// equal `width * height * 3`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PipelineError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(Self::CHANNELS));
        if expected != Some(data.len()) {
            return Err(PipelineError::InvalidImage(format!(
                "buffer holds {} bytes, {width}x{height} RGB needs {}",
                data.len(),
                expected.map_or_else(|| "more than usize::MAX".to_owned(), |n| n.to_string()),
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// A uniformly colored image.
    #[must_use]
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * Self::CHANNELS);
        for _ in 0..count {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    /// An image generated per pixel.
    #[must_use]
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * Self::CHANNELS);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y));
            }
        }
        Self {
            data,
            width,
            height,
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Always [`Self::CHANNELS`].
    #[must_use]
    pub const fn channels(&self) -> usize {
        Self::CHANNELS
    }

    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// Returns `true` when the image has no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// The raw interleaved bytes.
    #[must_use]
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Iterate over pixels in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = [u8; 3]> + '_ {
        self.data
            .chunks_exact(Self::CHANNELS)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// The pixel at `(x, y)`, or `None` outside the image.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        self.data.get(i..i + Self::CHANNELS).map(|p| [p[0], p[1], p[2]])
    }

    /// Apply a per-channel mapping to every pixel, producing a new image.
    #[must_use]
    pub fn map_channels(&self, luts: &[[u8; 256]; 3]) -> Self {
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &v)| luts[i % Self::CHANNELS][usize::from(v)])
            .collect();
        Self {
            data,
            width: self.width,
            height: self.height,
        }
    }

    /// Copy into an `image` crate buffer.
    #[must_use]
    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

impl From<RgbImage> for RgbImageData {
    fn from(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }
}

impl fmt::Debug for RgbImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RgbImageData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A stage of the pipeline state machine.
///
/// Ordering follows execution order, so sets and maps keyed by stage
/// iterate in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Quality gate.
    Cie1,
    /// Face localization.
    Cie2,
    /// White balance correction.
    Cie3,
    /// Lighting quality score.
    Cie4,
    /// All enabled stages finished.
    Complete,
    /// Terminal failure.
    Failed,
}

impl PipelineStage {
    /// The four processing stages in execution order.
    pub const PROCESSING: [Self; 4] = [Self::Cie1, Self::Cie2, Self::Cie3, Self::Cie4];

    /// Progress percentage reported once this stage has finished.
    /// `Failed` never reports progress.
    #[must_use]
    pub const fn progress_percent(self) -> Option<u8> {
        match self {
            Self::Cie1 => Some(25),
            Self::Cie2 => Some(50),
            Self::Cie3 => Some(75),
            Self::Cie4 => Some(90),
            Self::Complete => Some(100),
            Self::Failed => None,
        }
    }

    /// Human-readable stage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cie1 => "Quality Gate",
            Self::Cie2 => "Face Localization",
            Self::Cie3 => "White Balance",
            Self::Cie4 => "Lighting Score",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cie1 => "cie1",
            Self::Cie2 => "cie2",
            Self::Cie3 => "cie3",
            Self::Cie4 => "cie4",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Why a pipeline run ended in [`PipelineStage::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Stage 1 score below threshold with `continue_on_quality_fail` off.
    #[error("image quality too low (score {score:.1} < {threshold:.1})")]
    QualityRejected { score: f64, threshold: f64 },

    /// Stage 2 found no usable face.
    #[error("no face detected")]
    NoFaceDetected,

    /// Several faces, none with non-zero confidence.
    #[error("{face_count} faces detected but none with usable confidence")]
    AmbiguousFace { face_count: usize },

    /// The best face is turned too far from the camera.
    #[error("face angle out of range: {feedback}")]
    AngleOutOfRange { feedback: String },

    /// Not enough image signal to estimate the illuminant.
    #[error("insufficient signal: {0}")]
    InsufficientSignal(String),

    /// The run exceeded its time budget.
    #[error("pipeline timed out after {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    /// The input violated a precondition (zero area, bad buffer).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other unexpected failure.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Per-invocation pipeline configuration.
///
/// The progress hook is not part of the options: register a
/// [`ProgressObserver`](crate::pipeline::ProgressObserver) on
/// [`CiePipeline`](crate::pipeline::CiePipeline) instead, so the options
/// stay plain serializable data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Skip stage 1 (quality gate).
    pub skip_quality_check: bool,

    /// Skip stage 3 (white balance correction).
    pub skip_awb_correction: bool,

    /// Skip stage 4 (lighting score).
    pub skip_lighting_analysis: bool,

    /// When stage 1 rejects the image, record the rejection and keep
    /// going instead of failing the run.
    pub continue_on_quality_fail: bool,

    /// Minimum stage 1 overall score (0–100) for an acceptable image.
    pub quality_threshold: f64,

    /// White balance method used by stage 3.
    pub awb_method: WhiteBalanceMethod,

    /// Padding around the face bounding box, as a fraction of its size,
    /// used for the region of interest.
    pub roi_padding: f64,
}

impl PipelineOptions {
    /// Default minimum stage 1 score.
    pub const DEFAULT_QUALITY_THRESHOLD: f64 = 50.0;
    /// Default white balance method.
    pub const DEFAULT_AWB_METHOD: WhiteBalanceMethod = WhiteBalanceMethod::SkinAware;
    /// Default face ROI padding.
    pub const DEFAULT_ROI_PADDING: f64 = 0.2;
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_quality_check: false,
            skip_awb_correction: false,
            skip_lighting_analysis: false,
            continue_on_quality_fail: false,
            quality_threshold: Self::DEFAULT_QUALITY_THRESHOLD,
            awb_method: Self::DEFAULT_AWB_METHOD,
            roi_padding: Self::DEFAULT_ROI_PADDING,
        }
    }
}

/// Errors from the library's fallible entry points (decoding, buffer
/// validation). Pipeline runs themselves never return these; they report
/// a [`RejectionReason`] instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The pixel buffer does not match its declared dimensions.
    #[error("invalid image buffer: {0}")]
    InvalidImage(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- RgbImageData tests ---

    #[test]
    fn new_rejects_mismatched_buffer() {
        let result = RgbImageData::new(2, 2, vec![0; 11]);
        assert!(matches!(result, Err(PipelineError::InvalidImage(_))));
    }

    #[test]
    fn new_accepts_exact_buffer() {
        let image = RgbImageData::new(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(image.pixel(1, 0), Some([4, 5, 6]));
        assert_eq!(image.pixel(2, 0), None);
        assert_eq!(image.channels(), 3);
    }

    #[test]
    fn zero_area_image_is_empty() {
        let image = RgbImageData::new(0, 5, Vec::new()).unwrap();
        assert!(image.is_empty());
        assert_eq!(image.pixel_count(), 0);
    }

    #[test]
    fn filled_and_pixels() {
        let image = RgbImageData::filled(3, 2, [9, 8, 7]);
        assert_eq!(image.as_raw().len(), 18);
        assert!(image.pixels().all(|p| p == [9, 8, 7]));
    }

    #[test]
    fn map_channels_returns_new_image() {
        let image = RgbImageData::filled(2, 2, [10, 20, 30]);
        let mut luts = [[0u8; 256]; 3];
        for (c, lut) in luts.iter_mut().enumerate() {
            for (v, out) in lut.iter_mut().enumerate() {
                *out = u8::try_from((v + c) % 256).unwrap();
            }
        }
        let mapped = image.map_channels(&luts);
        assert!(mapped.pixels().all(|p| p == [10, 21, 32]));
        assert!(image.pixels().all(|p| p == [10, 20, 30]));
    }

    #[test]
    fn rgb_image_conversion_round_trip() {
        let image = RgbImageData::from_fn(4, 3, |x, y| {
            [u8::try_from(x).unwrap(), u8::try_from(y).unwrap(), 0]
        });
        let back = RgbImageData::from(image.to_rgb_image());
        assert_eq!(image, back);
    }

    #[test]
    fn deserialize_validates_buffer() {
        let bad = r#"{"data":[1,2,3],"width":2,"height":2}"#;
        assert!(serde_json::from_str::<RgbImageData>(bad).is_err());
        let good = r#"{"data":[1,2,3],"width":1,"height":1}"#;
        assert!(serde_json::from_str::<RgbImageData>(good).is_ok());
    }

    // --- PipelineStage tests ---

    #[test]
    fn stage_display_and_serde_names_match() {
        for stage in PipelineStage::PROCESSING {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{stage}\""));
        }
    }

    #[test]
    fn stage_progress_is_monotonic() {
        let mut last = 0;
        for stage in PipelineStage::PROCESSING
            .into_iter()
            .chain([PipelineStage::Complete])
        {
            let p = stage.progress_percent().unwrap();
            assert!(p > last);
            last = p;
        }
        assert_eq!(last, 100);
        assert!(PipelineStage::Failed.progress_percent().is_none());
    }

    // --- Options tests ---

    #[test]
    fn options_defaults() {
        let options = PipelineOptions::default();
        assert!(!options.skip_quality_check);
        assert!(!options.skip_awb_correction);
        assert!(!options.skip_lighting_analysis);
        assert!(!options.continue_on_quality_fail);
        assert!((options.quality_threshold - 50.0).abs() < f64::EPSILON);
        assert_eq!(options.awb_method, WhiteBalanceMethod::SkinAware);
    }

    #[test]
    fn options_partial_json_fills_defaults() {
        let options: PipelineOptions =
            serde_json::from_str(r#"{"skip_quality_check":true}"#).unwrap();
        assert!(options.skip_quality_check);
        assert_eq!(
            PipelineOptions {
                skip_quality_check: false,
                ..options
            },
            PipelineOptions::default(),
        );
    }

    // --- RejectionReason tests ---

    #[test]
    fn rejection_reason_display() {
        assert_eq!(RejectionReason::NoFaceDetected.to_string(), "no face detected");
        assert_eq!(
            RejectionReason::Timeout { budget_ms: 5 }.to_string(),
            "pipeline timed out after 5 ms",
        );
    }

    #[test]
    fn rejection_reason_serde_is_tagged() {
        let reason = RejectionReason::AmbiguousFace { face_count: 3 };
        let json = serde_json::to_string(&reason).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"ambiguous_face","detail":{"face_count":3}}"#
        );
        let json = serde_json::to_string(&RejectionReason::InternalError("boom".into())).unwrap();
        let back: RejectionReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RejectionReason::InternalError("boom".into()));
    }
}
