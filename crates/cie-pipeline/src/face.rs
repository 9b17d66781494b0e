//! Stage 2: face localization.
//!
//! Runs the landmark detector, turns every candidate into a
//! [`DetectedFace`] (box, pose, frontality), picks the best one, checks
//! that it is turned toward the camera, and derives the padded region of
//! interest that later stages measure.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{FaceAngle, calculate_face_angle, calculate_frontality_score, clamp};
use crate::landmarks::{
    DetectorError, LandmarkDetector, LandmarkError, Landmarks, MockLandmarkDetector,
    RawLandmarks,
};
use crate::types::RgbImageData;

/// Largest accepted |pitch|, |yaw| or |roll|, in degrees.
pub const MAX_FACE_ANGLE_DEGREES: f64 = 20.0;

/// Area ratio at which a face earns the full size score.
const FULL_SIZE_AREA_RATIO: f64 = 0.25;
const SIZE_WEIGHT: f64 = 0.4;
const FRONTALITY_WEIGHT: f64 = 0.6;

/// An axis-aligned box in (possibly fractional) pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// An integer pixel rectangle, produced by [`normalize_bounding_box`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// The whole of a `width` x `height` image.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    #[must_use]
    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersect with a `width` x `height` image.
    #[must_use]
    pub fn clip_to(self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// One face candidate with its derived geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub landmarks: Landmarks,
    pub bounding_box: BoundingBox,
    pub angle: FaceAngle,
    /// 0–100, see [`calculate_frontality_score`].
    pub frontality_score: f64,
    /// Detector confidence, 0–1.
    pub confidence: f64,
}

/// Outcome of [`validate_face_angle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleValidation {
    pub is_valid: bool,
    /// Always non-empty; either guidance or a confirmation.
    pub feedback: String,
}

/// The selected face and where later stages should look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub face: DetectedFace,
    /// Number of usable candidates the detector reported.
    pub face_count: usize,
    /// Padded face box, clamped to the image.
    pub roi: PixelRect,
}

/// Everything stage 2 can conclude about an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FaceLocalization {
    Detected(FaceDetection),
    NoFace,
    /// Several candidates, none with non-zero confidence.
    Ambiguous {
        face_count: usize,
    },
    /// A face was found but is turned too far away.
    AngleInvalid {
        detection: FaceDetection,
        feedback: String,
    },
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Min/max box around all landmarks.
#[must_use]
pub fn calculate_bounding_box(landmarks: &Landmarks) -> BoundingBox {
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in landmarks.points() {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    BoundingBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x,
        height: max_y - min_y,
    }
}

/// Derive box, pose and frontality for a validated landmark set.
#[must_use]
pub fn face_from_landmarks(landmarks: Landmarks) -> DetectedFace {
    let angle = calculate_face_angle(&landmarks);
    DetectedFace {
        bounding_box: calculate_bounding_box(&landmarks),
        frontality_score: calculate_frontality_score(angle),
        confidence: landmarks.confidence(),
        angle,
        landmarks,
    }
}

/// Convert one detector candidate into a [`DetectedFace`].
///
/// # Errors
///
/// Propagates [`LandmarkError`] for malformed candidates.
pub fn build_detected_face(
    raw: &RawLandmarks,
    width: u32,
    height: u32,
) -> Result<DetectedFace, LandmarkError> {
    Landmarks::from_normalized(raw, width, height).map(face_from_landmarks)
}

/// Pick the face to analyze.
///
/// Scores each face by `0.4 * size + 0.6 * frontality`, where the size
/// score reaches 100 once the box covers a quarter of the image. Equal
/// scores go to the larger face.
#[must_use]
pub fn select_best_face(faces: &[DetectedFace], width: u32, height: u32) -> Option<&DetectedFace> {
    let image_area = f64::from(width) * f64::from(height);
    let score = |face: &DetectedFace| {
        let ratio = if image_area > 0.0 {
            face.bounding_box.area() / image_area
        } else {
            0.0
        };
        let size_score = (ratio / FULL_SIZE_AREA_RATIO).min(1.0) * 100.0;
        SIZE_WEIGHT.mul_add(size_score, FRONTALITY_WEIGHT * face.frontality_score)
    };
    faces.iter().max_by(|a, b| {
        score(a).total_cmp(&score(b)).then_with(|| {
            a.bounding_box
                .area()
                .total_cmp(&b.bounding_box.area())
        })
    })
}

/// Check that the face is within [`MAX_FACE_ANGLE_DEGREES`] on every axis.
#[must_use]
pub fn validate_face_angle(angle: FaceAngle) -> AngleValidation {
    let (pitch, yaw, roll) = angle.to_degrees();
    let mut problems = Vec::new();
    if yaw.abs() > MAX_FACE_ANGLE_DEGREES {
        let side = if yaw > 0.0 { "right" } else { "left" };
        problems.push(format!(
            "face is turned {side} by {:.0}°; look straight at the camera",
            yaw.abs()
        ));
    }
    if pitch.abs() > MAX_FACE_ANGLE_DEGREES {
        let dir = if pitch > 0.0 { "up" } else { "down" };
        problems.push(format!(
            "face is tilted {dir} by {:.0}°; keep your chin level",
            pitch.abs()
        ));
    }
    if roll.abs() > MAX_FACE_ANGLE_DEGREES {
        problems.push(format!(
            "head is tilted sideways by {:.0}°; keep your head upright",
            roll.abs()
        ));
    }

    if problems.is_empty() {
        AngleValidation {
            is_valid: true,
            feedback: "face angle is good".to_owned(),
        }
    } else {
        AngleValidation {
            is_valid: false,
            feedback: problems.join("; "),
        }
    }
}

/// Snap a fractional box outward to whole pixels and clamp it to the
/// image. Non-finite coordinates collapse to the image origin.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn normalize_bounding_box(bbox: BoundingBox, width: u32, height: u32) -> PixelRect {
    let w = f64::from(width);
    let h = f64::from(height);
    let x0 = clamp(bbox.x.floor(), 0.0, w);
    let y0 = clamp(bbox.y.floor(), 0.0, h);
    let x1 = clamp((bbox.x + bbox.width).ceil(), x0, w);
    let y1 = clamp((bbox.y + bbox.height).ceil(), y0, h);
    PixelRect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    }
}

/// Grow the box by `padding` (a fraction of its size) on every side,
/// then normalize it.
#[must_use]
pub fn get_padded_bounding_box(
    bbox: BoundingBox,
    padding: f64,
    width: u32,
    height: u32,
) -> PixelRect {
    let padding = if padding.is_finite() { padding.max(0.0) } else { 0.0 };
    let pad_x = bbox.width * padding;
    let pad_y = bbox.height * padding;
    normalize_bounding_box(
        BoundingBox {
            x: bbox.x - pad_x,
            y: bbox.y - pad_y,
            width: 2.0f64.mul_add(pad_x, bbox.width),
            height: 2.0f64.mul_add(pad_y, bbox.height),
        },
        width,
        height,
    )
}

/// Copy the pixels under `rect` (clipped to the image) into a new image.
/// Regions entirely outside the image yield a zero-area image.
#[must_use]
pub fn extract_region_from_image(image: &RgbImageData, rect: PixelRect) -> RgbImageData {
    let rect = rect.clip_to(image.width(), image.height());
    RgbImageData::from_fn(rect.width, rect.height, |x, y| {
        image.pixel(rect.x + x, rect.y + y).unwrap_or_default()
    })
}

// ---------------------------------------------------------------------------
// Stage 2
// ---------------------------------------------------------------------------

/// Run the detector and localize the face to analyze.
///
/// Candidates with malformed landmark sets are dropped. When every
/// remaining candidate has zero confidence the result is
/// [`FaceLocalization::Ambiguous`].
///
/// # Errors
///
/// Returns the detector's error when inference itself fails.
pub fn localize_face(
    image: &RgbImageData,
    detector: &dyn LandmarkDetector,
    padding: f64,
) -> Result<FaceLocalization, DetectorError> {
    let (width, height) = (image.width(), image.height());
    let raw = detector.detect(image)?;

    let faces: Vec<DetectedFace> = raw
        .iter()
        .enumerate()
        .filter_map(|(i, candidate)| match build_detected_face(candidate, width, height) {
            Ok(face) => Some(face),
            Err(e) => {
                debug!(candidate = i, error = %e, "dropping malformed face candidate");
                None
            }
        })
        .collect();
    let face_count = faces.len();
    debug!(detector = detector.name(), face_count, "face candidates");

    if faces.is_empty() {
        return Ok(FaceLocalization::NoFace);
    }
    let confident: Vec<DetectedFace> = faces.into_iter().filter(|f| f.confidence > 0.0).collect();
    let Some(best) = select_best_face(&confident, width, height) else {
        return Ok(FaceLocalization::Ambiguous { face_count });
    };

    let detection = FaceDetection {
        roi: get_padded_bounding_box(best.bounding_box, padding, width, height),
        face: best.clone(),
        face_count,
    };
    let validation = validate_face_angle(detection.face.angle);
    if validation.is_valid {
        Ok(FaceLocalization::Detected(detection))
    } else {
        Ok(FaceLocalization::AngleInvalid {
            detection,
            feedback: validation.feedback,
        })
    }
}

/// A synthetic frontal face for fallback results.
#[must_use]
pub fn generate_mock_face(width: u32, height: u32, padding: f64) -> FaceDetection {
    let face = face_from_landmarks(MockLandmarkDetector::default().landmarks(width, height));
    FaceDetection {
        roi: get_padded_bounding_box(face.bounding_box, padding, width, height),
        face,
        face_count: 1,
    }
}
