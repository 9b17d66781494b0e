//! Face-landmark boundary: the detector trait, the fixed-size landmark set,
//! and a synthetic detector used when no ML runtime is available.
//!
//! The supported face model emits [`LANDMARK_COUNT`] points per face,
//! normalized to `[0, 1]` relative to the image. Depth (`z`) uses the
//! same scale as `x`.

use serde::{Deserialize, Serialize};

use crate::geometry::{Matrix3, Point3D, Vec3};
use crate::types::RgbImageData;

/// Number of points in one face mesh.
pub const LANDMARK_COUNT: usize = 468;

/// Mesh index of the forehead center.
pub const FOREHEAD: usize = 10;
/// Mesh index of the chin.
pub const CHIN: usize = 152;
/// Mesh index of the nose tip.
pub const NOSE_TIP: usize = 1;
/// Mesh index of the nose bridge between the eyes.
pub const NOSE_BRIDGE: usize = 168;
/// Mesh index of the cheekbone on the image's left.
pub const LEFT_CHEEK: usize = 234;
/// Mesh index of the cheekbone on the image's right.
pub const RIGHT_CHEEK: usize = 454;
/// Mesh index of the outer corner of the eye on the image's left.
pub const LEFT_EYE_OUTER: usize = 33;
/// Mesh index of the outer corner of the eye on the image's right.
pub const RIGHT_EYE_OUTER: usize = 263;

/// Errors converting detector output into a [`Landmarks`] set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LandmarkError {
    #[error("expected {LANDMARK_COUNT} landmarks, got {0}")]
    WrongPointCount(usize),

    #[error("landmark {0} has a non-finite coordinate")]
    NonFinite(usize),
}

/// Errors reported by a [`LandmarkDetector`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetectorError {
    #[error("landmark runtime is unavailable")]
    Unavailable,

    #[error("landmark inference failed: {0}")]
    Inference(String),
}

/// One face as reported by a detector, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLandmarks {
    /// Points normalized to `[0, 1]` of the image width/height.
    pub points: Vec<Point3D>,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A validated landmark set in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLandmarks", into = "RawLandmarks")]
pub struct Landmarks {
    points: Box<[Point3D; LANDMARK_COUNT]>,
    confidence: f64,
}

impl Landmarks {
    /// Build from pixel-space points.
    ///
    /// # Errors
    ///
    /// Returns [`LandmarkError::WrongPointCount`] unless exactly
    /// [`LANDMARK_COUNT`] points are supplied, and
    /// [`LandmarkError::NonFinite`] for NaN/infinite coordinates.
    pub fn new(points: Vec<Point3D>, confidence: f64) -> Result<Self, LandmarkError> {
        if let Some(i) = points
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
        {
            return Err(LandmarkError::NonFinite(i));
        }
        let count = points.len();
        let points: Box<[Point3D; LANDMARK_COUNT]> = points
            .into_boxed_slice()
            .try_into()
            .map_err(|_| LandmarkError::WrongPointCount(count))?;
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Ok(Self { points, confidence })
    }

    /// Convert normalized detector output into pixel space
    /// (`x * width`, `y * height`, `z * width`).
    ///
    /// # Errors
    ///
    /// Same as [`Landmarks::new`].
    pub fn from_normalized(
        raw: &RawLandmarks,
        width: u32,
        height: u32,
    ) -> Result<Self, LandmarkError> {
        let w = f64::from(width);
        let h = f64::from(height);
        let points = raw
            .points
            .iter()
            .map(|p| Point3D::new(p.x * w, p.y * h, p.z * w))
            .collect();
        Self::new(points, raw.confidence)
    }

    #[must_use]
    pub fn points(&self) -> &[Point3D; LANDMARK_COUNT] {
        &self.points
    }

    /// The point at a mesh index. Index constants in this module are
    /// always in range.
    #[must_use]
    pub fn point(&self, index: usize) -> Point3D {
        self.points.get(index).copied().unwrap_or_default()
    }

    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }
}

impl TryFrom<RawLandmarks> for Landmarks {
    type Error = LandmarkError;

    fn try_from(raw: RawLandmarks) -> Result<Self, Self::Error> {
        Self::new(raw.points, raw.confidence)
    }
}

impl From<Landmarks> for RawLandmarks {
    fn from(landmarks: Landmarks) -> Self {
        Self {
            points: landmarks.points.to_vec(),
            confidence: landmarks.confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector boundary
// ---------------------------------------------------------------------------

/// An external face-landmark runtime.
///
/// `detect` may be slow (model inference); the pipeline treats it as the
/// one potentially long-running call.
pub trait LandmarkDetector: Send + Sync {
    /// Whether the runtime is loaded and usable.
    fn is_available(&self) -> bool;

    /// Detect zero or more faces in `image`.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError`] when the runtime cannot run inference.
    fn detect(&self, image: &RgbImageData) -> Result<Vec<RawLandmarks>, DetectorError>;

    /// Short name for logs and reports.
    fn name(&self) -> &'static str;
}

/// Confidence reported by the synthetic detector. Kept at the fallback
/// cap so synthetic faces are distinguishable from real detections.
pub const MOCK_CONFIDENCE: f64 = 0.5;

/// Synthetic detector producing one deterministic face centered in the
/// image.
///
/// The face spans 40% of the shorter image side and can be posed through
/// [`MockLandmarkDetector::with_pose`], which makes it useful for
/// exercising pose validation without a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockLandmarkDetector {
    /// Pitch, yaw, roll in radians.
    pub pose: (f64, f64, f64),
    pub confidence: f64,
}

impl Default for MockLandmarkDetector {
    fn default() -> Self {
        Self {
            pose: (0.0, 0.0, 0.0),
            confidence: MOCK_CONFIDENCE,
        }
    }
}

impl MockLandmarkDetector {
    /// A mock face rotated by the given pitch, yaw, roll (radians).
    #[must_use]
    pub fn with_pose(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self {
            pose: (pitch, yaw, roll),
            ..Self::default()
        }
    }

    /// Generate the normalized landmark set for an image of the given size.
    #[must_use]
    pub fn generate(&self, width: u32, height: u32) -> RawLandmarks {
        let (pitch, yaw, roll) = self.pose;
        let rotation =
            Matrix3::rotation_y(yaw) * Matrix3::rotation_x(pitch) * Matrix3::rotation_z(roll);
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        let scale = 0.4 * w.min(h);
        let center = Vec3::new(w / 2.0, h / 2.0, 0.0);

        let points = face_template()
            .into_iter()
            .map(|p| {
                let px = center + rotation.multiply_vec(p).scale(scale);
                Point3D::new(px.x / w, px.y / h, px.z / w)
            })
            .collect();
        RawLandmarks {
            points,
            confidence: self.confidence,
        }
    }

    /// The same face directly in pixel space.
    #[must_use]
    pub fn landmarks(&self, width: u32, height: u32) -> Landmarks {
        let raw = self.generate(width, height);
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        let points = std::array::from_fn(|i| {
            let p = raw.points.get(i).copied().unwrap_or_default();
            Point3D::new(p.x * w, p.y * h, p.z * w)
        });
        Landmarks {
            points: Box::new(points),
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }
}

impl LandmarkDetector for MockLandmarkDetector {
    fn is_available(&self) -> bool {
        true
    }

    fn detect(&self, image: &RgbImageData) -> Result<Vec<RawLandmarks>, DetectorError> {
        Ok(vec![self.generate(image.width(), image.height())])
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Detector that is always available and never finds a face.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaceDetector;

impl LandmarkDetector for NoFaceDetector {
    fn is_available(&self) -> bool {
        true
    }

    fn detect(&self, _image: &RgbImageData) -> Result<Vec<RawLandmarks>, DetectorError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "no-face"
    }
}

/// Canonical frontal face in unit space centered on the origin.
///
/// Anchor indices sit at fixed positions (forehead and cheekbones are
/// coplanar at `z = 0`); every other index is spread over an ellipse with
/// a shallow forward bulge.
fn face_template() -> Vec<Vec3> {
    const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653;
    #[allow(clippy::cast_precision_loss)]
    let n = LANDMARK_COUNT as f64;

    let mut points: Vec<Vec3> = (0..LANDMARK_COUNT)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let fi = i as f64;
            let r = ((fi + 0.5) / n).sqrt();
            let theta = fi * GOLDEN_ANGLE;
            Vec3::new(
                0.45 * r * theta.cos(),
                0.6 * r * theta.sin(),
                -0.08 * r.mul_add(-r, 1.0),
            )
        })
        .collect();

    let anchors = [
        (FOREHEAD, Vec3::new(0.0, -0.55, 0.0)),
        (CHIN, Vec3::new(0.0, 0.65, 0.0)),
        (LEFT_CHEEK, Vec3::new(-0.5, 0.0, 0.0)),
        (RIGHT_CHEEK, Vec3::new(0.5, 0.0, 0.0)),
        (LEFT_EYE_OUTER, Vec3::new(-0.3, -0.15, 0.0)),
        (RIGHT_EYE_OUTER, Vec3::new(0.3, -0.15, 0.0)),
        (NOSE_BRIDGE, Vec3::new(0.0, -0.2, -0.05)),
        (NOSE_TIP, Vec3::new(0.0, 0.15, -0.1)),
    ];
    for (index, position) in anchors {
        if let Some(slot) = points.get_mut(index) {
            *slot = position;
        }
    }
    points
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mock_generates_full_mesh_inside_image() {
        let raw = MockLandmarkDetector::default().generate(640, 480);
        assert_eq!(raw.points.len(), LANDMARK_COUNT);
        for p in &raw.points {
            assert!((0.0..=1.0).contains(&p.x), "x out of range: {}", p.x);
            assert!((0.0..=1.0).contains(&p.y), "y out of range: {}", p.y);
        }
        assert!((raw.confidence - MOCK_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn from_normalized_scales_to_pixels() {
        let raw = MockLandmarkDetector::default().generate(200, 100);
        let landmarks = Landmarks::from_normalized(&raw, 200, 100).unwrap();
        let forehead = landmarks.point(FOREHEAD);
        // Forehead sits on the vertical center line, 0.55 * scale above center.
        assert!((forehead.x - 100.0).abs() < 1e-9);
        assert!((forehead.y - (50.0 - 0.55 * 40.0)).abs() < 1e-9);
    }

    #[test]
    fn pixel_space_mock_matches_normalized_conversion() {
        let mock = MockLandmarkDetector::with_pose(0.1, -0.2, 0.05);
        let direct = mock.landmarks(320, 240);
        let converted = Landmarks::from_normalized(&mock.generate(320, 240), 320, 240).unwrap();
        for (a, b) in direct.points().iter().zip(converted.points().iter()) {
            assert!(a.distance(*b) < 1e-9);
        }
    }

    #[test]
    fn wrong_point_count_is_rejected() {
        let raw = RawLandmarks {
            points: vec![Point3D::default(); 10],
            confidence: 0.9,
        };
        assert_eq!(
            Landmarks::from_normalized(&raw, 10, 10),
            Err(LandmarkError::WrongPointCount(10)),
        );
    }

    #[test]
    fn non_finite_point_is_rejected() {
        let mut points = vec![Point3D::default(); LANDMARK_COUNT];
        points[7].y = f64::NAN;
        assert_eq!(
            Landmarks::new(points, 0.9),
            Err(LandmarkError::NonFinite(7))
        );
    }

    #[test]
    fn confidence_is_clamped() {
        let landmarks = Landmarks::new(vec![Point3D::default(); LANDMARK_COUNT], 3.0).unwrap();
        assert!((landmarks.confidence() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_face_detector_finds_nothing() {
        let image = RgbImageData::filled(4, 4, [10, 20, 30]);
        assert!(NoFaceDetector.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn landmarks_serde_round_trip() {
        let raw = MockLandmarkDetector::default().generate(64, 64);
        let landmarks = Landmarks::from_normalized(&raw, 64, 64).unwrap();
        let json = serde_json::to_string(&landmarks).unwrap();
        let back: Landmarks = serde_json::from_str(&json).unwrap();
        for (a, b) in landmarks.points().iter().zip(back.points().iter()) {
            assert!(a.distance(*b) < 1e-9);
        }
        assert!((landmarks.confidence() - back.confidence()).abs() < 1e-12);
    }
}
