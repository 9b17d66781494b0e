//! Vector, matrix, and head-pose math.
//!
//! Everything here is pure and allocation-free. Pose estimation works on
//! pixel-space landmarks (`x` right, `y` down, `z` scaled like `x`), and
//! a face looking straight into the camera has a normal of `+z`.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::landmarks::{self, Landmarks};

/// A 2D vector (or point) in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor)
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x.mul_add(other.x, self.y * other.y)
    }

    #[must_use]
    pub fn length(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Unit vector in the same direction, or zero for a zero vector.
    #[must_use]
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len <= f64::EPSILON {
            Self::default()
        } else {
            self.scale(1.0 / len)
        }
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (other - self).length()
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// A 3D vector. Landmark points use this type directly (see [`Point3D`]).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A single landmark point, either normalized to `[0, 1]` or in pixels
/// depending on where it came from.
pub type Point3D = Vec3;

impl Vec3 {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x
            .mul_add(other.x, self.y.mul_add(other.y, self.z * other.z))
    }

    #[must_use]
    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y.mul_add(other.z, -(self.z * other.y)),
            self.z.mul_add(other.x, -(self.x * other.z)),
            self.x.mul_add(other.y, -(self.y * other.x)),
        )
    }

    #[must_use]
    pub fn length(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Unit vector in the same direction, or zero for a zero vector.
    #[must_use]
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len <= f64::EPSILON {
            Self::default()
        } else {
            self.scale(1.0 / len)
        }
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (other - self).length()
    }

    /// Drop the depth component.
    #[must_use]
    pub const fn xy(self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Linear interpolation between `a` and `b`.
#[must_use]
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    (b - a).mul_add(t, a)
}

/// Clamp `value` into `[min, max]`. NaN maps to `min`.
#[must_use]
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

#[must_use]
pub fn degrees_to_radians(degrees: f64) -> f64 {
    degrees.to_radians()
}

#[must_use]
pub fn radians_to_degrees(radians: f64) -> f64 {
    radians.to_degrees()
}

// ---------------------------------------------------------------------------
// Matrix3
// ---------------------------------------------------------------------------

/// Row-major 3×3 matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix3(pub [[f64; 3]; 3]);

impl Matrix3 {
    pub const IDENTITY: Self = Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    #[must_use]
    pub const fn diagonal(a: f64, b: f64, c: f64) -> Self {
        Self([[a, 0.0, 0.0], [0.0, b, 0.0], [0.0, 0.0, c]])
    }

    /// Rotation about the x axis (pitch).
    #[must_use]
    pub fn rotation_x(radians: f64) -> Self {
        let (s, c) = radians.sin_cos();
        Self([[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]])
    }

    /// Rotation about the y axis (yaw).
    #[must_use]
    pub fn rotation_y(radians: f64) -> Self {
        let (s, c) = radians.sin_cos();
        Self([[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]])
    }

    /// Rotation about the z axis (roll).
    #[must_use]
    pub fn rotation_z(radians: f64) -> Self {
        let (s, c) = radians.sin_cos();
        Self([[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]])
    }

    #[must_use]
    pub fn multiply(&self, other: &Self) -> Self {
        let a = &self.0;
        let b = &other.0;
        Self(std::array::from_fn(|i| {
            std::array::from_fn(|j| {
                a[i][0].mul_add(b[0][j], a[i][1].mul_add(b[1][j], a[i][2] * b[2][j]))
            })
        }))
    }

    #[must_use]
    pub fn multiply_vec(&self, v: Vec3) -> Vec3 {
        let m = &self.0;
        Vec3::new(
            m[0][0].mul_add(v.x, m[0][1].mul_add(v.y, m[0][2] * v.z)),
            m[1][0].mul_add(v.x, m[1][1].mul_add(v.y, m[1][2] * v.z)),
            m[2][0].mul_add(v.x, m[2][1].mul_add(v.y, m[2][2] * v.z)),
        )
    }

    #[must_use]
    pub fn transpose(&self) -> Self {
        let m = &self.0;
        Self(std::array::from_fn(|i| std::array::from_fn(|j| m[j][i])))
    }

    #[must_use]
    pub fn determinant(&self) -> f64 {
        let m = &self.0;
        m[0][0] * m[1][1].mul_add(m[2][2], -(m[1][2] * m[2][1]))
            - m[0][1] * m[1][0].mul_add(m[2][2], -(m[1][2] * m[2][0]))
            + m[0][2] * m[1][0].mul_add(m[2][1], -(m[1][1] * m[2][0]))
    }

    /// Inverse via the adjugate. Returns `None` for (near-)singular
    /// matrices.
    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() < 1e-12 {
            return None;
        }
        let m = &self.0;
        let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| {
            m[r0][c0].mul_add(m[r1][c1], -(m[r0][c1] * m[r1][c0]))
        };
        let inv_det = 1.0 / det;
        Some(Self([
            [
                cofactor(1, 2, 1, 2) * inv_det,
                -cofactor(0, 2, 1, 2) * inv_det,
                cofactor(0, 1, 1, 2) * inv_det,
            ],
            [
                -cofactor(1, 2, 0, 2) * inv_det,
                cofactor(0, 2, 0, 2) * inv_det,
                -cofactor(0, 1, 0, 2) * inv_det,
            ],
            [
                cofactor(1, 2, 0, 1) * inv_det,
                -cofactor(0, 2, 0, 1) * inv_det,
                cofactor(0, 1, 0, 1) * inv_det,
            ],
        ]))
    }
}

impl Mul for Matrix3 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.multiply(&rhs)
    }
}

// ---------------------------------------------------------------------------
// Head pose
// ---------------------------------------------------------------------------

/// Head pose in radians.
///
/// Positive yaw turns the face toward the image's right, positive pitch
/// tilts the chin up, positive roll rotates clockwise in image space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceAngle {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl FaceAngle {
    #[must_use]
    pub const fn new(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self { pitch, yaw, roll }
    }

    /// Same angle expressed in degrees, as `(pitch, yaw, roll)`.
    #[must_use]
    pub fn to_degrees(self) -> (f64, f64, f64) {
        (
            self.pitch.to_degrees(),
            self.yaw.to_degrees(),
            self.roll.to_degrees(),
        )
    }
}

/// Gaussian falloff widths (degrees) for the frontality score.
const FRONTALITY_SIGMA_PITCH: f64 = 25.0;
const FRONTALITY_SIGMA_YAW: f64 = 25.0;
const FRONTALITY_SIGMA_ROLL: f64 = 35.0;

/// Unit normal of the plane through three points, oriented so that a
/// counter-clockwise `top -> left -> right` layout in a y-down image faces
/// `+z`.
#[must_use]
pub fn face_normal_from_triangle(top: Vec3, left: Vec3, right: Vec3) -> Vec3 {
    (right - top).cross(left - top).normalize()
}

/// Face normal from the forehead and cheekbone anchors of the mesh.
///
/// These three points stay nearly coplanar under expression changes,
/// which makes them a stable basis for pose.
#[must_use]
pub fn calculate_face_normal(landmarks: &Landmarks) -> Vec3 {
    face_normal_from_triangle(
        landmarks.point(landmarks::FOREHEAD),
        landmarks.point(landmarks::LEFT_CHEEK),
        landmarks.point(landmarks::RIGHT_CHEEK),
    )
}

/// Decompose a unit face normal into pitch and yaw.
///
/// Roll is always `0.0`: rotation about the viewing axis leaves the normal
/// unchanged, so use [`calculate_roll_from_eyes`] for it.
#[must_use]
pub fn normal_to_euler_angles(normal: Vec3) -> FaceAngle {
    let yaw = normal.x.atan2(normal.z);
    let pitch = (-normal.y).atan2(normal.x.hypot(normal.z));
    FaceAngle::new(pitch, yaw, 0.0)
}

/// Roll from the eye-to-eye vector.
///
/// `left_eye` is the eye on the image's left.
#[must_use]
pub fn calculate_roll_from_eyes(left_eye: Vec2, right_eye: Vec2) -> f64 {
    let d = right_eye - left_eye;
    d.y.atan2(d.x)
}

/// Full pose estimate: normal-derived pitch/yaw plus eye-derived roll.
#[must_use]
pub fn calculate_face_angle(landmarks: &Landmarks) -> FaceAngle {
    let mut angle = normal_to_euler_angles(calculate_face_normal(landmarks));
    angle.roll = calculate_roll_from_eyes(
        landmarks.point(landmarks::LEFT_EYE_OUTER).xy(),
        landmarks.point(landmarks::RIGHT_EYE_OUTER).xy(),
    );
    angle
}

/// How directly the face points at the camera, 0–100.
///
/// Exactly 100 at `{0, 0, 0}` and strictly decreasing in the magnitude of
/// each axis.
#[must_use]
pub fn calculate_frontality_score(angle: FaceAngle) -> f64 {
    let (pitch, yaw, roll) = angle.to_degrees();
    let exponent = (pitch / FRONTALITY_SIGMA_PITCH).powi(2)
        + (yaw / FRONTALITY_SIGMA_YAW).powi(2)
        + (roll / FRONTALITY_SIGMA_ROLL).powi(2);
    let score = 100.0 * (-0.5 * exponent).exp();
    clamp(score, 0.0, 100.0)
}
