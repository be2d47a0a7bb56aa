// Planar geometry for the drivebase
//
// Conventions: x forward, y left, angles counter-clockwise positive, radians.
// Pose2d::exp / Pose2d::log are the SE(2) exponential and logarithm maps.

use std::f64::consts::{PI, TAU};
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Below this, exp/log switch to their Taylor expansions
const SMALL_ANGLE_EPS: f64 = 1e-9;

/// A planar rotation. The angle is continuous; use `wrapped()` to compare.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rotation2d {
    radians: f64,
}

impl Rotation2d {
    pub const ZERO: Rotation2d = Rotation2d { radians: 0.0 };

    pub const fn from_radians(radians: f64) -> Self {
        Self { radians }
    }

    pub fn from_degrees(degrees: f64) -> Self {
        Self::from_radians(degrees.to_radians())
    }

    /// Rotation pointing along the vector (x, y)
    pub fn from_vector(x: f64, y: f64) -> Self {
        Self::from_radians(y.atan2(x))
    }

    pub fn radians(&self) -> f64 {
        self.radians
    }

    pub fn degrees(&self) -> f64 {
        self.radians.to_degrees()
    }

    pub fn cos(&self) -> f64 {
        self.radians.cos()
    }

    pub fn sin(&self) -> f64 {
        self.radians.sin()
    }

    /// Equivalent angle in (-PI, PI]
    pub fn wrapped(&self) -> Self {
        let mut a = self.radians.rem_euclid(TAU);
        if a > PI {
            a -= TAU;
        }
        Self::from_radians(a)
    }

    /// Shortest-path interpolation toward `end`
    pub fn interpolate(&self, end: Rotation2d, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        *self + (end - *self).wrapped() * t
    }

    pub fn is_finite(&self) -> bool {
        self.radians.is_finite()
    }
}

impl Add for Rotation2d {
    type Output = Rotation2d;
    fn add(self, rhs: Rotation2d) -> Rotation2d {
        Rotation2d::from_radians(self.radians + rhs.radians)
    }
}

impl Sub for Rotation2d {
    type Output = Rotation2d;
    fn sub(self, rhs: Rotation2d) -> Rotation2d {
        Rotation2d::from_radians(self.radians - rhs.radians)
    }
}

impl Neg for Rotation2d {
    type Output = Rotation2d;
    fn neg(self) -> Rotation2d {
        Rotation2d::from_radians(-self.radians)
    }
}

impl Mul<f64> for Rotation2d {
    type Output = Rotation2d;
    fn mul(self, rhs: f64) -> Rotation2d {
        Rotation2d::from_radians(self.radians * rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Translation2d {
    pub x: f64,
    pub y: f64,
}

impl Translation2d {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn rotate_by(&self, rotation: Rotation2d) -> Self {
        let (sin, cos) = rotation.radians().sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    pub fn interpolate(&self, end: Translation2d, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        *self + (end - *self) * t
    }
}

impl Add for Translation2d {
    type Output = Translation2d;
    fn add(self, rhs: Translation2d) -> Translation2d {
        Translation2d::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Translation2d {
    type Output = Translation2d;
    fn sub(self, rhs: Translation2d) -> Translation2d {
        Translation2d::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Translation2d {
    type Output = Translation2d;
    fn mul(self, rhs: f64) -> Translation2d {
        Translation2d::new(self.x * rhs, self.y * rhs)
    }
}

/// An infinitesimal pose delta in the body frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist2d {
    pub const fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }
}

/// Robot pose in the field frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2d {
    pub x: f64,
    pub y: f64,
    pub heading: Rotation2d,
}

impl Pose2d {
    pub const IDENTITY: Pose2d = Pose2d {
        x: 0.0,
        y: 0.0,
        heading: Rotation2d::ZERO,
    };

    pub const fn new(x: f64, y: f64, heading: Rotation2d) -> Self {
        Self { x, y, heading }
    }

    pub fn from_parts(translation: Translation2d, heading: Rotation2d) -> Self {
        Self::new(translation.x, translation.y, heading)
    }

    pub fn translation(&self) -> Translation2d {
        Translation2d::new(self.x, self.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.heading.is_finite()
    }

    /// Applies a body-frame transform (translation, rotation) to this pose
    pub fn transform_by(&self, translation: Translation2d, rotation: Rotation2d) -> Self {
        Self::from_parts(
            self.translation() + translation.rotate_by(self.heading),
            self.heading + rotation,
        )
    }

    /// `other` expressed in this pose's frame
    pub fn relative_to(&self, other: &Pose2d) -> Pose2d {
        let translation = (other.translation() - self.translation()).rotate_by(-self.heading);
        Pose2d::from_parts(translation, other.heading - self.heading)
    }

    /// Follows `twist` as a constant-curvature arc starting from this pose
    pub fn exp(&self, twist: &Twist2d) -> Pose2d {
        let Twist2d { dx, dy, dtheta } = *twist;
        let (sin_theta, cos_theta) = dtheta.sin_cos();

        let (s, c) = if dtheta.abs() < SMALL_ANGLE_EPS {
            (1.0 - dtheta * dtheta / 6.0, 0.5 * dtheta)
        } else {
            (sin_theta / dtheta, (1.0 - cos_theta) / dtheta)
        };

        let translation = Translation2d::new(dx * s - dy * c, dx * c + dy * s);
        self.transform_by(translation, Rotation2d::from_radians(dtheta))
    }

    /// The twist that carries this pose onto `end` along a single arc
    pub fn log(&self, end: &Pose2d) -> Twist2d {
        let transform = self.relative_to(end);
        let dtheta = transform.heading.wrapped().radians();
        let half_dtheta = 0.5 * dtheta;
        let cos_minus_one = dtheta.cos() - 1.0;

        let half_theta_by_tan_of_half_dtheta = if cos_minus_one.abs() < SMALL_ANGLE_EPS {
            1.0 - dtheta * dtheta / 12.0
        } else {
            -(half_dtheta * dtheta.sin()) / cos_minus_one
        };

        // Complex multiply by (factor, -dtheta/2): rotate and scale in one step
        let Translation2d { x, y } = transform.translation();
        let h = half_theta_by_tan_of_half_dtheta;
        Twist2d::new(x * h + y * half_dtheta, y * h - x * half_dtheta, dtheta)
    }
}

/// Orientation reported by an inertial sensor, radians
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Orientation {
    pub const fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }

    pub fn yaw_rotation(&self) -> Rotation2d {
        Rotation2d::from_radians(self.yaw)
    }
}

impl Sub for Orientation {
    type Output = Orientation;
    fn sub(self, rhs: Orientation) -> Orientation {
        Orientation::new(self.yaw - rhs.yaw, self.pitch - rhs.pitch, self.roll - rhs.roll)
    }
}
