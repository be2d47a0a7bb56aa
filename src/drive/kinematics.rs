// Swerve kinematics for the four-module base
// Converts chassis velocities (vx, vy, omega) to per-module (speed, angle) and back.
//
// Each module i at offset (x_i, y_i) from robot center contributes two rows:
//   v_ix = vx - omega * y_i
//   v_iy = vy + omega * x_i
// The inverse is the least-squares solution of the same 8x3 system.

use std::f64::consts::PI;

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use super::{DriveError, MODULE_COUNT};
use crate::geometry::{Rotation2d, Translation2d, Twist2d};

/// Below this determinant the normal matrix is treated as singular
const SINGULAR_EPS: f64 = 1e-9;

/// Two rows (x and y wheel velocity) per module
const WHEEL_ROWS: usize = 2 * MODULE_COUNT;

type ForwardMatrix = SMatrix<f64, WHEEL_ROWS, 3>;
type InverseMatrix = SMatrix<f64, 3, WHEEL_ROWS>;
type WheelVector = SVector<f64, WHEEL_ROWS>;

/// Robot-frame chassis velocity. Linear in m/s, angular in rad/s.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChassisVelocity {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

impl ChassisVelocity {
    pub const fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Converts a field-frame command into the robot frame given the robot heading
    pub fn from_field_relative(field: ChassisVelocity, robot_heading: Rotation2d) -> Self {
        let robot = Translation2d::new(field.vx, field.vy).rotate_by(-robot_heading);
        Self::new(robot.x, robot.y, field.omega)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.vx * factor, self.vy * factor, self.omega * factor)
    }

    pub fn translational_speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }

    pub fn is_finite(&self) -> bool {
        self.vx.is_finite() && self.vy.is_finite() && self.omega.is_finite()
    }
}

/// Module speed (m/s) and steering angle
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    pub speed: f64,
    pub angle: Rotation2d,
}

impl ModuleState {
    pub const fn new(speed: f64, angle: Rotation2d) -> Self {
        Self { speed, angle }
    }

    /// Shortest-path equivalent of this state given the module's current angle.
    /// If the module would need to turn more than 90 degrees, drive backwards
    /// and aim 180 degrees away instead.
    pub fn optimize(&self, current_angle: Rotation2d) -> Self {
        let delta = (self.angle - current_angle).wrapped();
        if delta.radians().abs() > PI / 2.0 {
            Self::new(-self.speed, (self.angle + Rotation2d::from_radians(PI)).wrapped())
        } else {
            Self::new(self.speed, self.angle.wrapped())
        }
    }
}

/// Cumulative drive distance (m) and steering angle, the odometry input
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModulePosition {
    pub distance: f64,
    pub angle: Rotation2d,
}

impl ModulePosition {
    pub const fn new(distance: f64, angle: Rotation2d) -> Self {
        Self { distance, angle }
    }

    pub fn interpolate(&self, end: &ModulePosition, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.distance + (end.distance - self.distance) * t,
            self.angle.interpolate(end.angle, t),
        )
    }
}

/// Fixed-geometry kinematics for four modules
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    offsets: [Translation2d; MODULE_COUNT],
    forward: ForwardMatrix,
    inverse: InverseMatrix,
}

impl SwerveKinematics {
    /// Build kinematics from module offsets relative to robot center.
    ///
    /// Fails if an offset is not finite or if the offsets cannot observe
    /// rotation (every module at the same point).
    pub fn new(offsets: [Translation2d; MODULE_COUNT]) -> Result<Self, DriveError> {
        let mut forward = ForwardMatrix::zeros();

        for (i, offset) in offsets.iter().enumerate() {
            if !offset.x.is_finite() || !offset.y.is_finite() {
                return Err(DriveError::NonFiniteOffset { index: i });
            }
            forward[(2 * i, 0)] = 1.0;
            forward[(2 * i, 2)] = -offset.y;
            forward[(2 * i + 1, 1)] = 1.0;
            forward[(2 * i + 1, 2)] = offset.x;
        }

        // Least squares: (M^T M)^-1 M^T
        let transpose = forward.transpose();
        let normal: Matrix3<f64> = transpose * forward;
        if normal.determinant().abs() < SINGULAR_EPS {
            return Err(DriveError::DegenerateGeometry);
        }
        let normal_inverse = normal.try_inverse().ok_or(DriveError::DegenerateGeometry)?;

        Ok(Self {
            offsets,
            forward,
            inverse: normal_inverse * transpose,
        })
    }

    pub fn offsets(&self) -> &[Translation2d; MODULE_COUNT] {
        &self.offsets
    }

    /// Inverse kinematics: chassis velocity -> module states
    pub fn to_wheel_vectors(&self, velocity: &ChassisVelocity) -> [ModuleState; MODULE_COUNT] {
        let wheels: WheelVector =
            self.forward * Vector3::new(velocity.vx, velocity.vy, velocity.omega);

        std::array::from_fn(|i| {
            let (x, y) = (wheels[2 * i], wheels[2 * i + 1]);
            ModuleState::new(x.hypot(y), Rotation2d::from_vector(x, y))
        })
    }

    /// Forward kinematics: module states -> chassis velocity (least squares)
    pub fn to_chassis_velocity(&self, states: &[ModuleState; MODULE_COUNT]) -> ChassisVelocity {
        let wheels = WheelVector::from_fn(|row, _| {
            let state = &states[row / 2];
            if row % 2 == 0 {
                state.speed * state.angle.cos()
            } else {
                state.speed * state.angle.sin()
            }
        });

        let chassis = self.inverse * wheels;
        ChassisVelocity::new(chassis[0], chassis[1], chassis[2])
    }

    /// Chassis displacement between two sets of module positions
    pub fn to_twist(
        &self,
        start: &[ModulePosition; MODULE_COUNT],
        end: &[ModulePosition; MODULE_COUNT],
    ) -> Twist2d {
        let wheels = WheelVector::from_fn(|row, _| {
            let i = row / 2;
            let delta = end[i].distance - start[i].distance;
            if row % 2 == 0 {
                delta * end[i].angle.cos()
            } else {
                delta * end[i].angle.sin()
            }
        });

        let chassis = self.inverse * wheels;
        Twist2d::new(chassis[0], chassis[1], chassis[2])
    }
}

/// Scale module speeds down uniformly so that no wheel exceeds `absolute_max`
/// and the commanded velocity stays within the translational and rotational
/// limits. Only the magnitude changes; direction and wheel ratios are kept.
/// A non-positive translational or rotational limit disables that check.
pub fn desaturate(
    states: &mut [ModuleState; MODULE_COUNT],
    current_velocity: &ChassisVelocity,
    absolute_max: f64,
    max_translational: f64,
    max_rotational: f64,
) {
    let fastest = states.iter().map(|s| s.speed.abs()).fold(0.0f64, f64::max);
    if fastest <= f64::EPSILON {
        return;
    }

    let mut scale = (absolute_max.max(0.0) / fastest).min(1.0);

    if max_translational > 0.0 && max_rotational > 0.0 {
        let translational_k = current_velocity.translational_speed() / max_translational;
        let rotational_k = current_velocity.omega.abs() / max_rotational;
        let k = translational_k.max(rotational_k);
        if k > 1.0 {
            scale = scale.min(1.0 / k);
        }
    }

    if scale < 1.0 {
        for state in states.iter_mut() {
            state.speed *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_TRACK: f64 = 0.3;

    fn square_kinematics() -> SwerveKinematics {
        SwerveKinematics::new([
            Translation2d::new(HALF_TRACK, HALF_TRACK),
            Translation2d::new(HALF_TRACK, -HALF_TRACK),
            Translation2d::new(-HALF_TRACK, HALF_TRACK),
            Translation2d::new(-HALF_TRACK, -HALF_TRACK),
        ])
        .unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_forward_motion() {
        let kinematics = square_kinematics();
        let states = kinematics.to_wheel_vectors(&ChassisVelocity::new(1.0, 0.0, 0.0));
        for state in &states {
            assert!(close(state.speed, 1.0), "speed {}", state.speed);
            assert!(close(state.angle.radians(), 0.0), "angle {:?}", state.angle);
        }
    }

    #[test]
    fn test_rotation_only() {
        // Pure rotation points every wheel tangent to the circle through it
        let kinematics = square_kinematics();
        let states = kinematics.to_wheel_vectors(&ChassisVelocity::new(0.0, 0.0, 1.0));
        let radius = HALF_TRACK * 2f64.sqrt();

        for (state, offset) in states.iter().zip(kinematics.offsets()) {
            assert!(close(state.speed, radius));
            let radial = Rotation2d::from_vector(offset.x, offset.y);
            let diff = (state.angle - radial).wrapped().degrees();
            assert!(close(diff, 90.0), "wheel not tangent: {}", diff);
        }
    }

    #[test]
    fn test_round_trip() {
        let kinematics = square_kinematics();
        let velocities = [
            ChassisVelocity::new(1.0, 0.0, 0.0),
            ChassisVelocity::new(-0.5, 2.0, 0.0),
            ChassisVelocity::new(0.0, 0.0, -3.0),
            ChassisVelocity::new(1.2, -0.7, 2.5),
        ];

        for velocity in velocities {
            let states = kinematics.to_wheel_vectors(&velocity);
            let recovered = kinematics.to_chassis_velocity(&states);
            assert!(close(recovered.vx, velocity.vx), "{:?} -> {:?}", velocity, recovered);
            assert!(close(recovered.vy, velocity.vy), "{:?} -> {:?}", velocity, recovered);
            assert!(close(recovered.omega, velocity.omega), "{:?} -> {:?}", velocity, recovered);
        }
    }

    #[test]
    fn test_twist_from_positions() {
        let kinematics = square_kinematics();
        let start = [ModulePosition::default(); MODULE_COUNT];
        let end = [ModulePosition::new(0.5, Rotation2d::from_degrees(90.0)); MODULE_COUNT];
        let twist = kinematics.to_twist(&start, &end);
        assert!(close(twist.dx, 0.0));
        assert!(close(twist.dy, 0.5));
        assert!(close(twist.dtheta, 0.0));
    }

    #[test]
    fn test_field_relative_rotation() {
        // Robot facing +y: field +x is robot -y
        let robot = ChassisVelocity::from_field_relative(
            ChassisVelocity::new(1.0, 0.0, 0.5),
            Rotation2d::from_degrees(90.0),
        );
        assert!(close(robot.vx, 0.0));
        assert!(close(robot.vy, -1.0));
        assert!(close(robot.omega, 0.5));
    }

    #[test]
    fn test_desaturate_caps_fastest_wheel() {
        let kinematics = square_kinematics();
        let velocity = ChassisVelocity::new(4.0, 1.0, 6.0);
        let mut states = kinematics.to_wheel_vectors(&velocity);
        let before = states;

        desaturate(&mut states, &velocity, 3.0, 0.0, 0.0);

        let fastest = states.iter().map(|s| s.speed.abs()).fold(0.0, f64::max);
        assert!(close(fastest, 3.0), "fastest wheel {}", fastest);
        for (a, b) in states.iter().zip(before.iter()) {
            assert!(a.speed.abs() <= 3.0 + 1e-12);
            assert_eq!(a.angle, b.angle);
        }

        // Ratios preserved
        for i in 1..MODULE_COUNT {
            let ratio_before = before[i].speed / before[0].speed;
            let ratio_after = states[i].speed / states[0].speed;
            assert!(close(ratio_before, ratio_after));
        }
    }

    #[test]
    fn test_desaturate_leaves_slow_commands_alone() {
        let kinematics = square_kinematics();
        let velocity = ChassisVelocity::new(1.0, 0.5, 0.2);
        let mut states = kinematics.to_wheel_vectors(&velocity);
        let before = states;
        desaturate(&mut states, &velocity, 4.5, 4.5, 2.0 * PI);
        assert_eq!(states, before);
    }

    #[test]
    fn test_desaturate_translational_limit() {
        let kinematics = square_kinematics();
        let velocity = ChassisVelocity::new(3.0, 0.0, 0.0);
        let mut states = kinematics.to_wheel_vectors(&velocity);
        desaturate(&mut states, &velocity, 4.5, 2.0, 2.0 * PI);
        for state in &states {
            assert!(close(state.speed, 2.0), "speed {}", state.speed);
        }
    }

    #[test]
    fn test_optimize_flips_long_rotation() {
        let desired = ModuleState::new(1.0, Rotation2d::from_degrees(170.0));
        let optimized = desired.optimize(Rotation2d::from_degrees(0.0));
        assert!(close(optimized.speed, -1.0));
        assert!(close(optimized.angle.degrees(), -10.0));

        let kept = desired.optimize(Rotation2d::from_degrees(100.0));
        assert!(close(kept.speed, 1.0));
        assert!(close(kept.angle.degrees(), 170.0));
    }

    #[test]
    fn test_invalid_geometry() {
        let coincident = SwerveKinematics::new([Translation2d::new(0.2, 0.1); MODULE_COUNT]);
        assert!(matches!(coincident, Err(DriveError::DegenerateGeometry)));

        let non_finite = SwerveKinematics::new([
            Translation2d::new(0.3, 0.3),
            Translation2d::new(f64::NAN, -0.3),
            Translation2d::new(-0.3, 0.3),
            Translation2d::new(-0.3, -0.3),
        ]);
        assert!(matches!(non_finite, Err(DriveError::NonFiniteOffset { index: 1 })));
    }
}
