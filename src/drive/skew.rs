// Second-order (skew) compensation
//
// Driving and turning in the same control period makes the robot drift
// sideways: the wheels follow an arc, not the straight line the command
// assumed. Taking the SE(2) log of the intended per-period displacement gives
// the arc twist that lands on the intended pose; dividing by the period turns
// it back into a chassis velocity.

use super::kinematics::ChassisVelocity;
use crate::geometry::{Pose2d, Rotation2d};

#[derive(Debug, Clone, Copy)]
pub struct SkewCompensator {
    period: f64,
}

impl SkewCompensator {
    /// `period` is the control period in seconds
    pub fn new(period: f64) -> Self {
        Self { period }
    }

    pub fn compensate(&self, velocity: &ChassisVelocity) -> ChassisVelocity {
        let dt = self.period;
        if dt <= 0.0 || !dt.is_finite() {
            return *velocity;
        }

        let displacement = Pose2d::new(
            velocity.vx * dt,
            velocity.vy * dt,
            Rotation2d::from_radians(velocity.omega * dt),
        );
        let twist = Pose2d::IDENTITY.log(&displacement);

        ChassisVelocity::new(twist.dx / dt, twist.dy / dt, twist.dtheta / dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_no_rotation_is_identity() {
        let skew = SkewCompensator::new(0.02);
        let velocity = ChassisVelocity::new(1.5, -0.75, 0.0);
        let compensated = skew.compensate(&velocity);
        assert!(close(compensated.vx, velocity.vx));
        assert!(close(compensated.vy, velocity.vy));
        assert!(close(compensated.omega, 0.0));
    }

    #[test]
    fn test_rotation_only_unchanged() {
        let skew = SkewCompensator::new(0.02);
        let compensated = skew.compensate(&ChassisVelocity::new(0.0, 0.0, 3.0));
        assert!(close(compensated.vx, 0.0));
        assert!(close(compensated.vy, 0.0));
        assert!(close(compensated.omega, 3.0));
    }

    #[test]
    fn test_arc_lands_on_intended_pose() {
        // Following the compensated twist for one period must end exactly
        // where the straight-line command intended
        let dt = 0.02;
        let skew = SkewCompensator::new(dt);
        let velocity = ChassisVelocity::new(3.0, 1.0, 4.0);
        let compensated = skew.compensate(&velocity);

        let twist = crate::geometry::Twist2d::new(
            compensated.vx * dt,
            compensated.vy * dt,
            compensated.omega * dt,
        );
        let end = Pose2d::IDENTITY.exp(&twist);
        assert!(close(end.x, velocity.vx * dt));
        assert!(close(end.y, velocity.vy * dt));
        assert!(close(end.heading.radians(), velocity.omega * dt));
    }

    #[test]
    fn test_translating_while_turning_leans_into_the_turn() {
        let skew = SkewCompensator::new(0.02);
        let compensated = skew.compensate(&ChassisVelocity::new(2.0, 0.0, 5.0));
        // CCW rotation while driving forward: correction points slightly right
        assert!(compensated.vy < 0.0, "vy {}", compensated.vy);
        assert!(compensated.vx > 1.99 && compensated.vx <= 2.0);
    }

    #[test]
    fn test_zero_period_passes_through() {
        let skew = SkewCompensator::new(0.0);
        let velocity = ChassisVelocity::new(1.0, 2.0, 3.0);
        assert_eq!(skew.compensate(&velocity), velocity);
    }
}
