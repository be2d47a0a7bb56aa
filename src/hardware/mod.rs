// Hardware capability interfaces for the drivebase
//
// The drive code only talks to these traits. Vendor variants:
// - servo: Feetech STS servos over a serial bus (feetech)
// - sim: simulated actuators and sensors for running without hardware

pub mod feetech;
pub mod servo;
pub mod sim;

pub use feetech::{FeetechBus, FeetechError};
pub use servo::{FeetechEncoder, FeetechMotor, SharedBus};
pub use sim::{SimEncoder, SimImu, SimModuleHardware, SimMotor, SimPlant};

use crate::drive::VisionMeasurement;
use crate::geometry::{Orientation, Rotation2d};

/// Errors from hardware capabilities
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error(transparent)]
    Bus(#[from] FeetechError),

    #[error("{device} is unavailable")]
    Unavailable { device: String },

    #[error("{device} does not support {operation}")]
    Unsupported {
        device: &'static str,
        operation: &'static str,
    },

    #[error("Invalid sample from {source_name}: {reason}")]
    InvalidSample { source_name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, HardwareError>;

/// A motor controller with onboard closed-loop control.
/// Units are mechanism units: meters for drive motors, radians for steer motors.
pub trait Motor: Send {
    fn set_velocity_reference(&mut self, velocity: f64) -> Result<()>;

    fn set_position_reference(&mut self, position: f64) -> Result<()>;

    /// Stop driving; holds or coasts depending on brake mode
    fn stop(&mut self) -> Result<()>;

    fn position(&mut self) -> Result<f64>;

    fn velocity(&mut self) -> Result<f64>;

    fn set_current_limit(&mut self, amps: f64) -> Result<()>;

    /// Scale output against `volts` so speed holds as the battery sags
    fn set_voltage_compensation(&mut self, volts: f64) -> Result<()>;

    fn set_brake_mode(&mut self, enabled: bool) -> Result<()>;

    /// Mirror another motor on the same bus. Swerve modules command every
    /// motor on its own and never link them; mechanisms with paired motors do.
    fn follow(&mut self, leader_id: u8, inverted: bool) -> Result<()>;
}

/// Absolute steering angle sensor with a configurable zero offset
pub trait AbsoluteEncoder: Send {
    /// Angle as read by the sensor, before the zero offset
    fn raw_angle(&mut self) -> Result<Rotation2d>;

    fn zero_offset(&self) -> Rotation2d;

    fn set_zero_offset(&mut self, offset: Rotation2d);

    /// Offset-corrected angle wrapped to (-PI, PI]
    fn angle(&mut self) -> Result<Rotation2d> {
        Ok((self.raw_angle()? - self.zero_offset()).wrapped())
    }
}

/// Inertial sensor with a software offset applied on top of raw readings
pub trait Imu: Send {
    fn raw_orientation(&mut self) -> Result<Orientation>;

    fn offset(&self) -> Orientation;

    fn set_offset(&mut self, offset: Orientation);

    fn orientation(&mut self) -> Result<Orientation> {
        Ok(self.raw_orientation()? - self.offset())
    }
}

/// A source of pose estimates from vision. Must never block.
pub trait VisionSource: Send {
    /// `now` is the drivebase clock in seconds. Returns `None` when nothing
    /// new was detected this cycle.
    fn poll(&mut self, now: f64) -> Result<Option<VisionMeasurement>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder {
        raw: Rotation2d,
        offset: Rotation2d,
    }

    impl AbsoluteEncoder for FixedEncoder {
        fn raw_angle(&mut self) -> Result<Rotation2d> {
            Ok(self.raw)
        }

        fn zero_offset(&self) -> Rotation2d {
            self.offset
        }

        fn set_zero_offset(&mut self, offset: Rotation2d) {
            self.offset = offset;
        }
    }

    #[test]
    fn test_encoder_offset_wraps() {
        let mut encoder = FixedEncoder {
            raw: Rotation2d::from_degrees(10.0),
            offset: Rotation2d::from_degrees(30.0),
        };
        let angle = encoder.angle().unwrap();
        assert!((angle.degrees() + 20.0).abs() < 1e-9);

        encoder.set_zero_offset(Rotation2d::from_degrees(-200.0));
        let angle = encoder.angle().unwrap();
        assert!((angle.degrees() + 150.0).abs() < 1e-9, "{}", angle.degrees());
    }
}
