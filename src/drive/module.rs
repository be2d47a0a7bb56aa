// One swerve wheel module: a drive motor, a steer motor and an absolute
// steering encoder behind the hardware capability traits.

use tracing::{info, warn};

use super::kinematics::{ModulePosition, ModuleState};
use super::{DriveError, MODULE_COUNT};
use crate::geometry::Rotation2d;
use crate::hardware::{AbsoluteEncoder, Motor};

/// Below this fraction of max speed the module keeps its previous heading
pub const ANTI_JITTER_FRACTION: f64 = 0.01;

pub struct SwerveModule {
    index: usize,
    name: String,
    drive: Box<dyn Motor>,
    steer: Box<dyn Motor>,
    encoder: Box<dyn AbsoluteEncoder>,
    max_speed: f64,
    /// Drive motor position treated as zero distance
    distance_reference: f64,
    /// Last angle the encoder reported
    last_angle: Rotation2d,
    desired: ModuleState,
    encoder_healthy: bool,
}

impl SwerveModule {
    pub fn new(
        index: usize,
        name: impl Into<String>,
        drive: Box<dyn Motor>,
        steer: Box<dyn Motor>,
        encoder: Box<dyn AbsoluteEncoder>,
        max_speed: f64,
    ) -> Result<Self, DriveError> {
        if index >= MODULE_COUNT {
            return Err(DriveError::InvalidModuleIndex { index });
        }

        let mut module = Self {
            index,
            name: name.into(),
            drive,
            steer,
            encoder,
            max_speed,
            distance_reference: 0.0,
            last_angle: Rotation2d::ZERO,
            desired: ModuleState::default(),
            encoder_healthy: true,
        };

        match module.encoder.angle() {
            Ok(angle) => module.last_angle = angle,
            Err(e) => {
                warn!("Module {} ({}): no absolute angle at startup: {}", index, module.name, e);
                module.encoder_healthy = false;
            }
        }
        module.desired = ModuleState::new(0.0, module.last_angle);
        module.distance_reference = module.drive.position()?;

        Ok(module)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    /// Last state sent to the motors, after optimization
    pub fn desired_state(&self) -> ModuleState {
        self.desired
    }

    /// True while the absolute encoder is unreadable
    pub fn is_degraded(&self) -> bool {
        !self.encoder_healthy
    }

    /// Command a speed and heading. The heading is only servoed while the
    /// absolute encoder is readable; otherwise the steer motor is stopped and
    /// the wheel keeps rolling at whatever angle it holds.
    pub fn set_desired_state(&mut self, state: ModuleState) -> Result<(), DriveError> {
        let current = self.read_angle();
        let mut target = state.optimize(current);

        if target.speed.abs() <= self.max_speed * ANTI_JITTER_FRACTION {
            target.angle = self.desired.angle;
        }

        self.drive.set_velocity_reference(target.speed)?;

        if self.encoder_healthy {
            // Reference in the encoder's raw frame, continuous with where the shaft is now
            let delta = (target.angle - current).wrapped();
            let reference = current + self.encoder.zero_offset() + delta;
            self.steer.set_position_reference(reference.radians())?;
        } else {
            self.steer.stop()?;
        }

        self.desired = target;
        Ok(())
    }

    pub fn position(&mut self) -> Result<ModulePosition, DriveError> {
        let distance = self.drive.position()? - self.distance_reference;
        Ok(ModulePosition::new(distance, self.read_angle()))
    }

    pub fn state(&mut self) -> Result<ModuleState, DriveError> {
        let speed = self.drive.velocity()?;
        Ok(ModuleState::new(speed, self.read_angle()))
    }

    /// Make the current drive position the new zero distance
    pub fn reset_position(&mut self) -> Result<(), DriveError> {
        self.distance_reference = self.drive.position()?;
        Ok(())
    }

    pub fn set_brake_mode(&mut self, enabled: bool) -> Result<(), DriveError> {
        self.drive.set_brake_mode(enabled)?;
        self.steer.set_brake_mode(enabled)?;
        Ok(())
    }

    pub fn set_current_limits(
        &mut self,
        drive_amps: f64,
        steer_amps: f64,
    ) -> Result<(), DriveError> {
        self.drive.set_current_limit(drive_amps)?;
        self.steer.set_current_limit(steer_amps)?;
        Ok(())
    }

    pub fn set_voltage_compensation(&mut self, volts: f64) -> Result<(), DriveError> {
        self.drive.set_voltage_compensation(volts)?;
        self.steer.set_voltage_compensation(volts)?;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DriveError> {
        self.drive.stop()?;
        self.steer.stop()?;
        self.desired.speed = 0.0;
        Ok(())
    }

    /// Encoder angle, or the last good one while the encoder is failing
    fn read_angle(&mut self) -> Rotation2d {
        match self.encoder.angle() {
            Ok(angle) => {
                if !self.encoder_healthy {
                    info!("Module {} ({}): absolute encoder recovered", self.index, self.name);
                    self.encoder_healthy = true;
                }
                self.last_angle = angle;
                angle
            }
            Err(e) => {
                if self.encoder_healthy {
                    warn!(
                        "Module {} ({}): absolute encoder lost, holding {:.1} deg: {}",
                        self.index,
                        self.name,
                        self.last_angle.degrees(),
                        e
                    );
                    self.encoder_healthy = false;
                }
                self.last_angle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimModuleHardware;

    const MAX_SPEED: f64 = 4.5;

    fn module(hardware: &SimModuleHardware) -> SwerveModule {
        SwerveModule::new(
            0,
            "front_left",
            Box::new(hardware.drive.clone()),
            Box::new(hardware.steer.clone()),
            Box::new(hardware.encoder.clone()),
            MAX_SPEED,
        )
        .unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_invalid_index_rejected() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let result = SwerveModule::new(
            4,
            "fifth",
            Box::new(hardware.drive.clone()),
            Box::new(hardware.steer.clone()),
            Box::new(hardware.encoder.clone()),
            MAX_SPEED,
        );
        assert!(matches!(result, Err(DriveError::InvalidModuleIndex { index: 4 })));
    }

    #[test]
    fn test_commands_reach_motors() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let mut module = module(&hardware);

        module
            .set_desired_state(ModuleState::new(1.5, Rotation2d::from_degrees(45.0)))
            .unwrap();

        let drive = hardware.drive.snapshot();
        let steer = hardware.steer.snapshot();
        assert_eq!(drive.velocity_reference, Some(1.5));
        assert!(close(steer.position_reference.unwrap(), Rotation2d::from_degrees(45.0).radians()));
    }

    #[test]
    fn test_long_turn_is_flipped() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let mut module = module(&hardware);

        module
            .set_desired_state(ModuleState::new(1.0, Rotation2d::from_degrees(170.0)))
            .unwrap();

        let desired = module.desired_state();
        assert!(close(desired.speed, -1.0));
        assert!(close(desired.angle.degrees(), -10.0), "angle {}", desired.angle.degrees());
    }

    #[test]
    fn test_steer_reference_includes_zero_offset() {
        let hardware = SimModuleHardware::new(Rotation2d::from_degrees(30.0));
        // Physically point the wheel straight ahead (raw 30 deg)
        hardware
            .steer
            .clone()
            .set_position_reference(Rotation2d::from_degrees(30.0).radians())
            .unwrap();
        hardware.steer.advance(0.02);

        let mut module = module(&hardware);
        module
            .set_desired_state(ModuleState::new(1.0, Rotation2d::from_degrees(20.0)))
            .unwrap();

        let reference = hardware.steer.snapshot().position_reference.unwrap();
        assert!(
            close(reference, Rotation2d::from_degrees(50.0).radians()),
            "reference {}",
            reference
        );
    }

    #[test]
    fn test_slow_wheel_holds_heading() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let mut module = module(&hardware);

        module
            .set_desired_state(ModuleState::new(1.0, Rotation2d::from_degrees(60.0)))
            .unwrap();
        hardware.steer.advance(0.02);

        module
            .set_desired_state(ModuleState::new(0.01, Rotation2d::from_degrees(10.0)))
            .unwrap();
        assert!(close(module.desired_state().angle.degrees(), 60.0));
        assert_eq!(hardware.drive.snapshot().velocity_reference, Some(0.01));
    }

    #[test]
    fn test_encoder_loss_fails_closed() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let mut module = module(&hardware);

        module
            .set_desired_state(ModuleState::new(1.0, Rotation2d::from_degrees(30.0)))
            .unwrap();
        hardware.steer.advance(0.02);
        module.position().unwrap();

        hardware.encoder.set_available(false);
        module
            .set_desired_state(ModuleState::new(2.0, Rotation2d::from_degrees(10.0)))
            .unwrap();

        assert!(module.is_degraded());
        assert!(hardware.steer.snapshot().stopped, "steer must not be servoed blind");
        assert_eq!(hardware.drive.snapshot().velocity_reference, Some(2.0));

        // Reports the last good angle instead of zero
        let position = module.position().unwrap();
        assert!(close(position.angle.degrees(), 30.0), "angle {}", position.angle.degrees());

        hardware.encoder.set_available(true);
        module.position().unwrap();
        assert!(!module.is_degraded());
    }

    #[test]
    fn test_reset_position_zeroes_distance() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let mut module = module(&hardware);

        module.set_desired_state(ModuleState::new(2.0, Rotation2d::ZERO)).unwrap();
        hardware.drive.advance(0.5);
        assert!(close(module.position().unwrap().distance, 1.0));
        assert!(close(module.state().unwrap().speed, 2.0));

        module.reset_position().unwrap();
        assert!(close(module.position().unwrap().distance, 0.0));
    }

    #[test]
    fn test_stop_and_brake() {
        let hardware = SimModuleHardware::new(Rotation2d::ZERO);
        let mut module = module(&hardware);

        module.set_brake_mode(true).unwrap();
        module.set_current_limits(20.0, 10.0).unwrap();
        module.set_desired_state(ModuleState::new(1.0, Rotation2d::ZERO)).unwrap();
        module.stop().unwrap();

        let drive = hardware.drive.snapshot();
        assert!(drive.stopped && drive.brake);
        assert_eq!(drive.current_limit, Some(20.0));
        assert_eq!(hardware.steer.snapshot().current_limit, Some(10.0));
        assert_eq!(module.desired_state().speed, 0.0);
    }
}
