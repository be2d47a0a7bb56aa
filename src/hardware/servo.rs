// Feetech servo variant of the motor and encoder capabilities
//
// Drive modules run the servo in velocity mode; steer modules run it in
// position mode and read its built-in magnetic encoder as the absolute
// steering angle. Several servos share one serial bus.

use std::f64::consts::TAU;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::feetech::{FeetechBus, FeetechError, OperatingMode, STEPS_PER_REVOLUTION};
use super::{AbsoluteEncoder, HardwareError, Motor, Result};
use crate::geometry::Rotation2d;

pub type SharedBus = Arc<Mutex<FeetechBus>>;

const HALF_TURN_STEPS: i32 = STEPS_PER_REVOLUTION as i32 / 2;

/// Radians per encoder step
pub const RADIANS_PER_STEP: f64 = TAU / STEPS_PER_REVOLUTION as f64;

/// Tracks whole turns so a single-turn position becomes continuous
#[derive(Debug, Default)]
struct TurnCounter {
    last: Option<u16>,
    steps: i64,
}

impl TurnCounter {
    fn update(&mut self, raw: u16) -> i64 {
        if let Some(last) = self.last {
            let mut delta = raw as i32 - last as i32;
            if delta > HALF_TURN_STEPS {
                delta -= STEPS_PER_REVOLUTION as i32;
            } else if delta < -HALF_TURN_STEPS {
                delta += STEPS_PER_REVOLUTION as i32;
            }
            self.steps += delta as i64;
        } else {
            self.steps = raw as i64;
        }
        self.last = Some(raw);
        self.steps
    }
}

/// One Feetech servo used as a drive or steer motor
pub struct FeetechMotor {
    bus: SharedBus,
    id: u8,
    /// Mechanism units per encoder step (meters for drive, radians for steer)
    units_per_step: f64,
    mode: OperatingMode,
    brake: bool,
    torque_enabled: bool,
    turns: TurnCounter,
}

impl FeetechMotor {
    /// Check the servo answers and put it in `mode`
    pub fn connect(
        bus: SharedBus,
        id: u8,
        mode: OperatingMode,
        units_per_step: f64,
    ) -> Result<Self> {
        {
            let mut guard = bus.lock();
            match guard.ping(id) {
                Ok(true) => debug!("Servo {} responding", id),
                Ok(false) => {
                    warn!("Servo {} not responding to ping", id);
                    return Err(FeetechError::Timeout { id }.into());
                }
                Err(e) => return Err(e.into()),
            }
            guard.set_operating_mode(id, mode)?;
        }
        info!("Servo {} ready in {:?} mode", id, mode);

        Ok(Self {
            bus,
            id,
            units_per_step,
            mode,
            brake: true,
            torque_enabled: true,
            turns: TurnCounter::default(),
        })
    }

    /// Drive motor whose wheel has the given radius
    pub fn drive(bus: SharedBus, id: u8, wheel_radius: f64) -> Result<Self> {
        Self::connect(bus, id, OperatingMode::Velocity, wheel_radius * RADIANS_PER_STEP)
    }

    /// Steer motor whose output shaft is the module azimuth
    pub fn steer(bus: SharedBus, id: u8) -> Result<Self> {
        Self::connect(bus, id, OperatingMode::Position, RADIANS_PER_STEP)
    }

    fn ensure_mode(&mut self, mode: OperatingMode) -> Result<()> {
        if self.mode != mode || !self.torque_enabled {
            self.bus.lock().set_operating_mode(self.id, mode)?;
            self.mode = mode;
            self.torque_enabled = true;
        }
        Ok(())
    }
}

impl Motor for FeetechMotor {
    fn set_velocity_reference(&mut self, velocity: f64) -> Result<()> {
        self.ensure_mode(OperatingMode::Velocity)?;
        let steps = (velocity / self.units_per_step).round();
        let steps = steps.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        self.bus.lock().set_goal_velocity(self.id, steps)?;
        Ok(())
    }

    fn set_position_reference(&mut self, position: f64) -> Result<()> {
        self.ensure_mode(OperatingMode::Position)?;
        let steps = (position / self.units_per_step).round() as i64;
        let step = steps.rem_euclid(STEPS_PER_REVOLUTION as i64) as u16;
        self.bus.lock().set_goal_position(self.id, step)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut bus = self.bus.lock();
        if self.brake && self.mode == OperatingMode::Velocity {
            bus.set_goal_velocity(self.id, 0)?;
        } else {
            bus.set_torque(self.id, false)?;
            self.torque_enabled = false;
        }
        Ok(())
    }

    fn position(&mut self) -> Result<f64> {
        let raw = self.bus.lock().present_position(self.id)?;
        Ok(self.turns.update(raw) as f64 * self.units_per_step)
    }

    fn velocity(&mut self) -> Result<f64> {
        let raw = self.bus.lock().present_velocity(self.id)?;
        Ok(raw as f64 * self.units_per_step)
    }

    fn set_current_limit(&mut self, amps: f64) -> Result<()> {
        self.bus.lock().set_protection_current(self.id, amps)?;
        Ok(())
    }

    fn set_voltage_compensation(&mut self, _volts: f64) -> Result<()> {
        Err(HardwareError::Unsupported {
            device: "Feetech STS servo",
            operation: "voltage compensation",
        })
    }

    fn set_brake_mode(&mut self, enabled: bool) -> Result<()> {
        self.brake = enabled;
        Ok(())
    }

    fn follow(&mut self, _leader_id: u8, _inverted: bool) -> Result<()> {
        Err(HardwareError::Unsupported {
            device: "Feetech STS servo",
            operation: "follower mode",
        })
    }
}

impl Drop for FeetechMotor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop servo {} on drop: {}", self.id, e);
        }
    }
}

/// The magnetic encoder inside a steer servo
pub struct FeetechEncoder {
    bus: SharedBus,
    id: u8,
    zero_offset: Rotation2d,
}

impl FeetechEncoder {
    pub fn new(bus: SharedBus, id: u8, zero_offset: Rotation2d) -> Self {
        Self {
            bus,
            id,
            zero_offset,
        }
    }
}

impl AbsoluteEncoder for FeetechEncoder {
    fn raw_angle(&mut self) -> Result<Rotation2d> {
        let raw = self.bus.lock().present_position(self.id)?;
        Ok(Rotation2d::from_radians(raw as f64 * RADIANS_PER_STEP))
    }

    fn zero_offset(&self) -> Rotation2d {
        self.zero_offset
    }

    fn set_zero_offset(&mut self, offset: Rotation2d) {
        self.zero_offset = offset;
    }
}
