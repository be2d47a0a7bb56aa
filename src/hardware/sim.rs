// Simulated actuators and sensors
//
// Each sim device is a cheap handle around shared state: clone it before
// boxing it into the drivebase and keep the clone to inspect commands or
// inject faults. SimPlant integrates the simulated motion every period.

use std::f64::consts::TAU;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AbsoluteEncoder, HardwareError, Imu, Motor, Result};
use crate::drive::{MODULE_COUNT, ModuleState, SwerveKinematics};
use crate::geometry::{Orientation, Pose2d, Rotation2d, Twist2d};

#[derive(Debug, Clone, Default)]
pub struct SimMotorState {
    pub position: f64,
    pub velocity: f64,
    pub velocity_reference: Option<f64>,
    pub position_reference: Option<f64>,
    pub stopped: bool,
    pub brake: bool,
    pub current_limit: Option<f64>,
    pub voltage_compensation: Option<f64>,
    pub leader: Option<(u8, bool)>,
    /// Make every read fail
    pub faulted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SimMotor {
    state: Arc<Mutex<SimMotorState>>,
}

impl SimMotor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SimMotorState {
        self.state.lock().clone()
    }

    pub fn set_faulted(&self, faulted: bool) {
        self.state.lock().faulted = faulted;
    }

    /// Follow the last reference for `dt` seconds. Position control settles
    /// within one period.
    pub fn advance(&self, dt: f64) {
        let mut state = self.state.lock();
        if state.stopped {
            state.velocity = 0.0;
        } else if let Some(velocity) = state.velocity_reference {
            state.velocity = velocity;
            state.position += velocity * dt;
        } else if let Some(position) = state.position_reference {
            state.velocity = if dt > 0.0 { (position - state.position) / dt } else { 0.0 };
            state.position = position;
        }
    }

    fn read<T>(&self, f: impl FnOnce(&SimMotorState) -> T) -> Result<T> {
        let state = self.state.lock();
        if state.faulted {
            return Err(HardwareError::Unavailable {
                device: "sim motor".to_string(),
            });
        }
        Ok(f(&state))
    }
}

impl Motor for SimMotor {
    fn set_velocity_reference(&mut self, velocity: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.velocity_reference = Some(velocity);
        state.position_reference = None;
        state.stopped = false;
        Ok(())
    }

    fn set_position_reference(&mut self, position: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.position_reference = Some(position);
        state.velocity_reference = None;
        state.stopped = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.stopped = true;
        state.velocity_reference = None;
        state.position_reference = None;
        Ok(())
    }

    fn position(&mut self) -> Result<f64> {
        self.read(|s| s.position)
    }

    fn velocity(&mut self) -> Result<f64> {
        self.read(|s| s.velocity)
    }

    fn set_current_limit(&mut self, amps: f64) -> Result<()> {
        self.state.lock().current_limit = Some(amps);
        Ok(())
    }

    fn set_voltage_compensation(&mut self, volts: f64) -> Result<()> {
        self.state.lock().voltage_compensation = Some(volts);
        Ok(())
    }

    fn set_brake_mode(&mut self, enabled: bool) -> Result<()> {
        self.state.lock().brake = enabled;
        Ok(())
    }

    fn follow(&mut self, leader_id: u8, inverted: bool) -> Result<()> {
        self.state.lock().leader = Some((leader_id, inverted));
        Ok(())
    }
}

/// Absolute encoder reading a simulated steer motor's shaft
#[derive(Debug, Clone)]
pub struct SimEncoder {
    shaft: SimMotor,
    zero_offset: Rotation2d,
    available: Arc<Mutex<bool>>,
}

impl SimEncoder {
    pub fn new(shaft: SimMotor, zero_offset: Rotation2d) -> Self {
        Self {
            shaft,
            zero_offset,
            available: Arc::new(Mutex::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        *self.available.lock() = available;
    }
}

impl AbsoluteEncoder for SimEncoder {
    fn raw_angle(&mut self) -> Result<Rotation2d> {
        if !*self.available.lock() {
            return Err(HardwareError::Unavailable {
                device: "sim absolute encoder".to_string(),
            });
        }
        let position = self.shaft.snapshot().position;
        Ok(Rotation2d::from_radians(position.rem_euclid(TAU)))
    }

    fn zero_offset(&self) -> Rotation2d {
        self.zero_offset
    }

    fn set_zero_offset(&mut self, offset: Rotation2d) {
        self.zero_offset = offset;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimImuState {
    pub raw: Orientation,
    pub offset: Orientation,
    pub available: bool,
}

#[derive(Debug, Clone)]
pub struct SimImu {
    state: Arc<Mutex<SimImuState>>,
}

impl Default for SimImu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimImu {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimImuState {
                available: true,
                ..Default::default()
            })),
        }
    }

    pub fn snapshot(&self) -> SimImuState {
        self.state.lock().clone()
    }

    pub fn set_raw(&self, raw: Orientation) {
        self.state.lock().raw = raw;
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    fn rotate_yaw(&self, delta: f64) {
        self.state.lock().raw.yaw += delta;
    }
}

impl Imu for SimImu {
    fn raw_orientation(&mut self) -> Result<Orientation> {
        let state = self.state.lock();
        if !state.available {
            return Err(HardwareError::Unavailable {
                device: "sim IMU".to_string(),
            });
        }
        Ok(state.raw)
    }

    fn offset(&self) -> Orientation {
        self.state.lock().offset
    }

    fn set_offset(&mut self, offset: Orientation) {
        self.state.lock().offset = offset;
    }
}

/// Simulated drive motor, steer motor and steer encoder of one module
#[derive(Debug, Clone)]
pub struct SimModuleHardware {
    pub drive: SimMotor,
    pub steer: SimMotor,
    pub encoder: SimEncoder,
}

impl SimModuleHardware {
    pub fn new(zero_offset: Rotation2d) -> Self {
        let steer = SimMotor::new();
        let encoder = SimEncoder::new(steer.clone(), zero_offset);
        Self {
            drive: SimMotor::new(),
            steer,
            encoder,
        }
    }
}

/// Integrates commanded module motion into robot motion and IMU yaw
pub struct SimPlant {
    kinematics: SwerveKinematics,
    modules: [SimModuleHardware; MODULE_COUNT],
    imu: SimImu,
    pose: Pose2d,
}

impl SimPlant {
    pub fn new(
        kinematics: SwerveKinematics,
        modules: [SimModuleHardware; MODULE_COUNT],
        imu: SimImu,
    ) -> Self {
        Self {
            kinematics,
            modules,
            imu,
            pose: Pose2d::IDENTITY,
        }
    }

    /// Ground-truth pose of the simulated robot
    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    pub fn advance(&mut self, dt: f64) {
        let mut states = [ModuleState::default(); MODULE_COUNT];
        for (state, module) in states.iter_mut().zip(self.modules.iter_mut()) {
            module.drive.advance(dt);
            module.steer.advance(dt);
            let speed = module.drive.snapshot().velocity;
            // Ignore faults: the plant sees the physical shaft
            let shaft = module.steer.snapshot().position;
            let angle = Rotation2d::from_radians(shaft) - module.encoder.zero_offset();
            *state = ModuleState::new(speed, angle);
        }

        let velocity = self.kinematics.to_chassis_velocity(&states);
        self.pose = self.pose.exp(&Twist2d::new(
            velocity.vx * dt,
            velocity.vy * dt,
            velocity.omega * dt,
        ));
        self.imu.rotate_yaw(velocity.omega * dt);
    }
}
