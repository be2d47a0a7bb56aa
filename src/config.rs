// Timeouts, topics, drivebase geometry and tuning
use std::f64::consts::TAU;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drive::{MODULE_COUNT, StdDevs};
use crate::geometry::{Rotation2d, Translation2d};

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Health is published at this rate regardless of the other loops
pub const HEALTH_HZ: f64 = 10.0;

// Zenoh topics
pub const TOPIC_CMD_BASE: &str = "swerve/cmd/base"; // drive velocity commands
pub const TOPIC_CMD_DRIVEBASE: &str = "swerve/cmd/drivebase"; // pose reset, slow mode, brake
pub const TOPIC_SENSOR_VISION: &str = "swerve/sensor/vision"; // vision pose samples
pub const TOPIC_SENSOR_IMU: &str = "swerve/sensor/imu"; // orientation samples
pub const TOPIC_POSE: &str = "swerve/state/pose"; // pose and velocity report
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status

// Serial port for the Feetech servo bus
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One wheel module's placement and hardware ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Offset from robot center [x forward, y left], meters
    pub offset: [f64; 2],
    pub drive_id: u8,
    pub steer_id: u8,
    /// Raw encoder reading when the wheel points straight ahead
    pub encoder_offset_deg: f64,
}

impl ModuleConfig {
    fn new(name: &str, x: f64, y: f64, drive_id: u8, steer_id: u8) -> Self {
        Self {
            name: name.to_string(),
            offset: [x, y],
            drive_id,
            steer_id,
            encoder_offset_deg: 0.0,
        }
    }

    pub fn translation(&self) -> Translation2d {
        Translation2d::new(self.offset[0], self.offset[1])
    }

    pub fn encoder_offset(&self) -> Rotation2d {
        Rotation2d::from_degrees(self.encoder_offset_deg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub port: String,
    /// Talk to the servo bus at all (false runs the drivebase in simulation)
    pub enabled: bool,
    pub wheel_radius: f64,
    pub drive_current_limit: f64,
    pub steer_current_limit: f64,
    pub brake: bool,
    /// Nominal supply voltage to compensate against; unset leaves the
    /// controllers' own setting alone
    pub voltage_compensation: Option<f64>,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            port: MOTOR_PORT.to_string(),
            enabled: true,
            wheel_radius: 0.05,
            drive_current_limit: 2.0,
            steer_current_limit: 1.0,
            brake: true,
            voltage_compensation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivebaseConfig {
    /// Front left, front right, back left, back right
    pub modules: [ModuleConfig; MODULE_COUNT],
    /// Ceiling for any single wheel, m/s
    pub max_module_speed: f64,
    pub max_translational_speed: f64,
    /// rad/s
    pub max_rotational_speed: f64,
    pub slow_mode_multiplier: f64,
    /// Control period used for skew compensation and the simulation, seconds
    pub control_period: f64,
    pub odometry_hz: f64,
    pub vision_hz: f64,
    pub state_std_devs: StdDevs,
    pub vision_std_devs: StdDevs,
    /// How far back vision measurements may reach, seconds
    pub history_seconds: f64,
    pub motor: MotorConfig,
}

impl Default for DrivebaseConfig {
    fn default() -> Self {
        const HALF: f64 = 0.3;
        Self {
            modules: [
                ModuleConfig::new("front_left", HALF, HALF, 1, 2),
                ModuleConfig::new("front_right", HALF, -HALF, 3, 4),
                ModuleConfig::new("back_left", -HALF, HALF, 5, 6),
                ModuleConfig::new("back_right", -HALF, -HALF, 7, 8),
            ],
            max_module_speed: 4.5,
            max_translational_speed: 4.5,
            max_rotational_speed: TAU,
            slow_mode_multiplier: 0.3,
            control_period: 0.02,
            odometry_hz: 50.0,
            vision_hz: 25.0,
            state_std_devs: StdDevs::uniform(0.1),
            vision_std_devs: StdDevs::uniform(0.3),
            history_seconds: 1.5,
            motor: MotorConfig::default(),
        }
    }
}

impl DrivebaseConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn module_offsets(&self) -> [Translation2d; MODULE_COUNT] {
        std::array::from_fn(|i| self.modules[i].translation())
    }

    pub fn control_period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.control_period)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_module_speed", self.max_module_speed),
            ("max_translational_speed", self.max_translational_speed),
            ("max_rotational_speed", self.max_rotational_speed),
            ("control_period", self.control_period),
            ("odometry_hz", self.odometry_hz),
            ("vision_hz", self.vision_hz),
            ("history_seconds", self.history_seconds),
            ("motor.wheel_radius", self.motor.wheel_radius),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        if let Some(volts) = self.motor.voltage_compensation {
            if !volts.is_finite() || volts <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "motor.voltage_compensation must be positive, got {}",
                    volts
                )));
            }
        }

        if !(self.slow_mode_multiplier > 0.0 && self.slow_mode_multiplier <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "slow_mode_multiplier must be in (0, 1], got {}",
                self.slow_mode_multiplier
            )));
        }

        for std_devs in [self.state_std_devs, self.vision_std_devs] {
            let values = [std_devs.x, std_devs.y, std_devs.heading];
            if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "std devs must be finite and >= 0: {:?}",
                    std_devs
                )));
            }
        }

        let mut ids: Vec<u8> = Vec::with_capacity(2 * MODULE_COUNT);
        for module in &self.modules {
            let finite = module.offset.iter().all(|v| v.is_finite());
            if !finite || !module.encoder_offset_deg.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "module {} has non-finite geometry",
                    module.name
                )));
            }
            for id in [module.drive_id, module.steer_id] {
                if ids.contains(&id) {
                    return Err(ConfigError::Invalid(format!("servo id {} used twice", id)));
                }
                ids.push(id);
            }
        }

        Ok(())
    }
}
