// Message types exchanged over zenoh (JSON payloads)

use serde::{Deserialize, Serialize};

use crate::drive::{ChassisVelocity, ModuleState, StdDevs, VisionMeasurement};
use crate::geometry::{Orientation, Pose2d, Rotation2d};

// Drive command from teleop/autonomous -> runtime
// Linear velocities in m/s, angular velocity in deg/s
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaseCommand {
    pub x_vel: f64,
    pub y_vel: f64,
    pub theta_vel: f64,
    #[serde(default)]
    pub field_relative: bool,
}

impl BaseCommand {
    pub fn velocity(&self) -> ChassisVelocity {
        ChassisVelocity::new(self.x_vel, self.y_vel, self.theta_vel.to_radians())
    }
}

/// One-off requests to the drivebase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum DrivebaseRequest {
    ResetPose { x: f64, y: f64, heading_deg: f64 },
    ToggleSlowMode,
    SetBrakeMode { enabled: bool },
    ResetModulePositions,
}

// Pose from a vision pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionSample {
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
    /// Capture plus pipeline latency
    pub latency_ms: f64,
    #[serde(default)]
    pub std_devs: Option<StdDevs>,
}

impl VisionSample {
    /// Measurement stamped at capture time on the drivebase clock
    pub fn into_measurement(self, now: f64) -> VisionMeasurement {
        let pose = Pose2d::new(self.x, self.y, Rotation2d::from_degrees(self.heading_deg));
        VisionMeasurement {
            pose,
            timestamp: now - self.latency_ms.max(0.0) / 1000.0,
            std_devs: self.std_devs,
        }
    }
}

// Orientation from an external IMU, degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImuSample {
    pub yaw_deg: f64,
    #[serde(default)]
    pub pitch_deg: f64,
    #[serde(default)]
    pub roll_deg: f64,
}

impl From<ImuSample> for Orientation {
    fn from(sample: ImuSample) -> Self {
        Orientation::new(
            sample.yaw_deg.to_radians(),
            sample.pitch_deg.to_radians(),
            sample.roll_deg.to_radians(),
        )
    }
}

/// Published every odometry tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrivebaseReport {
    pub timestamp: f64,
    pub pose: Pose2d,
    /// Robot-frame velocity from measured module states
    pub velocity: ChassisVelocity,
    pub desired_states: Vec<ModuleState>,
    pub slow_mode: bool,
    /// Multiplier applied to commands right now (1.0 outside slow mode)
    pub speed_scale: f64,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    /// Driving, but at least one module has lost its absolute encoder
    Degraded,
}
