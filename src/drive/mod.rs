// Swerve drivebase: kinematics, skew compensation, wheel modules,
// pose estimation and the orchestrating Drivebase.

pub mod drivebase;
pub mod estimator;
pub mod kinematics;
pub mod module;
pub mod skew;

pub use drivebase::{Drivebase, SpeedLimits};
pub use estimator::{PoseEstimator, RejectedMeasurement, StdDevs, SwerveOdometry, VisionMeasurement};
pub use kinematics::{ChassisVelocity, ModulePosition, ModuleState, SwerveKinematics, desaturate};
pub use module::SwerveModule;
pub use skew::SkewCompensator;

use crate::hardware::HardwareError;

/// A swerve drivebase always has exactly four modules
pub const MODULE_COUNT: usize = 4;

/// Errors raised by the drive subsystem
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Invalid module index {index}, expected 0..{}", MODULE_COUNT)]
    InvalidModuleIndex { index: usize },

    #[error("Module {found} installed in slot {slot}")]
    ModuleSlotMismatch { slot: usize, found: usize },

    #[error("Module {index} offset is not finite")]
    NonFiniteOffset { index: usize },

    #[error("Module offsets are degenerate (all wheels share one point)")]
    DegenerateGeometry,

    #[error("Velocity command contains non-finite components")]
    NonFiniteCommand,

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}
