// The drivebase: four modules, kinematics, skew compensation and the pose
// estimator behind one thread-safe handle.
//
// Locking: each module, the IMU and the estimator have their own mutex. The
// estimator is only locked after every sensor read for the operation is done,
// so a slow bus never stalls the other periodic producer. Zeroing the module
// distances is the one exception: it holds the estimator for the whole
// re-anchor. Odometry samples whose reads straddle a reset are dropped by
// reset generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::estimator::{PoseEstimator, RejectedMeasurement, StdDevs, VisionMeasurement};
use super::kinematics::{
    ChassisVelocity, ModulePosition, ModuleState, SwerveKinematics, desaturate,
};
use super::module::SwerveModule;
use super::skew::SkewCompensator;
use super::{DriveError, MODULE_COUNT};
use crate::config::DrivebaseConfig;
use crate::geometry::{Orientation, Pose2d, Rotation2d};
use crate::hardware::{Imu, VisionSource};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimits {
    /// Fastest any single wheel may be commanded, m/s
    pub absolute_max: f64,
    pub max_translational: f64,
    /// rad/s
    pub max_rotational: f64,
}

impl SpeedLimits {
    pub fn from_config(config: &DrivebaseConfig) -> Self {
        Self {
            absolute_max: config.max_module_speed,
            max_translational: config.max_translational_speed,
            max_rotational: config.max_rotational_speed,
        }
    }
}

pub struct Drivebase {
    modules: [Mutex<SwerveModule>; MODULE_COUNT],
    kinematics: SwerveKinematics,
    skew: SkewCompensator,
    estimator: Mutex<PoseEstimator>,
    imu: Mutex<Box<dyn Imu>>,
    limits: SpeedLimits,
    slow_mode: AtomicBool,
    slow_mode_multiplier: f64,
    epoch: Instant,
}

impl Drivebase {
    /// Modules must be passed in slot order (front left, front right,
    /// back left, back right) matching the configured offsets.
    pub fn new(
        config: &DrivebaseConfig,
        modules: [SwerveModule; MODULE_COUNT],
        mut imu: Box<dyn Imu>,
    ) -> Result<Self, DriveError> {
        for (slot, module) in modules.iter().enumerate() {
            if module.index() != slot {
                return Err(DriveError::ModuleSlotMismatch {
                    slot,
                    found: module.index(),
                });
            }
        }

        let kinematics = SwerveKinematics::new(config.module_offsets())?;

        let mut modules = modules;
        let mut positions = [ModulePosition::default(); MODULE_COUNT];
        for (position, module) in positions.iter_mut().zip(modules.iter_mut()) {
            *position = module.position()?;
        }

        let gyro = match imu.orientation() {
            Ok(orientation) => orientation.yaw_rotation(),
            Err(e) => {
                warn!("IMU unavailable at startup, assuming zero yaw: {}", e);
                Rotation2d::ZERO
            }
        };

        let estimator = PoseEstimator::new(
            kinematics.clone(),
            gyro,
            &positions,
            Pose2d::from_parts(Default::default(), gyro),
            config.state_std_devs,
            config.vision_std_devs,
        )
        .with_history_duration(config.history_seconds);

        let limits = SpeedLimits::from_config(config);
        info!(
            "Drivebase ready: max wheel {:.2} m/s, max rotation {:.2} rad/s, slow mode x{}",
            limits.absolute_max, limits.max_rotational, config.slow_mode_multiplier
        );

        Ok(Self {
            modules: modules.map(Mutex::new),
            kinematics,
            skew: SkewCompensator::new(config.control_period),
            estimator: Mutex::new(estimator),
            imu: Mutex::new(imu),
            limits,
            slow_mode: AtomicBool::new(false),
            slow_mode_multiplier: config.slow_mode_multiplier,
            epoch: Instant::now(),
        })
    }

    /// Seconds since the drivebase was created; the clock for all timestamps
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn kinematics(&self) -> &SwerveKinematics {
        &self.kinematics
    }

    /// Transform a velocity command into module states and send them.
    ///
    /// Pipeline: field to robot frame, slow mode, skew compensation,
    /// kinematics, desaturation, dispatch. Every module is commanded even if
    /// one fails; the first failure is returned.
    pub fn drive(
        &self,
        velocity: ChassisVelocity,
        field_relative: bool,
    ) -> Result<[ModuleState; MODULE_COUNT], DriveError> {
        if !velocity.is_finite() {
            return Err(DriveError::NonFiniteCommand);
        }

        let mut velocity = if field_relative {
            ChassisVelocity::from_field_relative(velocity, self.field_heading())
        } else {
            velocity
        };
        if self.slow_mode() {
            velocity = velocity.scaled(self.slow_mode_multiplier);
        }

        let corrected = self.skew.compensate(&velocity);
        let mut states = self.kinematics.to_wheel_vectors(&corrected);
        desaturate(
            &mut states,
            &velocity,
            self.limits.absolute_max,
            self.limits.max_translational,
            self.limits.max_rotational,
        );

        let mut first_error = None;
        for (module, state) in self.modules.iter().zip(states.iter()) {
            let mut module = module.lock();
            if let Err(e) = module.set_desired_state(*state) {
                warn!("Module {} ({}) rejected command: {}", module.index(), module.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(states),
        }
    }

    pub fn field_oriented_drive(
        &self,
        velocity: ChassisVelocity,
    ) -> Result<[ModuleState; MODULE_COUNT], DriveError> {
        self.drive(velocity, true)
    }

    pub fn robot_relative_drive(
        &self,
        velocity: ChassisVelocity,
    ) -> Result<[ModuleState; MODULE_COUNT], DriveError> {
        self.drive(velocity, false)
    }

    pub fn pose(&self) -> Pose2d {
        self.estimator.lock().pose()
    }

    /// Robot-frame velocity from measured module states
    pub fn robot_velocity(&self) -> Result<ChassisVelocity, DriveError> {
        let states = self.states()?;
        Ok(self.kinematics.to_chassis_velocity(&states))
    }

    pub fn states(&self) -> Result<[ModuleState; MODULE_COUNT], DriveError> {
        let mut states = [ModuleState::default(); MODULE_COUNT];
        for (state, module) in states.iter_mut().zip(self.modules.iter()) {
            *state = module.lock().state()?;
        }
        Ok(states)
    }

    pub fn module_positions(&self) -> Result<[ModulePosition; MODULE_COUNT], DriveError> {
        let mut positions = [ModulePosition::default(); MODULE_COUNT];
        for (position, module) in positions.iter_mut().zip(self.modules.iter()) {
            *position = module.lock().position()?;
        }
        Ok(positions)
    }

    /// Last commanded (optimized) state of every module
    pub fn desired_states(&self) -> [ModuleState; MODULE_COUNT] {
        std::array::from_fn(|i| self.modules[i].lock().desired_state())
    }

    /// One odometry step: read sensors, then integrate under the estimator lock.
    /// A sample that raced a pose or module reset is dropped and the current
    /// pose returned.
    pub fn update_odometry(&self) -> Result<Pose2d, DriveError> {
        let generation = self.estimator.lock().reset_generation();
        let positions = self.module_positions()?;
        let gyro = self.orientation()?.yaw_rotation();
        let timestamp = self.now();

        let mut estimator = self.estimator.lock();
        match estimator.update_odometry_if_current(generation, timestamp, gyro, &positions) {
            Some(pose) => Ok(pose),
            None => {
                debug!("Odometry sample overlapped a reset, dropped");
                Ok(estimator.pose())
            }
        }
    }

    pub fn add_vision_measurement(
        &self,
        measurement: &VisionMeasurement,
    ) -> Result<Pose2d, RejectedMeasurement> {
        self.estimator.lock().add_vision_measurement(measurement)
    }

    /// Poll a vision source once. Errors and rejected measurements are
    /// logged and treated as no measurement this cycle.
    pub fn poll_vision(&self, source: &mut dyn VisionSource) -> Option<Pose2d> {
        let measurement = match source.poll(self.now()) {
            Ok(Some(measurement)) => measurement,
            Ok(None) => return None,
            Err(e) => {
                debug!("Vision source error: {}", e);
                return None;
            }
        };

        match self.add_vision_measurement(&measurement) {
            Ok(pose) => Some(pose),
            Err(e) => {
                debug!("Vision measurement rejected: {}", e);
                None
            }
        }
    }

    pub fn set_vision_std_devs(&self, std_devs: StdDevs) {
        self.estimator.lock().set_vision_std_devs(std_devs);
    }

    /// Override the pose. The IMU yaw offset is recomputed so that yaw reads
    /// the new heading from now on; pitch and roll offsets are kept.
    pub fn reset_pose(&self, pose: Pose2d) -> Result<(), DriveError> {
        {
            let mut imu = self.imu.lock();
            let raw = imu.raw_orientation()?;
            let offset = imu.offset();
            imu.set_offset(Orientation::new(
                raw.yaw - pose.heading.radians(),
                offset.pitch,
                offset.roll,
            ));
        }

        let positions = self.module_positions()?;
        self.estimator.lock().reset_position(pose.heading, &positions, pose);
        info!(
            "Pose reset to ({:.3}, {:.3}, {:.1} deg)",
            pose.x,
            pose.y,
            pose.heading.degrees()
        );
        Ok(())
    }

    /// Zero every module's distance and re-anchor odometry at the current pose.
    /// Travel since the last odometry step is integrated first.
    pub fn reset_module_positions(&self) -> Result<(), DriveError> {
        let mut estimator = self.estimator.lock();

        let positions = self.module_positions()?;
        let gyro = self.orientation()?.yaw_rotation();
        let pose = estimator.update_odometry(self.now(), gyro, &positions);

        let mut first_error = None;
        for module in &self.modules {
            if let Err(e) = module.lock().reset_position() {
                first_error.get_or_insert(e);
            }
        }
        let positions = self.module_positions()?;
        estimator.reset_position(gyro, &positions, pose);
        debug!("Module positions zeroed at ({:.3}, {:.3})", pose.x, pose.y);
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the new state
    pub fn toggle_slow_mode(&self) -> bool {
        let enabled = !self.slow_mode.fetch_xor(true, Ordering::SeqCst);
        info!("Slow mode {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    pub fn slow_mode(&self) -> bool {
        self.slow_mode.load(Ordering::SeqCst)
    }

    /// Scale applied to commands while slow mode is on
    pub fn slow_mode_multiplier(&self) -> f64 {
        self.slow_mode_multiplier
    }

    pub fn stop(&self) -> Result<(), DriveError> {
        let mut first_error = None;
        for module in &self.modules {
            if let Err(e) = module.lock().stop() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn set_brake_mode(&self, enabled: bool) -> Result<(), DriveError> {
        for module in &self.modules {
            module.lock().set_brake_mode(enabled)?;
        }
        info!("Brake mode {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    pub fn set_current_limits(&self, drive_amps: f64, steer_amps: f64) -> Result<(), DriveError> {
        for module in &self.modules {
            module.lock().set_current_limits(drive_amps, steer_amps)?;
        }
        Ok(())
    }

    pub fn set_voltage_compensation(&self, volts: f64) -> Result<(), DriveError> {
        for module in &self.modules {
            module.lock().set_voltage_compensation(volts)?;
        }
        info!("Voltage compensation at {:.1} V", volts);
        Ok(())
    }

    /// IMU orientation with the software offset applied, radians
    pub fn orientation(&self) -> Result<Orientation, DriveError> {
        Ok(self.imu.lock().orientation()?)
    }

    pub fn yaw(&self) -> Result<f64, DriveError> {
        Ok(self.orientation()?.yaw)
    }

    pub fn pitch(&self) -> Result<f64, DriveError> {
        Ok(self.orientation()?.pitch)
    }

    pub fn roll(&self) -> Result<f64, DriveError> {
        Ok(self.orientation()?.roll)
    }

    pub fn absolute_max_speed(&self) -> f64 {
        self.limits.absolute_max
    }

    pub fn max_translational_speed(&self) -> f64 {
        self.limits.max_translational
    }

    pub fn max_rotational_speed(&self) -> f64 {
        self.limits.max_rotational
    }

    /// True if any module is running without its absolute encoder
    pub fn is_degraded(&self) -> bool {
        self.modules.iter().any(|m| m.lock().is_degraded())
    }

    /// Heading used for field-relative commands: the IMU yaw, or the
    /// estimated heading if the IMU cannot be read
    fn field_heading(&self) -> Rotation2d {
        match self.orientation() {
            Ok(orientation) => orientation.yaw_rotation(),
            Err(e) => {
                debug!("IMU read failed, using estimated heading: {}", e);
                self.pose().heading
            }
        }
    }
}
