// Pose estimation: wheel odometry fused with latency-stamped vision poses
//
// Odometry is integrated at the high rate and every sample is kept in a short
// time-ordered history. A vision pose captured at time t is blended into the
// estimate as it was at t (Kalman-style, per-axis gain), and the odometry
// recorded after t is replayed on top of the corrected pose, so wheel motion
// newer than the camera frame is never thrown away.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::MODULE_COUNT;
use super::kinematics::{ModulePosition, SwerveKinematics};
use crate::geometry::{Pose2d, Rotation2d, Twist2d};

/// Standard deviations are clamped to at least this before use
pub const STD_DEV_EPSILON: f64 = 1e-6;

/// Default length of the odometry history, seconds
pub const DEFAULT_HISTORY_SECONDS: f64 = 1.5;

/// Per-axis standard deviations (x and y in meters, heading in radians).
/// Only their relative size matters: it sets how far a vision pose pulls the
/// estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StdDevs {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl StdDevs {
    pub const fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    pub const fn uniform(value: f64) -> Self {
        Self::new(value, value, value)
    }

    fn variances(&self) -> [f64; 3] {
        [self.x, self.y, self.heading].map(|s| {
            let s = s.abs().max(STD_DEV_EPSILON);
            s * s
        })
    }
}

/// Steady-state gain for each axis given state (q) and measurement (r) variances:
/// k = q / (q + sqrt(q * r))
pub fn vision_gain(state: &StdDevs, vision: &StdDevs) -> [f64; 3] {
    let q = state.variances();
    let r = vision.variances();
    std::array::from_fn(|i| q[i] / (q[i] + (q[i] * r[i]).sqrt()))
}

/// A pose observed by a vision pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisionMeasurement {
    pub pose: Pose2d,
    /// Capture time on the drivebase clock, seconds
    pub timestamp: f64,
    /// Overrides the configured vision trust for this measurement
    pub std_devs: Option<StdDevs>,
}

impl VisionMeasurement {
    pub fn new(pose: Pose2d, timestamp: f64) -> Self {
        Self {
            pose,
            timestamp,
            std_devs: None,
        }
    }

    pub fn with_std_devs(mut self, std_devs: StdDevs) -> Self {
        self.std_devs = Some(std_devs);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum RejectedMeasurement {
    #[error("No odometry history to apply the measurement to")]
    NoHistory,

    #[error("Measurement at {timestamp:.3}s predates oldest odometry sample at {oldest:.3}s")]
    Stale { timestamp: f64, oldest: f64 },

    #[error("Measurement contains non-finite values")]
    NonFinite,
}

/// Dead-reckoning from module positions and gyro heading
#[derive(Debug, Clone)]
pub struct SwerveOdometry {
    kinematics: SwerveKinematics,
    pose: Pose2d,
    gyro_offset: Rotation2d,
    previous_angle: Rotation2d,
    previous_positions: [ModulePosition; MODULE_COUNT],
}

impl SwerveOdometry {
    pub fn new(
        kinematics: SwerveKinematics,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
        initial_pose: Pose2d,
    ) -> Self {
        Self {
            kinematics,
            pose: initial_pose,
            gyro_offset: initial_pose.heading - gyro,
            previous_angle: initial_pose.heading,
            previous_positions: *positions,
        }
    }

    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    pub fn kinematics(&self) -> &SwerveKinematics {
        &self.kinematics
    }

    /// Re-anchor at `pose`; the gyro keeps reading whatever it reads
    pub fn reset(
        &mut self,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
        pose: Pose2d,
    ) {
        self.pose = pose;
        self.previous_angle = pose.heading;
        self.gyro_offset = pose.heading - gyro;
        self.previous_positions = *positions;
    }

    /// Integrate the motion since the previous call. Heading comes from the
    /// gyro; translation from the module deltas.
    pub fn update(
        &mut self,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
    ) -> Pose2d {
        let angle = gyro + self.gyro_offset;

        let mut twist = self.kinematics.to_twist(&self.previous_positions, positions);
        twist.dtheta = (angle - self.previous_angle).wrapped().radians();

        let moved = self.pose.exp(&twist);
        self.previous_positions = *positions;
        self.previous_angle = angle;
        self.pose = Pose2d::from_parts(moved.translation(), angle);
        self.pose
    }
}

/// Snapshot of the odometry inputs and output at one instant
#[derive(Debug, Clone, Copy)]
struct OdometryRecord {
    pose: Pose2d,
    gyro: Rotation2d,
    positions: [ModulePosition; MODULE_COUNT],
}

pub struct PoseEstimator {
    odometry: SwerveOdometry,
    state_std_devs: StdDevs,
    vision_gain: [f64; 3],
    history: VecDeque<(f64, OdometryRecord)>,
    history_duration: f64,
    /// Bumped by every hard reset
    reset_generation: u64,
}

impl PoseEstimator {
    pub fn new(
        kinematics: SwerveKinematics,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
        initial_pose: Pose2d,
        state_std_devs: StdDevs,
        vision_std_devs: StdDevs,
    ) -> Self {
        Self {
            odometry: SwerveOdometry::new(kinematics, gyro, positions, initial_pose),
            state_std_devs,
            vision_gain: vision_gain(&state_std_devs, &vision_std_devs),
            history: VecDeque::new(),
            history_duration: DEFAULT_HISTORY_SECONDS,
            reset_generation: 0,
        }
    }

    pub fn with_history_duration(mut self, seconds: f64) -> Self {
        self.history_duration = seconds.max(0.0);
        self
    }

    pub fn pose(&self) -> Pose2d {
        self.odometry.pose()
    }

    pub fn set_vision_std_devs(&mut self, std_devs: StdDevs) {
        self.vision_gain = vision_gain(&self.state_std_devs, &std_devs);
    }

    /// Timestamp of the oldest odometry sample still buffered
    pub fn oldest_sample_time(&self) -> Option<f64> {
        self.history.front().map(|(t, _)| *t)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Changes whenever the estimate is re-anchored by `reset_position`.
    /// Sensor reads taken under an older generation no longer line up with
    /// the stored module positions.
    pub fn reset_generation(&self) -> u64 {
        self.reset_generation
    }

    /// Hard override: forget history and continue from `pose`
    pub fn reset_position(
        &mut self,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
        pose: Pose2d,
    ) {
        self.odometry.reset(gyro, positions, pose);
        self.history.clear();
        self.reset_generation = self.reset_generation.wrapping_add(1);
    }

    /// Like `update_odometry`, but drops the sample when a reset happened
    /// after `generation` was read
    pub fn update_odometry_if_current(
        &mut self,
        generation: u64,
        timestamp: f64,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
    ) -> Option<Pose2d> {
        if generation != self.reset_generation {
            return None;
        }
        Some(self.update_odometry(timestamp, gyro, positions))
    }

    /// Integrate one odometry sample taken at `timestamp` (seconds)
    pub fn update_odometry(
        &mut self,
        timestamp: f64,
        gyro: Rotation2d,
        positions: &[ModulePosition; MODULE_COUNT],
    ) -> Pose2d {
        let pose = self.odometry.update(gyro, positions);
        self.record(
            timestamp,
            OdometryRecord {
                pose,
                gyro,
                positions: *positions,
            },
        );
        pose
    }

    /// Blend a vision pose into the estimate and return the corrected current pose
    pub fn add_vision_measurement(
        &mut self,
        measurement: &VisionMeasurement,
    ) -> Result<Pose2d, RejectedMeasurement> {
        if !measurement.pose.is_finite() || !measurement.timestamp.is_finite() {
            return Err(RejectedMeasurement::NonFinite);
        }

        let (oldest, newest) = match (self.history.front(), self.history.back()) {
            (Some((oldest, _)), Some((newest, _))) => (*oldest, *newest),
            _ => return Err(RejectedMeasurement::NoHistory),
        };
        if measurement.timestamp < oldest {
            return Err(RejectedMeasurement::Stale {
                timestamp: measurement.timestamp,
                oldest,
            });
        }
        let timestamp = measurement.timestamp.min(newest);

        let gain = match measurement.std_devs {
            Some(std_devs) => vision_gain(&self.state_std_devs, &std_devs),
            None => self.vision_gain,
        };

        let sample = self.sample_at(timestamp).ok_or(RejectedMeasurement::NoHistory)?;
        let error = sample.pose.log(&measurement.pose);
        let corrected = sample.pose.exp(&Twist2d::new(
            gain[0] * error.dx,
            gain[1] * error.dy,
            gain[2] * error.dtheta,
        ));

        // Everything after the measurement is replayed on top of the correction
        let split = self.history.partition_point(|(t, _)| *t < timestamp);
        let replay: Vec<(f64, OdometryRecord)> = self
            .history
            .drain(split..)
            .filter(|(t, _)| *t > timestamp)
            .collect();

        self.odometry.reset(sample.gyro, &sample.positions, corrected);
        self.history.push_back((
            timestamp,
            OdometryRecord {
                pose: corrected,
                gyro: sample.gyro,
                positions: sample.positions,
            },
        ));

        debug!(
            "Vision correction at {:.3}s, replaying {} odometry samples",
            timestamp,
            replay.len()
        );
        for (t, record) in replay {
            self.update_odometry(t, record.gyro, &record.positions);
        }

        Ok(self.pose())
    }

    fn record(&mut self, timestamp: f64, record: OdometryRecord) {
        let index = self.history.partition_point(|(t, _)| *t < timestamp);
        match self.history.get_mut(index) {
            Some(entry) if entry.0 == timestamp => entry.1 = record,
            _ => self.history.insert(index, (timestamp, record)),
        }

        if let Some(&(newest, _)) = self.history.back() {
            while let Some(&(oldest, _)) = self.history.front() {
                if oldest >= newest - self.history_duration {
                    break;
                }
                self.history.pop_front();
            }
        }
    }

    /// Odometry state at `timestamp`, interpolated between buffered samples
    fn sample_at(&self, timestamp: f64) -> Option<OdometryRecord> {
        let (first_time, first) = *self.history.front()?;
        let (last_time, last) = *self.history.back()?;
        if timestamp <= first_time {
            return Some(first);
        }
        if timestamp >= last_time {
            return Some(last);
        }

        let upper = self.history.partition_point(|(t, _)| *t <= timestamp);
        let (lower_time, lower) = self.history[upper - 1];
        let (upper_time, upper) = self.history[upper];
        if timestamp == lower_time {
            return Some(lower);
        }

        let t = (timestamp - lower_time) / (upper_time - lower_time);
        Some(self.interpolate(&lower, &upper, t))
    }

    fn interpolate(&self, start: &OdometryRecord, end: &OdometryRecord, t: f64) -> OdometryRecord {
        let gyro = start.gyro.interpolate(end.gyro, t);
        let positions: [ModulePosition; MODULE_COUNT] =
            std::array::from_fn(|i| start.positions[i].interpolate(&end.positions[i], t));

        let mut twist = self.odometry.kinematics().to_twist(&start.positions, &positions);
        twist.dtheta = (gyro - start.gyro).wrapped().radians();

        OdometryRecord {
            pose: start.pose.exp(&twist),
            gyro,
            positions,
        }
    }
}
