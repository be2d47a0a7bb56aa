// Periodic tasks, command watchdog and zenoh wiring
//
// Three schedules run independently: odometry, vision and control (plus the
// plant in simulation). Each tick runs on the blocking pool because it talks
// to the serial bus; a tick that fails or panics is logged and skipped.
// Note: a watchdog is a safety mechanism that triggers a safe action if something goes wrong
// Eg. if the command source dies, the drivebase is commanded to zero velocity

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::{
    CMD_TIMEOUT, DrivebaseConfig, HEALTH_HZ, MotorConfig, TOPIC_CMD_BASE, TOPIC_CMD_DRIVEBASE,
    TOPIC_HEALTH, TOPIC_POSE, TOPIC_SENSOR_IMU, TOPIC_SENSOR_VISION,
};
use crate::drive::{ChassisVelocity, DriveError, Drivebase, MODULE_COUNT, SwerveModule};
use crate::geometry::{Pose2d, Rotation2d};
use crate::hardware::{
    FeetechBus, FeetechEncoder, FeetechMotor, HardwareError, Imu, SharedBus, SimImu,
    SimModuleHardware, SimPlant,
};
use crate::messages::{BaseCommand, DrivebaseReport, DrivebaseRequest, RuntimeHealth};
use crate::sensors::{SampleSubscriber, ZenohImu, ZenohVisionSource};

pub type BoxError = Box<dyn Error + Send + Sync>;
pub type TickResult = Result<(), BoxError>;

/// Latest drive command plus the staleness check on it
pub struct Watchdog {
    latest_cmd: Option<BaseCommand>,
    cmd_received_at: Instant,
    timeout: Duration,
    health: RuntimeHealth,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            timeout,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn on_command(&mut self, cmd: BaseCommand) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = Instant::now();
    }

    /// Command to execute this tick: the latest one, or zero if it is stale
    pub fn compute_command(&mut self, degraded: bool) -> (ChassisVelocity, bool) {
        let cmd_age = self.cmd_received_at.elapsed();

        let (command, health) = match &self.latest_cmd {
            Some(cmd) if cmd_age <= self.timeout => {
                let health = if degraded { RuntimeHealth::Degraded } else { RuntimeHealth::Ok };
                ((cmd.velocity(), cmd.field_relative), health)
            }
            _ => ((ChassisVelocity::zero(), false), RuntimeHealth::CmdStale),
        };

        if health != self.health {
            match health {
                RuntimeHealth::CmdStale => {
                    warn!("Command stale ({:?} old), stopping robot", cmd_age)
                }
                RuntimeHealth::Degraded => warn!("Driving degraded: absolute encoder unavailable"),
                RuntimeHealth::Ok => info!("Commands flowing, health ok"),
            }
            self.health = health;
        }
        command
    }
}

/// Run `tick` every `period` on the blocking pool until the handle is aborted.
/// Missed ticks are skipped rather than bunched up.
pub fn spawn_periodic<F>(name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
where
    F: FnMut() -> TickResult + Send + 'static,
{
    let tick = Arc::new(Mutex::new(tick));
    tokio::spawn(async move {
        let mut schedule = interval(period);
        schedule.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            schedule.tick().await;
            let tick = Arc::clone(&tick);
            match tokio::task::spawn_blocking(move || {
                let mut tick = tick.lock();
                (*tick)()
            })
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} tick failed: {}", name, e),
                Err(e) if e.is_panic() => error!("{} tick panicked, skipping", name),
                Err(e) => {
                    info!("{} schedule stopped: {}", name, e);
                    break;
                }
            }
        }
    })
}

fn collect_modules(
    modules: [Result<SwerveModule, DriveError>; MODULE_COUNT],
) -> Result<[SwerveModule; MODULE_COUNT], DriveError> {
    let [front_left, front_right, back_left, back_right] = modules;
    Ok([front_left?, front_right?, back_left?, back_right?])
}

/// Drivebase on simulated hardware, plus the plant that moves it
pub fn build_sim_drivebase(
    config: &DrivebaseConfig,
) -> Result<(Drivebase, SimPlant), DriveError> {
    let hardware: [SimModuleHardware; MODULE_COUNT] =
        std::array::from_fn(|i| SimModuleHardware::new(config.modules[i].encoder_offset()));
    let imu = SimImu::new();

    let modules = collect_modules(std::array::from_fn(|i| {
        SwerveModule::new(
            i,
            config.modules[i].name.clone(),
            Box::new(hardware[i].drive.clone()),
            Box::new(hardware[i].steer.clone()),
            Box::new(hardware[i].encoder.clone()),
            config.max_module_speed,
        )
    }))?;

    let drivebase = Drivebase::new(config, modules, Box::new(imu.clone()))?;
    let plant = SimPlant::new(drivebase.kinematics().clone(), hardware, imu);
    Ok((drivebase, plant))
}

fn feetech_module(
    bus: &SharedBus,
    config: &DrivebaseConfig,
    index: usize,
) -> Result<SwerveModule, DriveError> {
    let module = &config.modules[index];
    let drive = FeetechMotor::drive(Arc::clone(bus), module.drive_id, config.motor.wheel_radius)?;
    let steer = FeetechMotor::steer(Arc::clone(bus), module.steer_id)?;
    let encoder = FeetechEncoder::new(Arc::clone(bus), module.steer_id, module.encoder_offset());
    SwerveModule::new(
        index,
        module.name.clone(),
        Box::new(drive),
        Box::new(steer),
        Box::new(encoder),
        config.max_module_speed,
    )
}

/// Drivebase on Feetech servos sharing one serial bus
pub fn build_feetech_drivebase(
    config: &DrivebaseConfig,
    imu: Box<dyn Imu>,
) -> Result<Drivebase, BoxError> {
    info!("Opening servo bus on {}", config.motor.port);
    let bus: SharedBus = Arc::new(Mutex::new(FeetechBus::open(&config.motor.port)?));

    let modules = collect_modules(std::array::from_fn(|i| feetech_module(&bus, config, i)))?;
    Ok(Drivebase::new(config, modules, imu)?)
}

/// Push the motor settings to every module. Voltage compensation is optional
/// per controller: one that cannot do it is left as is.
fn configure_motors(drivebase: &Drivebase, motor: &MotorConfig) -> Result<(), DriveError> {
    drivebase.set_brake_mode(motor.brake)?;
    drivebase.set_current_limits(motor.drive_current_limit, motor.steer_current_limit)?;

    if let Some(volts) = motor.voltage_compensation {
        match drivebase.set_voltage_compensation(volts) {
            Ok(()) => {}
            Err(DriveError::Hardware(e @ HardwareError::Unsupported { .. })) => {
                warn!("Voltage compensation not applied: {}", e)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn apply_request(drivebase: &Drivebase, request: DrivebaseRequest) -> Result<(), DriveError> {
    info!("Drivebase request: {:?}", request);
    match request {
        DrivebaseRequest::ResetPose { x, y, heading_deg } => {
            drivebase.reset_pose(Pose2d::new(x, y, Rotation2d::from_degrees(heading_deg)))
        }
        DrivebaseRequest::ToggleSlowMode => {
            drivebase.toggle_slow_mode();
            Ok(())
        }
        DrivebaseRequest::SetBrakeMode { enabled } => drivebase.set_brake_mode(enabled),
        DrivebaseRequest::ResetModulePositions => drivebase.reset_module_positions(),
    }
}

fn drain_json<T: serde::de::DeserializeOwned>(
    subscriber: &SampleSubscriber,
    what: &str,
    mut f: impl FnMut(T),
) {
    while let Ok(Some(sample)) = subscriber.try_recv() {
        let payload = sample.payload().to_bytes();
        match serde_json::from_slice::<T>(&payload) {
            Ok(value) => f(value),
            Err(e) => warn!("Failed to parse {}: {}", what, e),
        }
    }
}

/// One control tick: apply requests, feed the watchdog, drive
fn control_tick(
    drivebase: &Drivebase,
    watchdog: &mut Watchdog,
    cmd_sub: &SampleSubscriber,
    request_sub: &SampleSubscriber,
    health_tx: &watch::Sender<RuntimeHealth>,
) -> TickResult {
    let mut requests = Vec::new();
    drain_json::<DrivebaseRequest>(request_sub, "drivebase request", |r| requests.push(r));
    for request in requests {
        if let Err(e) = apply_request(drivebase, request) {
            warn!("Drivebase request failed: {}", e);
        }
    }

    drain_json::<BaseCommand>(cmd_sub, "command", |cmd| watchdog.on_command(cmd));

    let (velocity, field_relative) = watchdog.compute_command(drivebase.is_degraded());
    health_tx.send_replace(watchdog.health());
    drivebase.drive(velocity, field_relative)?;
    Ok(())
}

/// Published pose heading is wrapped to (-PI, PI]; the estimate itself
/// follows the gyro and keeps counting turns.
fn drivebase_report(drivebase: &Drivebase, pose: Pose2d) -> Result<DrivebaseReport, DriveError> {
    let slow_mode = drivebase.slow_mode();
    Ok(DrivebaseReport {
        timestamp: drivebase.now(),
        pose: Pose2d::from_parts(pose.translation(), pose.heading.wrapped()),
        velocity: drivebase.robot_velocity()?,
        desired_states: drivebase.desired_states().to_vec(),
        slow_mode,
        speed_scale: if slow_mode { drivebase.slow_mode_multiplier() } else { 1.0 },
    })
}

fn odometry_tick(
    drivebase: &Drivebase,
    report_tx: &watch::Sender<Option<DrivebaseReport>>,
) -> TickResult {
    let pose = drivebase.update_odometry()?;
    report_tx.send_replace(Some(drivebase_report(drivebase, pose)?));
    Ok(())
}

pub struct RunOptions {
    pub config: DrivebaseConfig,
    /// Simulated hardware instead of the servo bus
    pub simulate: bool,
}

pub async fn run(options: RunOptions) -> Result<(), BoxError> {
    let RunOptions { config, simulate } = options;
    config.validate()?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let cmd_sub = session.declare_subscriber(TOPIC_CMD_BASE).await?;
    let request_sub = session.declare_subscriber(TOPIC_CMD_DRIVEBASE).await?;
    let vision_sub = session.declare_subscriber(TOPIC_SENSOR_VISION).await?;
    let pub_pose = session.declare_publisher(TOPIC_POSE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let (drivebase, plant) = if simulate {
        info!("Running on simulated hardware");
        let (drivebase, plant) = build_sim_drivebase(&config)?;
        (drivebase, Some(plant))
    } else {
        let imu_sub = session.declare_subscriber(TOPIC_SENSOR_IMU).await?;
        info!("Subscribed to: {}", TOPIC_SENSOR_IMU);
        (build_feetech_drivebase(&config, Box::new(ZenohImu::new(imu_sub)))?, None)
    };
    configure_motors(&drivebase, &config.motor)?;
    let drivebase = Arc::new(drivebase);

    let (report_tx, mut report_rx) = watch::channel::<Option<DrivebaseReport>>(None);
    let (health_tx, health_rx) = watch::channel(RuntimeHealth::CmdStale);

    let mut tasks = Vec::new();

    let odometry_period = Duration::from_secs_f64(1.0 / config.odometry_hz);
    tasks.push(spawn_periodic("odometry", odometry_period, {
        let drivebase = Arc::clone(&drivebase);
        move || odometry_tick(&drivebase, &report_tx)
    }));

    let vision_period = Duration::from_secs_f64(1.0 / config.vision_hz);
    tasks.push(spawn_periodic("vision", vision_period, {
        let drivebase = Arc::clone(&drivebase);
        let mut vision = ZenohVisionSource::new(vision_sub);
        move || {
            drivebase.poll_vision(&mut vision);
            Ok(())
        }
    }));

    tasks.push(spawn_periodic("control", config.control_period_duration(), {
        let drivebase = Arc::clone(&drivebase);
        let mut watchdog = Watchdog::new(CMD_TIMEOUT);
        move || control_tick(&drivebase, &mut watchdog, &cmd_sub, &request_sub, &health_tx)
    }));

    if let Some(mut plant) = plant {
        let dt = config.control_period;
        tasks.push(spawn_periodic("sim", config.control_period_duration(), move || {
            plant.advance(dt);
            Ok(())
        }));
    }

    info!(
        "Runtime started: odometry {}Hz, vision {}Hz, control {:.0}Hz, {}ms watchdog timeout",
        config.odometry_hz,
        config.vision_hz,
        1.0 / config.control_period,
        CMD_TIMEOUT.as_millis()
    );
    info!(
        "Subscribed to: {}, {}, {}",
        TOPIC_CMD_BASE, TOPIC_CMD_DRIVEBASE, TOPIC_SENSOR_VISION
    );
    info!("Publishing to: {}, {}", TOPIC_POSE, TOPIC_HEALTH);

    let mut health_tick = interval(Duration::from_secs_f64(1.0 / HEALTH_HZ));
    health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = report_rx.changed() => {
                if changed.is_err() {
                    warn!("Odometry schedule ended");
                    break;
                }
                let json = match &*report_rx.borrow_and_update() {
                    Some(report) => Some(serde_json::to_string(report)?),
                    None => None,
                };
                if let Some(json) = json {
                    pub_pose.put(json).await?;
                }
            }
            _ = health_tick.tick() => {
                let health_json = serde_json::to_string(&*health_rx.borrow())?;
                pub_health.put(health_json).await?;
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    for task in &tasks {
        task.abort();
    }
    if let Err(e) = drivebase.stop() {
        warn!("Failed to stop drivebase: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn command(x_vel: f64) -> BaseCommand {
        BaseCommand {
            x_vel,
            y_vel: 0.0,
            theta_vel: 0.0,
            field_relative: false,
        }
    }

    #[test]
    fn test_watchdog_starts_stale() {
        let mut watchdog = Watchdog::new(CMD_TIMEOUT);
        let (velocity, _) = watchdog.compute_command(false);
        assert_eq!(velocity, ChassisVelocity::zero());
        assert_eq!(watchdog.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_watchdog_passes_fresh_command_then_times_out() {
        let mut watchdog = Watchdog::new(Duration::from_millis(30));
        watchdog.on_command(command(0.5));

        let (velocity, field_relative) = watchdog.compute_command(false);
        assert_eq!(velocity.vx, 0.5);
        assert!(!field_relative);
        assert_eq!(watchdog.health(), RuntimeHealth::Ok);

        watchdog.compute_command(true);
        assert_eq!(watchdog.health(), RuntimeHealth::Degraded);

        std::thread::sleep(Duration::from_millis(50));
        let (velocity, _) = watchdog.compute_command(false);
        assert_eq!(velocity, ChassisVelocity::zero());
        assert_eq!(watchdog.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_sim_drivebase_moves() {
        let config = DrivebaseConfig::default();
        let (drivebase, mut plant) = build_sim_drivebase(&config).unwrap();

        for _ in 0..50 {
            drivebase
                .drive(ChassisVelocity::new(0.5, 0.0, 0.0), true)
                .unwrap();
            plant.advance(config.control_period);
            drivebase.update_odometry().unwrap();
        }

        let pose = drivebase.pose();
        assert!((pose.x - 0.5).abs() < 1e-6, "x {}", pose.x);
        assert!((plant.pose().x - pose.x).abs() < 1e-6);
    }

    #[test]
    fn test_requests_apply() {
        let config = DrivebaseConfig::default();
        let (drivebase, _plant) = build_sim_drivebase(&config).unwrap();

        apply_request(&drivebase, DrivebaseRequest::ToggleSlowMode).unwrap();
        assert!(drivebase.slow_mode());

        apply_request(
            &drivebase,
            DrivebaseRequest::ResetPose {
                x: 2.0,
                y: 1.0,
                heading_deg: 180.0,
            },
        )
        .unwrap();
        let pose = drivebase.pose();
        assert_eq!((pose.x, pose.y), (2.0, 1.0));
        assert!((pose.heading.degrees().abs() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_motor_settings_reach_every_module() {
        let mut config = DrivebaseConfig::default();
        config.motor.voltage_compensation = Some(12.0);
        config.motor.brake = false;
        let hardware: [SimModuleHardware; MODULE_COUNT] =
            std::array::from_fn(|_| SimModuleHardware::new(Rotation2d::ZERO));
        let modules = collect_modules(std::array::from_fn(|i| {
            SwerveModule::new(
                i,
                config.modules[i].name.clone(),
                Box::new(hardware[i].drive.clone()),
                Box::new(hardware[i].steer.clone()),
                Box::new(hardware[i].encoder.clone()),
                config.max_module_speed,
            )
        }))
        .unwrap();
        let drivebase = Drivebase::new(&config, modules, Box::new(SimImu::new())).unwrap();

        configure_motors(&drivebase, &config.motor).unwrap();
        for module in &hardware {
            let drive = module.drive.snapshot();
            let steer = module.steer.snapshot();
            assert_eq!(drive.voltage_compensation, Some(12.0));
            assert_eq!(steer.voltage_compensation, Some(12.0));
            assert_eq!(drive.current_limit, Some(config.motor.drive_current_limit));
            assert_eq!(steer.current_limit, Some(config.motor.steer_current_limit));
            assert!(!drive.brake);
            assert_eq!(drive.leader, None);
        }
    }

    #[test]
    fn test_report_heading_wrapped_after_spinning() {
        let config = DrivebaseConfig::default();
        let (drivebase, mut plant) = build_sim_drivebase(&config).unwrap();

        // 2 rad/s for 3 s: almost a full turn past PI
        for _ in 0..150 {
            drivebase
                .drive(ChassisVelocity::new(0.0, 0.0, 2.0), false)
                .unwrap();
            plant.advance(config.control_period);
            drivebase.update_odometry().unwrap();
        }
        let pose = drivebase.pose();
        let raw = pose.heading.radians();
        assert!(raw > std::f64::consts::PI, "heading {}", raw);

        let report = drivebase_report(&drivebase, pose).unwrap();
        let heading = report.pose.heading.radians();
        assert!(heading > -std::f64::consts::PI && heading <= std::f64::consts::PI);
        assert!((report.pose.heading - pose.heading).wrapped().radians().abs() < 1e-9);
        assert_eq!((report.pose.x, report.pose.y), (pose.x, pose.y));
        assert_eq!(report.speed_scale, 1.0);

        drivebase.toggle_slow_mode();
        let report = drivebase_report(&drivebase, pose).unwrap();
        assert!(report.slow_mode);
        assert_eq!(report.speed_scale, config.slow_mode_multiplier);
    }

    #[tokio::test]
    async fn test_periodic_survives_errors_and_panics() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = spawn_periodic("test", Duration::from_millis(5), {
            let count = Arc::clone(&count);
            move || {
                let n = count.fetch_add(1, Ordering::SeqCst);
                match n {
                    1 => panic!("tick {} blew up", n),
                    2 => Err("tick failed".into()),
                    _ => Ok(()),
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        let ticks = count.load(Ordering::SeqCst);
        println!("ticks after panic and error: {}", ticks);
        assert!(ticks >= 5, "schedule stopped after {} ticks", ticks);
    }
}
