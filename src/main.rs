use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::DrivebaseConfig;
use swerve_zenoh_runtime::runtime::{self, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "swerve-zenoh-runtime")]
#[command(about = "Swerve drivebase runtime: kinematics, odometry and vision fusion over zenoh")]
struct Args {
    /// Drivebase config (JSON); built-in defaults if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run on simulated motors, encoders and IMU
    #[arg(long)]
    sim: bool,

    /// Serial port for the servo bus (overrides the config)
    #[arg(short, long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match DrivebaseConfig::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => DrivebaseConfig::default(),
    };
    if let Some(port) = args.port {
        config.motor.port = port;
    }

    let simulate = args.sim || !config.motor.enabled;
    if let Err(e) = runtime::run(RunOptions { config, simulate }).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
