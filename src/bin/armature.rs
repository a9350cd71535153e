//! Armature command line
//!
//! - `inspect`: resolve a configuration and print its motors and groups as JSON
//! - `simulate`: assemble the robot against an in-process simulator and stream
//!   motor frames and controller health as JSON lines on stdout

use anyhow::{Context, Result};
use armature::{
    Assembler, BackendTarget, ConsoleTelemetry, MonitorOutput, MotorDescriptor, RobotConfig,
    SessionManager, TelemetryPublisher, VirtualSimulator,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "armature")]
#[command(about = "Configuration-driven robot assembly over simulated or physical motors")]
#[command(version)]
struct Args {
    /// Path to the robot configuration file (YAML or JSON)
    #[arg(short, long, global = true, env = "ARMATURE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the configuration and print motors and groups
    Inspect,
    /// Run the robot against an in-process simulator
    Simulate {
        /// Scene name announced to the simulator
        #[arg(long, default_value = "robot.ttt")]
        scene: String,
        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(long)]
        duration: Option<f64>,
        /// Monitor publication rate in Hz
        #[arg(long, default_value_t = 10)]
        rate: u32,
        /// Sweep every motor through a sine wave of this amplitude (degrees)
        #[arg(long)]
        wave: Option<f64>,
        /// Only print frames when something changed
        #[arg(long)]
        dynamic: bool,
        /// Also publish telemetry on Zenoh under this prefix
        #[arg(long)]
        zenoh_prefix: Option<String>,
    },
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .unwrap_or_else(|| "config/robot.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let config_path = args.get_config_path();
    info!("Using config: {}", config_path);
    let config = RobotConfig::load_from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    match args.command {
        Command::Inspect => inspect(&config).await,
        Command::Simulate {
            scene,
            duration,
            rate,
            wave,
            dynamic,
            zenoh_prefix,
        } => {
            let telemetry = telemetry_for(zenoh_prefix.as_deref()).await?;
            let duration = duration.map(Duration::from_secs_f64);
            simulate(&config, scene, duration, rate, wave, dynamic, telemetry).await
        }
    }
}

async fn inspect(config: &RobotConfig) -> Result<()> {
    let motors = config
        .motor_names()
        .map(|name| MotorDescriptor::resolve(config, name).map(Arc::new))
        .collect::<armature::Result<Vec<_>>>()
        .context("Failed to resolve motors")?;
    let aliases = armature::AliasIndex::build(&motors, &config.group_definitions()?)
        .context("Failed to build group index")?;

    let groups: serde_json::Map<String, serde_json::Value> = aliases
        .group_names()
        .map(|name| {
            let members: Vec<&str> = aliases
                .group(name)
                .unwrap_or_default()
                .iter()
                .map(|m| m.name())
                .collect();
            (name.to_string(), serde_json::json!(members))
        })
        .collect();
    let motors: Vec<serde_json::Value> = motors
        .iter()
        .map(|m| {
            serde_json::json!({
                "name": m.name(),
                "id": m.id(),
                "model": m.model(),
                "offset": m.offset(),
                "orientation": m.orientation(),
                "limits": m.limits(),
                "groups": aliases.groups_of(m.name()),
            })
        })
        .collect();

    let report = serde_json::json!({ "motors": motors, "motorgroups": groups });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn telemetry_for(zenoh_prefix: Option<&str>) -> Result<Arc<dyn TelemetryPublisher>> {
    match zenoh_prefix {
        #[cfg(feature = "zenoh-integration")]
        Some(prefix) => {
            let publisher = armature::ZenohPublisher::new(prefix)
                .await
                .context("Failed to set up Zenoh telemetry")?;
            Ok(Arc::new(publisher))
        }
        #[cfg(not(feature = "zenoh-integration"))]
        Some(_) => {
            warn!("Zenoh integration not enabled, printing telemetry to stdout only");
            Ok(Arc::new(ConsoleTelemetry::new()))
        }
        None => Ok(Arc::new(ConsoleTelemetry::new())),
    }
}

async fn simulate(
    config: &RobotConfig,
    scene: String,
    duration: Option<Duration>,
    rate: u32,
    wave: Option<f64>,
    dynamic: bool,
    telemetry: Arc<dyn TelemetryPublisher>,
) -> Result<()> {
    let simulator = VirtualSimulator::new().with_scene(&scene, config.motor_names());
    let sessions = SessionManager::global();

    let robot = match Assembler::new(Arc::clone(&sessions))
        .with_simulator(Arc::new(simulator))
        .assemble(config, &BackendTarget::simulated("127.0.0.1", 19997, scene))
        .await
    {
        Ok(robot) => robot,
        Err(e) => {
            error!("Assembly failed ({}): {}", e.kind(), e);
            return Err(e.into());
        }
    };
    info!("Robot ready: {} motor(s)", robot.motors().len());

    let mut monitor = MonitorOutput::new(rate, dynamic, 2, telemetry);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(rate.max(1))));
    let started = Instant::now();
    let deadline = duration.map(|d| tokio::time::Instant::now() + d);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = sleep_until(deadline) => {
                info!("Run duration elapsed");
                break;
            }
            _ = ticker.tick() => {
                if let Some(amplitude) = wave {
                    let phase = started.elapsed().as_secs_f64();
                    for (index, motor) in robot.motors().iter().enumerate() {
                        motor.set_goal_position(amplitude * (phase + index as f64 * 0.5).sin());
                    }
                }
                if let Err(e) = monitor.observe(&robot).await {
                    warn!("Failed to publish telemetry: {}", e);
                }
            }
        }
    }

    sessions.close_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
