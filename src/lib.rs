//! Armature - configuration-driven robot assembly
//!
//! Builds a controllable robot object graph from a declarative configuration
//! and binds it to either a remote simulator or a physical motor bus through
//! one shared controller abstraction. The same configuration yields the same
//! addressable motors and groups on both backends.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use armature::{from_simulator, RobotConfig, SessionManager, VirtualSimulator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RobotConfig::load_from_path("config/robot.yaml")?;
//!     let simulator = VirtualSimulator::new().with_scene("poppy.ttt", config.motor_names());
//!
//!     let robot = from_simulator(
//!         &config,
//!         "127.0.0.1",
//!         19997,
//!         "poppy.ttt",
//!         Arc::new(simulator),
//!         SessionManager::global(),
//!     )
//!     .await?;
//!
//!     for motor in robot.group("l_arm").unwrap_or_default() {
//!         motor.set_goal_position(0.0);
//!     }
//!     println!("healthy: {}", robot.is_healthy());
//!
//!     robot.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **RobotConfig**: parsed configuration document
//! - **MotorDescriptor**: live per-motor state, shared by every view
//! - **AliasIndex**: motor and group lookup by name
//! - **MotorController**: backend session plus synchronization loop
//! - **Assembler**: wires the above into a **RobotAssembly**
//! - **SessionManager**: one lease per backend target
//! - **TelemetryPublisher**: transport-agnostic telemetry interface

pub mod alias;
pub mod assembly;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod monitoring;
pub mod motor;
pub mod robot;
pub mod session;
pub mod telemetry;
pub mod zenoh_publisher;

pub use alias::{Alias, AliasIndex};
pub use assembly::{from_bus, from_simulator, Assembler};
pub use backend::{
    BackendKind, BackendTarget, BusLink, MotorBus, SimulatorIo, SimulatorLink, VirtualBus,
    VirtualSimulator,
};
pub use config::{ControllerDefinition, MotorConfig, Orientation, RobotConfig, SyncConfig};
pub use controller::{
    BackendSession, Controller, ControllerHealth, ControllerState, MotorController,
    PhysicalController, SimulatedController, SyncPolicy,
};
pub use error::{ArmatureError, BackendIoError, Result};
pub use monitoring::MonitorOutput;
pub use motor::{MotorDescriptor, MotorGoal, MotorModel, MotorSnapshot, MotorState};
pub use robot::RobotAssembly;
pub use session::{SessionHandle, SessionManager};
pub use telemetry::{ConsoleTelemetry, HealthData, MotorsData, NoOpTelemetry, TelemetryPublisher};
pub use zenoh_publisher::ZenohPublisher;
