//! Backend I/O boundary
//!
//! The simulator transport and the physical bus layer live outside this
//! crate. They are reached through two pairs of traits:
//!
//! - [`SimulatorIo`] opens a [`SimulatorLink`] to a remote simulator
//! - [`MotorBus`] opens a [`BusLink`] to a motor bus (serial port, USB2AX, ...)
//!
//! [`VirtualSimulator`] and [`VirtualBus`] are in-process implementations used
//! by the tests and the `simulate` command.

use crate::error::BackendIoError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

mod virtual_bus;
mod virtual_sim;

pub use virtual_bus::VirtualBus;
pub use virtual_sim::VirtualSimulator;

pub type IoResult<T> = std::result::Result<T, BackendIoError>;

/// Which kind of backend a controller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Simulated,
    Physical,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Simulated => f.write_str("simulated"),
            BackendKind::Physical => f.write_str("physical"),
        }
    }
}

/// Where the assembled robot lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendTarget {
    Simulated {
        host: String,
        port: u16,
        /// Scene to load before binding, `None` keeps whatever is loaded
        scene: Option<String>,
    },
    Physical {
        /// Bus address or device path
        address: String,
    },
}

impl BackendTarget {
    pub fn simulated(host: impl Into<String>, port: u16, scene: impl Into<String>) -> Self {
        BackendTarget::Simulated {
            host: host.into(),
            port,
            scene: Some(scene.into()),
        }
    }

    pub fn physical(address: impl Into<String>) -> Self {
        BackendTarget::Physical {
            address: address.into(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendTarget::Simulated { .. } => BackendKind::Simulated,
            BackendTarget::Physical { .. } => BackendKind::Physical,
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTarget::Simulated { host, port, .. } => write!(f, "{}:{}", host, port),
            BackendTarget::Physical { address } => f.write_str(address),
        }
    }
}

/// Opens sessions to a remote simulator
#[async_trait]
pub trait SimulatorIo: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> IoResult<Box<dyn SimulatorLink>>;
}

/// One open simulator session
///
/// Joint values are exchanged in radians. Dropping the link disconnects it.
#[async_trait]
pub trait SimulatorLink: Send {
    /// Scene currently loaded, if any
    async fn active_scene(&mut self) -> IoResult<Option<String>>;

    async fn load_scene(&mut self, scene: &str) -> IoResult<()>;

    /// Start the simulation; a running simulation is left as is
    async fn start_simulation(&mut self) -> IoResult<()>;

    /// Handle of the scene object with this name
    async fn object_handle(&mut self, name: &str) -> IoResult<i64>;

    async fn joint_positions(&mut self, handles: &[i64]) -> IoResult<Vec<f64>>;

    async fn set_joint_targets(&mut self, targets: &[(i64, f64)]) -> IoResult<()>;

    async fn close(&mut self);
}

/// Opens sessions to a motor bus
#[async_trait]
pub trait MotorBus: Send + Sync {
    async fn open(&self, address: &str) -> IoResult<Box<dyn BusLink>>;
}

/// One open bus session
///
/// Positions are exchanged in degrees, in the motor's own frame. Dropping the
/// link releases the port.
#[async_trait]
pub trait BusLink: Send {
    /// Whether a motor with this id answers
    async fn ping(&mut self, id: u32) -> IoResult<bool>;

    async fn read_positions(&mut self, ids: &[u32]) -> IoResult<Vec<f64>>;

    async fn write_goal_positions(&mut self, goals: &[(u32, f64)]) -> IoResult<()>;

    async fn close(&mut self);
}
