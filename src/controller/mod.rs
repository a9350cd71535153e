//! Backend controllers
//!
//! A controller owns one backend session and the descriptors bound to it, and
//! keeps them synchronized from a background loop. Every controller exposes
//! the same capability set, [`MotorController`], so the assembly never needs
//! to know which backend it is talking to.
//!
//! Backends plug in through [`BackendSession`]. The generic [`Controller`]
//! provides the state machine, retry policy and synchronization loop on top of
//! it; [`SimulatedController`] and [`PhysicalController`] are the two named
//! variants shipped with the crate.
//!
//! ```text
//! Unconnected -> Connecting -> Connected -> Bound -> Running <-> Degraded
//!                                                      \            /
//!                                                       `-> Stopped <'
//! ```

use crate::backend::{BackendKind, IoResult};
use crate::config::SyncConfig;
use crate::motor::MotorDescriptor;
use crate::session::SessionHandle;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod driver;
mod physical;
mod simulated;

pub use driver::Controller;
pub use physical::{BusSession, PhysicalController};
pub use simulated::{SimulatedController, SimulatorSession};

/// Controller lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Unconnected,
    Connecting,
    Connected,
    Bound,
    Running,
    Degraded,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Unconnected => "unconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::Bound => "bound",
            ControllerState::Running => "running",
            ControllerState::Degraded => "degraded",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Timing and retry knobs of a controller
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPolicy {
    pub sync_period: Duration,
    pub connect_timeout: Duration,
    pub bind_timeout: Duration,
    pub connect_attempts: u32,
    pub sync_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub shutdown_grace: Duration,
}

impl SyncPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay.saturating_mul(factor).min(self.max_retry_delay)
    }
}

impl From<&SyncConfig> for SyncPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            sync_period: Duration::from_secs_f64(1.0 / f64::from(config.rate_hz().max(1))),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms()),
            bind_timeout: Duration::from_millis(config.bind_timeout_ms()),
            connect_attempts: config.connect_attempts().max(1),
            sync_attempts: config.sync_attempts().max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms()),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms()),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms()),
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Health snapshot of one controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerHealth {
    pub controller: String,
    pub backend: BackendKind,
    pub target: String,
    pub state: ControllerState,
    /// Successful synchronizations so far
    pub ticks: u64,
    pub consecutive_failures: u32,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ControllerHealth {
    pub fn new(controller: &str, backend: BackendKind, target: &str) -> Self {
        Self {
            controller: controller.to_string(),
            backend,
            target: target.to_string(),
            state: ControllerState::Unconnected,
            ticks: 0,
            consecutive_failures: 0,
            last_sync: None,
            last_error: None,
        }
    }

    /// Bound or running with no outstanding failure
    pub fn is_healthy(&self) -> bool {
        matches!(self.state, ControllerState::Bound | ControllerState::Running)
    }
}

/// Capability set shared by every controller variant
#[async_trait]
pub trait MotorController: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> BackendKind;

    fn target(&self) -> &str;

    fn state(&self) -> ControllerState;

    fn health(&self) -> ControllerHealth;

    /// Watch channel updated on every state change and tick
    fn subscribe_health(&self) -> watch::Receiver<ControllerHealth>;

    /// Descriptors currently bound to this controller
    fn motors(&self) -> Vec<Arc<MotorDescriptor>>;

    /// Open the backend session, retrying with backoff
    async fn connect(&self, timeout: Duration) -> Result<SessionHandle>;

    /// Locate every descriptor in the backend and take ownership of them
    async fn bind(&self, motors: &[Arc<MotorDescriptor>], timeout: Duration) -> Result<()>;

    /// One write-goals/read-positions round trip
    async fn synchronize(&self) -> Result<()>;

    /// Spawn the background synchronization loop
    fn start(self: Arc<Self>) -> Result<()>;

    /// Stop the loop and release the session; safe to call repeatedly
    async fn shutdown(&self) -> Result<()>;
}

/// Session with one backend, as driven by [`Controller`]
///
/// A controller dropped without `shutdown` never gets to call `close`, it only
/// drops the session. Implementations must therefore disconnect from the
/// backend in their own `Drop` (or in the `Drop` of the link they own).
#[async_trait]
pub trait BackendSession: Send + 'static {
    /// Backend-side identity of a located motor
    type Handle: Clone + fmt::Debug + Eq + Hash + Send + Sync + 'static;

    fn backend(&self) -> BackendKind;

    /// Key used to lease the target in the session manager
    fn target(&self) -> String;

    /// How binding errors raised by `prepare` name the failing object
    fn setup_label(&self) -> String {
        "backend setup".to_string()
    }

    async fn open(&mut self) -> IoResult<()>;

    /// Runs once between connect and motor lookup
    async fn prepare(&mut self) -> IoResult<()> {
        Ok(())
    }

    async fn locate(&mut self, motor: &MotorDescriptor) -> IoResult<Self::Handle>;

    /// Present positions in degrees, motor frame, one per handle
    async fn read_positions(&mut self, handles: &[Self::Handle]) -> IoResult<Vec<f64>>;

    /// Goal positions in degrees, motor frame
    async fn write_goal_positions(&mut self, goals: &[(Self::Handle, f64)]) -> IoResult<()>;

    async fn close(&mut self);
}
