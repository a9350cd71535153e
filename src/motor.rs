//! Motor descriptors
//!
//! A [`MotorDescriptor`] is the live, backend-agnostic handle for one motor.
//! Its static part comes from the configuration entry; its dynamic part is
//! split in two lock-free cells:
//!
//! - the present state, written only by the owning controller on each tick
//! - the goal, written by clients and picked up on the controller's next tick
//!
//! Readers never block writers and a reader never sees a half-written state.

use crate::config::{validate_name, MotorConfig, Orientation, RobotConfig};
use crate::{ArmatureError, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

/// Motor models the resolver knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MotorModel {
    #[serde(rename = "AX-12")]
    Ax12,
    #[serde(rename = "AX-18")]
    Ax18,
    #[serde(rename = "RX-24")]
    Rx24,
    #[serde(rename = "RX-28")]
    Rx28,
    #[serde(rename = "RX-64")]
    Rx64,
    #[serde(rename = "MX-28")]
    Mx28,
    #[serde(rename = "MX-64")]
    Mx64,
    #[serde(rename = "MX-106")]
    Mx106,
    #[serde(rename = "EX-106")]
    Ex106,
    #[serde(rename = "XL-320")]
    Xl320,
    #[serde(rename = "SR-RH4D")]
    SrRh4d,
    #[serde(rename = "generic")]
    Generic,
}

impl MotorModel {
    pub fn name(self) -> &'static str {
        match self {
            MotorModel::Ax12 => "AX-12",
            MotorModel::Ax18 => "AX-18",
            MotorModel::Rx24 => "RX-24",
            MotorModel::Rx28 => "RX-28",
            MotorModel::Rx64 => "RX-64",
            MotorModel::Mx28 => "MX-28",
            MotorModel::Mx64 => "MX-64",
            MotorModel::Mx106 => "MX-106",
            MotorModel::Ex106 => "EX-106",
            MotorModel::Xl320 => "XL-320",
            MotorModel::SrRh4d => "SR-RH4D",
            MotorModel::Generic => "generic",
        }
    }

    /// Nominal angular range in degrees, used when the entry gives no limits
    pub fn nominal_limits(self) -> Option<(f64, f64)> {
        match self {
            MotorModel::Ax12
            | MotorModel::Ax18
            | MotorModel::Rx24
            | MotorModel::Rx28
            | MotorModel::Rx64
            | MotorModel::Ex106
            | MotorModel::Xl320 => Some((-150.0, 150.0)),
            MotorModel::Mx28 | MotorModel::Mx64 | MotorModel::Mx106 | MotorModel::SrRh4d => {
                Some((-180.0, 180.0))
            }
            MotorModel::Generic => None,
        }
    }
}

impl FromStr for MotorModel {
    type Err = ArmatureError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();

        let model = match normalized.as_str() {
            "AX12" | "AX12A" | "AX12W" => MotorModel::Ax12,
            "AX18" => MotorModel::Ax18,
            "RX24" => MotorModel::Rx24,
            "RX28" => MotorModel::Rx28,
            "RX64" => MotorModel::Rx64,
            "MX28" => MotorModel::Mx28,
            "MX64" => MotorModel::Mx64,
            "MX106" => MotorModel::Mx106,
            "EX106" => MotorModel::Ex106,
            "XL320" => MotorModel::Xl320,
            "SRRH4D" => MotorModel::SrRh4d,
            "GENERIC" => MotorModel::Generic,
            _ => {
                return Err(ArmatureError::Configuration(format!(
                    "unknown motor model '{}'",
                    s
                )))
            }
        };
        Ok(model)
    }
}

impl fmt::Display for MotorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last synchronized state of a motor, in the joint frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorState {
    /// Degrees
    pub present_position: f64,
    /// Degrees per second, derived from consecutive readings
    pub present_speed: f64,
    /// Number of successful synchronizations applied to this motor
    pub tick: u64,
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) read_at: Option<Instant>,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            present_position: 0.0,
            present_speed: 0.0,
            tick: 0,
            synced_at: None,
            read_at: None,
        }
    }
}

/// Command record written by clients
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MotorGoal {
    /// Degrees, already clamped to the motor limits
    pub position: Option<f64>,
    /// A compliant motor is left free; its goal is not sent
    pub compliant: bool,
}

/// Live handle for one motor
pub struct MotorDescriptor {
    name: String,
    id: u32,
    model: MotorModel,
    offset: f64,
    orientation: Orientation,
    limits: Option<(f64, f64)>,
    present: ArcSwap<MotorState>,
    goal: ArcSwap<MotorGoal>,
    owner: Mutex<Option<String>>,
}

impl MotorDescriptor {
    /// Resolve one motor from a configuration document
    ///
    /// Pure function of its inputs: resolving one name never depends on
    /// another name having been resolved first.
    pub fn resolve(config: &RobotConfig, name: &str) -> Result<Self> {
        let raw = config.motor_entry(name).ok_or_else(|| {
            ArmatureError::Configuration(format!("motor '{}' is not defined in `motors`", name))
        })?;
        let entry = MotorConfig::parse(name, raw)?;
        Self::from_config(name, &entry)
    }

    /// Build a descriptor from an already parsed entry
    pub fn from_config(name: &str, entry: &MotorConfig) -> Result<Self> {
        validate_name("motor", name)?;

        let model = match entry.model.as_deref() {
            Some(model) => model.parse::<MotorModel>().map_err(|_| {
                ArmatureError::Configuration(format!(
                    "motors.{}: unknown motor model '{}'",
                    name, model
                ))
            })?,
            None => MotorModel::Generic,
        };

        if !entry.offset.is_finite() {
            return Err(ArmatureError::Configuration(format!(
                "motors.{}: offset must be a finite number",
                name
            )));
        }

        let limits = match entry.limits {
            Some([lower, upper]) => {
                if !(lower.is_finite() && upper.is_finite() && lower < upper) {
                    return Err(ArmatureError::Configuration(format!(
                        "motors.{}: limits must satisfy lower < upper (got [{}, {}])",
                        name, lower, upper
                    )));
                }
                Some((lower, upper))
            }
            None => model.nominal_limits(),
        };

        Ok(Self {
            name: name.to_string(),
            id: entry.id,
            model,
            offset: entry.offset,
            orientation: entry.orientation,
            limits,
            present: ArcSwap::from_pointee(MotorState::default()),
            goal: ArcSwap::from_pointee(MotorGoal::default()),
            owner: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn model(&self) -> MotorModel {
        self.model
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    /// Last synchronized state (non-blocking)
    pub fn state(&self) -> MotorState {
        **self.present.load()
    }

    pub fn present_position(&self) -> f64 {
        self.present.load().present_position
    }

    pub fn present_speed(&self) -> f64 {
        self.present.load().present_speed
    }

    pub fn goal(&self) -> MotorGoal {
        **self.goal.load()
    }

    /// Request a new goal position in degrees
    ///
    /// The value is clamped to the motor limits and applied on the owning
    /// controller's next tick. Non-finite values are ignored and the previous
    /// goal stays in place. Returns the goal stored after the call.
    pub fn set_goal_position(&self, degrees: f64) -> Option<f64> {
        if !degrees.is_finite() {
            warn!("Ignoring non-finite goal {} for motor '{}'", degrees, self.name);
            return self.goal().position;
        }
        let clamped = self.clamp(degrees);
        self.goal.rcu(|goal| MotorGoal {
            position: Some(clamped),
            ..**goal
        });
        Some(clamped)
    }

    /// Drop any pending goal so nothing is sent for this motor
    pub fn clear_goal(&self) {
        self.goal.rcu(|goal| MotorGoal {
            position: None,
            ..**goal
        });
    }

    pub fn set_compliant(&self, compliant: bool) {
        self.goal.rcu(|goal| MotorGoal {
            compliant,
            ..**goal
        });
    }

    pub fn is_compliant(&self) -> bool {
        self.goal.load().compliant
    }

    /// Name of the controller currently synchronizing this motor
    pub fn owner(&self) -> Option<String> {
        self.owner.lock().ok().and_then(|owner| owner.clone())
    }

    fn clamp(&self, degrees: f64) -> f64 {
        match self.limits {
            Some((lower, upper)) => degrees.clamp(lower, upper),
            None => degrees,
        }
    }

    /// Backend reading to joint frame
    pub fn from_backend(&self, raw: f64) -> f64 {
        self.orientation.sign() * raw - self.offset
    }

    /// Joint frame to backend command
    pub fn to_backend(&self, degrees: f64) -> f64 {
        self.orientation.sign() * (degrees + self.offset)
    }

    /// Goal to send this tick, in backend units
    pub(crate) fn pending_command(&self) -> Option<f64> {
        let goal = self.goal.load();
        if goal.compliant {
            return None;
        }
        goal.position.map(|position| self.to_backend(position))
    }

    /// Store a fresh backend reading; only the owning controller calls this
    pub(crate) fn record_reading(&self, raw: f64, read_at: Instant, synced_at: DateTime<Utc>) {
        let position = self.from_backend(raw);
        let previous = self.present.load();

        let speed = match previous.read_at {
            Some(last) => {
                let dt = read_at.saturating_duration_since(last).as_secs_f64();
                if dt > 0.0 {
                    (position - previous.present_position) / dt
                } else {
                    previous.present_speed
                }
            }
            None => 0.0,
        };

        self.present.store(Arc::new(MotorState {
            present_position: position,
            present_speed: speed,
            tick: previous.tick + 1,
            synced_at: Some(synced_at),
            read_at: Some(read_at),
        }));
    }

    /// Take synchronization ownership for a controller
    ///
    /// Fails with the current owner's name when another controller holds it.
    pub(crate) fn claim(&self, controller: &str) -> std::result::Result<(), String> {
        let mut owner = self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match owner.as_deref() {
            Some(current) if current != controller => Err(current.to_string()),
            _ => {
                *owner = Some(controller.to_string());
                Ok(())
            }
        }
    }

    /// Give up ownership if held by this controller
    pub(crate) fn release(&self, controller: &str) {
        let mut owner = self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if owner.as_deref() == Some(controller) {
            *owner = None;
        }
    }
}

impl fmt::Debug for MotorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotorDescriptor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("model", &self.model)
            .field("present_position", &self.present_position())
            .field("owner", &self.owner())
            .finish()
    }
}

/// Serializable view of one motor, used by monitoring and the CLI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorSnapshot {
    pub name: String,
    pub id: u32,
    pub model: MotorModel,
    pub present_position: f64,
    pub present_speed: f64,
    pub goal_position: Option<f64>,
    pub compliant: bool,
    pub tick: u64,
    pub owner: Option<String>,
}

impl From<&MotorDescriptor> for MotorSnapshot {
    fn from(motor: &MotorDescriptor) -> Self {
        let state = motor.state();
        let goal = motor.goal();
        Self {
            name: motor.name().to_string(),
            id: motor.id(),
            model: motor.model(),
            present_position: state.present_position,
            present_speed: state.present_speed,
            goal_position: goal.position,
            compliant: goal.compliant,
            tick: state.tick,
            owner: motor.owner(),
        }
    }
}
