//! Telemetry abstraction
//!
//! Trait-based interface for publishing motor state and controller health to
//! any transport (stdout, Zenoh, ...), so the library stays transport-free.

use crate::controller::ControllerHealth;
use crate::motor::MotorSnapshot;
use async_trait::async_trait;
use serde::Serialize;

/// Motor positions at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorsData {
    /// Unix epoch seconds when the frame was taken
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub motors: Vec<MotorSnapshot>,
}

impl MotorsData {
    /// Build a frame with positions and speeds rounded to `decimal_places`
    pub fn new_rounded(mut motors: Vec<MotorSnapshot>, stime: f64, decimal_places: u32) -> Self {
        let multiplier = 10.0_f64.powi(decimal_places as i32);
        let round_value = |value: f64| (value * multiplier).round() / multiplier;

        for motor in &mut motors {
            motor.present_position = round_value(motor.present_position);
            motor.present_speed = round_value(motor.present_speed);
            motor.goal_position = motor.goal_position.map(round_value);
        }

        Self {
            stime,
            event_type: "motors".to_string(),
            motors,
        }
    }
}

/// Controller health at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthData {
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub healthy: bool,
    pub controllers: Vec<ControllerHealth>,
}

impl HealthData {
    pub fn new(controllers: Vec<ControllerHealth>, stime: f64) -> Self {
        Self {
            stime,
            event_type: "health".to_string(),
            healthy: controllers.iter().all(ControllerHealth::is_healthy),
            controllers,
        }
    }
}

#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish_motors(&self, data: &MotorsData) -> anyhow::Result<()>;

    async fn publish_health(&self, data: &HealthData) -> anyhow::Result<()>;

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        let _ = (topic, data);
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Clone)]
pub struct NoOpTelemetry;

#[async_trait]
impl TelemetryPublisher for NoOpTelemetry {
    async fn publish_motors(&self, _data: &MotorsData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_health(&self, _data: &HealthData) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints one JSON document per event on stdout
#[derive(Debug, Clone, Default)]
pub struct ConsoleTelemetry {
    pub pretty_print: bool,
}

impl ConsoleTelemetry {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }

    fn render<T: Serialize + ?Sized>(&self, data: &T) -> anyhow::Result<String> {
        Ok(if self.pretty_print {
            serde_json::to_string_pretty(data)?
        } else {
            serde_json::to_string(data)?
        })
    }
}

#[async_trait]
impl TelemetryPublisher for ConsoleTelemetry {
    async fn publish_motors(&self, data: &MotorsData) -> anyhow::Result<()> {
        println!("{}", self.render(data)?);
        Ok(())
    }

    async fn publish_health(&self, data: &HealthData) -> anyhow::Result<()> {
        println!("{}", self.render(data)?);
        Ok(())
    }

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        println!("[{}] {}", topic, self.render(data)?);
        Ok(())
    }
}
