//! Assembly monitoring
//!
//! Emits motor frames and controller health through a [`TelemetryPublisher`],
//! with publication rate limiting and, in dynamic mode, change detection so
//! an idle robot stays quiet.

use crate::controller::{ControllerHealth, ControllerState};
use crate::robot::RobotAssembly;
use crate::telemetry::{HealthData, MotorsData, TelemetryPublisher};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monitor output manager that handles dynamic output and rate limiting
pub struct MonitorOutput {
    /// Positions from the last emitted frame, in motor order
    last_positions: Option<Vec<f64>>,
    /// Controller states from the last emitted health frame
    last_states: Option<Vec<ControllerState>>,
    last_motor_output: Option<Instant>,
    pub_rate_hz: u32,
    /// Degrees
    position_threshold: f64,
    dynamic_mode: bool,
    pub decimal_places: u32,
    telemetry: Arc<dyn TelemetryPublisher>,
}

impl MonitorOutput {
    pub fn new(
        pub_rate_hz: u32,
        dynamic_mode: bool,
        decimal_places: u32,
        telemetry: Arc<dyn TelemetryPublisher>,
    ) -> Self {
        Self {
            last_positions: None,
            last_states: None,
            last_motor_output: None,
            pub_rate_hz: pub_rate_hz.max(1),
            position_threshold: 0.1,
            dynamic_mode,
            decimal_places,
            telemetry,
        }
    }

    /// Check whether a motor frame with these positions should go out now
    pub fn should_output_motors(&mut self, positions: &[f64]) -> bool {
        let now = Instant::now();

        if let Some(last_output) = self.last_motor_output {
            let min_interval = Duration::from_millis(1000 / u64::from(self.pub_rate_hz));
            if now.duration_since(last_output) < min_interval {
                return false;
            }
        }

        if self.dynamic_mode {
            if let Some(last) = &self.last_positions {
                if !self.positions_changed(last, positions) {
                    return false;
                }
            }
        }

        self.last_positions = Some(positions.to_vec());
        self.last_motor_output = Some(now);
        true
    }

    /// Health is never rate limited; in dynamic mode only state changes go out
    pub fn should_output_health(&mut self, health: &[ControllerHealth]) -> bool {
        let states: Vec<ControllerState> = health.iter().map(|h| h.state).collect();
        if self.dynamic_mode && self.last_states.as_ref() == Some(&states) {
            return false;
        }
        self.last_states = Some(states);
        true
    }

    fn positions_changed(&self, old: &[f64], new: &[f64]) -> bool {
        old.len() != new.len()
            || old
                .iter()
                .zip(new)
                .any(|(old_val, new_val)| (old_val - new_val).abs() > self.position_threshold)
    }

    /// Publish whatever is due for this assembly
    pub async fn observe(&mut self, robot: &RobotAssembly) -> anyhow::Result<()> {
        let stime = Utc::now().timestamp_millis() as f64 / 1000.0;

        let health = robot.health();
        if self.should_output_health(&health) {
            self.telemetry.publish_health(&HealthData::new(health, stime)).await?;
        }

        let snapshot = robot.snapshot();
        let positions: Vec<f64> = snapshot.iter().map(|m| m.present_position).collect();
        if self.should_output_motors(&positions) {
            let data = MotorsData::new_rounded(snapshot, stime, self.decimal_places);
            self.telemetry.publish_motors(&data).await?;
        }
        Ok(())
    }
}
