//! Controller for a remote simulator
//!
//! Binding runs in a fixed order: connect, load the scene unless it is already
//! the active one, start the simulation, then look up one scene object per
//! motor by the motor's name. Joint values cross the wire in radians and are
//! reported in degrees rounded to 0.1.

use super::{BackendSession, Controller, SyncPolicy};
use crate::backend::{BackendKind, IoResult, SimulatorIo, SimulatorLink};
use crate::error::BackendIoError;
use crate::motor::MotorDescriptor;
use crate::session::SessionManager;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub type SimulatedController = Controller<SimulatorSession>;

pub struct SimulatorSession {
    io: Arc<dyn SimulatorIo>,
    host: String,
    port: u16,
    scene: Option<String>,
    link: Option<Box<dyn SimulatorLink>>,
}

impl SimulatorSession {
    pub fn new(
        io: Arc<dyn SimulatorIo>,
        host: impl Into<String>,
        port: u16,
        scene: Option<String>,
    ) -> Self {
        Self {
            io,
            host: host.into(),
            port,
            scene,
            link: None,
        }
    }

    fn link(&mut self) -> IoResult<&mut Box<dyn SimulatorLink>> {
        self.link.as_mut().ok_or(BackendIoError::SessionClosed)
    }
}

fn round_tenth(degrees: f64) -> f64 {
    (degrees * 10.0).round() / 10.0
}

#[async_trait]
impl BackendSession for SimulatorSession {
    type Handle = i64;

    fn backend(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn setup_label(&self) -> String {
        match &self.scene {
            Some(scene) => format!("scene '{}'", scene),
            None => "simulation".to_string(),
        }
    }

    async fn open(&mut self) -> IoResult<()> {
        if let Some(mut stale) = self.link.take() {
            stale.close().await;
        }
        self.link = Some(self.io.connect(&self.host, self.port).await?);
        Ok(())
    }

    async fn prepare(&mut self) -> IoResult<()> {
        let scene = self.scene.clone();
        let link = self.link()?;

        if let Some(scene) = scene {
            if link.active_scene().await?.as_deref() == Some(scene.as_str()) {
                debug!("Scene '{}' already active, not reloading", scene);
            } else {
                info!("Loading scene '{}'", scene);
                link.load_scene(&scene).await?;
            }
        }
        link.start_simulation().await
    }

    async fn locate(&mut self, motor: &MotorDescriptor) -> IoResult<i64> {
        self.link()?.object_handle(motor.name()).await
    }

    async fn read_positions(&mut self, handles: &[i64]) -> IoResult<Vec<f64>> {
        let radians = self.link()?.joint_positions(handles).await?;
        Ok(radians.into_iter().map(|r| round_tenth(r.to_degrees())).collect())
    }

    async fn write_goal_positions(&mut self, goals: &[(i64, f64)]) -> IoResult<()> {
        let targets: Vec<(i64, f64)> = goals
            .iter()
            .map(|(handle, degrees)| (*handle, degrees.to_radians()))
            .collect();
        self.link()?.set_joint_targets(&targets).await
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }
}

impl Controller<SimulatorSession> {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        scene: Option<String>,
        io: Arc<dyn SimulatorIo>,
        sessions: Arc<SessionManager>,
        policy: SyncPolicy,
    ) -> Self {
        Self::with_session(name, SimulatorSession::new(io, host, port, scene), sessions, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VirtualSimulator;
    use crate::config::MotorConfig;
    use crate::controller::{ControllerState, MotorController};
    use crate::ArmatureError;
    use std::time::Duration;

    fn motor(name: &str, id: u32) -> Arc<MotorDescriptor> {
        let config = MotorConfig::parse(name, &serde_json::json!({"id": id})).unwrap();
        Arc::new(MotorDescriptor::from_config(name, &config).unwrap())
    }

    fn fast_policy() -> SyncPolicy {
        SyncPolicy {
            sync_period: Duration::from_millis(5),
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(4),
            ..SyncPolicy::default()
        }
    }

    fn controller(
        sim: &VirtualSimulator,
        sessions: &Arc<SessionManager>,
    ) -> Arc<SimulatedController> {
        Arc::new(SimulatedController::new(
            "sim",
            "127.0.0.1",
            19997,
            Some("arm.ttt".to_string()),
            Arc::new(sim.clone()),
            Arc::clone(sessions),
            fast_policy(),
        ))
    }

    #[test]
    fn test_round_tenth() {
        assert_eq!(round_tenth(12.34), 12.3);
        assert_eq!(round_tenth(-0.05000001), -0.1);
        assert_eq!(round_tenth(90.0), 90.0);
    }

    #[tokio::test]
    async fn test_bind_loads_scene_and_reads_degrees() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1", "m2"]);
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);
        let motors = vec![motor("m1", 1), motor("m2", 2)];

        ctrl.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Connected);
        ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Bound);
        assert_eq!(sim.active_scene().as_deref(), Some("arm.ttt"));
        assert!(sim.is_running());
        assert_eq!(motors[0].owner().as_deref(), Some("sim"));

        sim.set_joint_position("m2", std::f64::consts::FRAC_PI_2);
        ctrl.synchronize().await.unwrap();
        assert_eq!(motors[1].present_position(), 90.0);
        assert_eq!(ctrl.health().ticks, 1);
    }

    #[tokio::test]
    async fn test_active_scene_is_not_reloaded() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let sessions = SessionManager::new();
        let motors = vec![motor("m1", 1)];

        for _ in 0..2 {
            let ctrl = controller(&sim, &sessions);
            ctrl.connect(Duration::from_secs(1)).await.unwrap();
            ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap();
            ctrl.shutdown().await.unwrap();
        }
        assert_eq!(sim.scene_loads(), 1);
        assert_eq!(sim.connections(), 2);
    }

    #[tokio::test]
    async fn test_missing_object_names_the_motor() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);
        let motors = vec![motor("m1", 1), motor("m9", 9)];

        ctrl.connect(Duration::from_secs(1)).await.unwrap();
        let err = ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ArmatureError::Binding { ref object, .. } if object == "m9"));
        assert!(motors[0].owner().is_none());
        assert_eq!(ctrl.state(), ControllerState::Connected);
    }

    #[tokio::test]
    async fn test_missing_scene_is_a_binding_error() {
        let sim = VirtualSimulator::new();
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);

        ctrl.connect(Duration::from_secs(1)).await.unwrap();
        let err = ctrl.bind(&[motor("m1", 1)], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ArmatureError::Binding { ref object, .. } if object == "scene 'arm.ttt'"));
    }

    #[tokio::test]
    async fn test_connect_retries_then_fails() {
        let sim = VirtualSimulator::new();
        sim.set_reachable(false);
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);

        let err = ctrl.connect(Duration::from_millis(100)).await.unwrap_err();
        match err {
            ArmatureError::BackendConnection { attempts, target, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(target, "127.0.0.1:19997");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(ctrl.state(), ControllerState::Unconnected);
        assert!(!sessions.is_leased("127.0.0.1:19997"));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let sim = VirtualSimulator::new();
        sim.set_connect_delay(Some(Duration::from_millis(200)));
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);

        let err = ctrl.connect(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ArmatureError::BackendConnection { ref reason, .. } if reason.contains("timed out")));
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test]
    async fn test_goal_reaches_joint_in_radians() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);
        let motors = vec![motor("m1", 1)];

        ctrl.connect(Duration::from_secs(1)).await.unwrap();
        ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap();
        motors[0].set_compliant(false);
        motors[0].set_goal_position(45.0);
        ctrl.synchronize().await.unwrap();

        let radians = sim.joint_position("m1").unwrap();
        assert!((radians - std::f64::consts::FRAC_PI_4).abs() < 1e-9);
        assert_eq!(motors[0].present_position(), 45.0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let sessions = SessionManager::new();
        let ctrl = controller(&sim, &sessions);
        let motors = vec![motor("m1", 1)];

        ctrl.connect(Duration::from_secs(1)).await.unwrap();
        ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap();
        Arc::clone(&ctrl).start().unwrap();
        assert_eq!(ctrl.state(), ControllerState::Running);

        ctrl.shutdown().await.unwrap();
        ctrl.shutdown().await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Stopped);
        assert_eq!(sim.open_links(), 0);
        assert!(motors[0].owner().is_none());
        assert!(sessions.open_sessions().is_empty());
        assert!(matches!(ctrl.synchronize().await, Err(ArmatureError::ControllerClosed(_))));
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let sessions = SessionManager::new();
        let motors = vec![motor("m1", 1)];
        {
            let ctrl = controller(&sim, &sessions);
            ctrl.connect(Duration::from_secs(1)).await.unwrap();
            ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap();
            assert!(sessions.is_leased("127.0.0.1:19997"));
        }
        assert!(!sessions.is_leased("127.0.0.1:19997"));
        assert_eq!(sim.open_links(), 0);
        assert!(motors[0].owner().is_none());
    }
}
