//! Controller for a physical motor bus
//!
//! Motors are located by pinging their configured id; positions are
//! exchanged in degrees in the motor frame.

use super::{BackendSession, Controller, SyncPolicy};
use crate::backend::{BackendKind, BusLink, IoResult, MotorBus};
use crate::error::BackendIoError;
use crate::motor::MotorDescriptor;
use crate::session::SessionManager;
use async_trait::async_trait;
use std::sync::Arc;

pub type PhysicalController = Controller<BusSession>;

pub struct BusSession {
    bus: Arc<dyn MotorBus>,
    address: String,
    link: Option<Box<dyn BusLink>>,
}

impl BusSession {
    pub fn new(bus: Arc<dyn MotorBus>, address: impl Into<String>) -> Self {
        Self {
            bus,
            address: address.into(),
            link: None,
        }
    }

    fn link(&mut self) -> IoResult<&mut Box<dyn BusLink>> {
        self.link.as_mut().ok_or(BackendIoError::SessionClosed)
    }
}

#[async_trait]
impl BackendSession for BusSession {
    type Handle = u32;

    fn backend(&self) -> BackendKind {
        BackendKind::Physical
    }

    fn target(&self) -> String {
        self.address.clone()
    }

    async fn open(&mut self) -> IoResult<()> {
        if let Some(mut stale) = self.link.take() {
            stale.close().await;
        }
        self.link = Some(self.bus.open(&self.address).await?);
        Ok(())
    }

    async fn locate(&mut self, motor: &MotorDescriptor) -> IoResult<u32> {
        let id = motor.id();
        if self.link()?.ping(id).await? {
            Ok(id)
        } else {
            Err(BackendIoError::NotFound(format!(
                "no motor answers on id {} at {}",
                id, self.address
            )))
        }
    }

    async fn read_positions(&mut self, handles: &[u32]) -> IoResult<Vec<f64>> {
        self.link()?.read_positions(handles).await
    }

    async fn write_goal_positions(&mut self, goals: &[(u32, f64)]) -> IoResult<()> {
        self.link()?.write_goal_positions(goals).await
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }
}

impl Controller<BusSession> {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        bus: Arc<dyn MotorBus>,
        sessions: Arc<SessionManager>,
        policy: SyncPolicy,
    ) -> Self {
        Self::with_session(name, BusSession::new(bus, address), sessions, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VirtualBus;
    use crate::config::MotorConfig;
    use crate::controller::{ControllerState, MotorController};
    use crate::ArmatureError;
    use std::time::Duration;

    fn motor(name: &str, entry: serde_json::Value) -> Arc<MotorDescriptor> {
        let config = MotorConfig::parse(name, &entry).unwrap();
        Arc::new(MotorDescriptor::from_config(name, &config).unwrap())
    }

    fn policy() -> SyncPolicy {
        SyncPolicy {
            sync_period: Duration::from_millis(5),
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(2),
            ..SyncPolicy::default()
        }
    }

    async fn bound(bus: &VirtualBus, motors: &[Arc<MotorDescriptor>]) -> Arc<PhysicalController> {
        let ctrl = Arc::new(PhysicalController::new(
            "bus0",
            "/dev/ttyUSB0",
            Arc::new(bus.clone()),
            SessionManager::new(),
            policy(),
        ));
        ctrl.connect(Duration::from_secs(1)).await.unwrap();
        ctrl.bind(motors, Duration::from_secs(1)).await.unwrap();
        ctrl
    }

    #[tokio::test]
    async fn test_orientation_and_offset_applied() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [11, 12]);
        let motors = vec![
            motor(
                "shoulder",
                serde_json::json!({"id": 11, "orientation": "indirect", "offset": 10.0}),
            ),
            motor("elbow", serde_json::json!({"id": 12})),
        ];
        let ctrl = bound(&bus, &motors).await;

        bus.set_position("/dev/ttyUSB0", 11, 30.0);
        ctrl.synchronize().await.unwrap();
        assert_eq!(motors[0].present_position(), -40.0);

        motors[0].set_goal_position(20.0);
        ctrl.synchronize().await.unwrap();
        assert_eq!(bus.position("/dev/ttyUSB0", 11), Some(-30.0));
        assert_eq!(motors[0].present_position(), 20.0);
    }

    #[tokio::test]
    async fn test_compliant_goal_not_sent_and_limits_clamp() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1]);
        let motors = vec![motor("wrist", serde_json::json!({"id": 1, "limits": [-45.0, 45.0]}))];
        let ctrl = bound(&bus, &motors).await;

        motors[0].set_compliant(true);
        motors[0].set_goal_position(30.0);
        ctrl.synchronize().await.unwrap();
        assert_eq!(bus.position("/dev/ttyUSB0", 1), Some(0.0));

        motors[0].set_compliant(false);
        assert_eq!(motors[0].set_goal_position(80.0), Some(45.0));
        ctrl.synchronize().await.unwrap();
        assert_eq!(bus.position("/dev/ttyUSB0", 1), Some(45.0));
    }

    #[tokio::test]
    async fn test_silent_id_fails_binding() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1]);
        let ctrl = PhysicalController::new(
            "bus0",
            "/dev/ttyUSB0",
            Arc::new(bus.clone()),
            SessionManager::new(),
            policy(),
        );
        ctrl.connect(Duration::from_secs(1)).await.unwrap();

        let err = ctrl
            .bind(&[motor("m7", serde_json::json!({"id": 7}))], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ArmatureError::Binding { ref object, ref reason, .. }
            if object == "m7" && reason.contains("id 7")));
    }

    #[tokio::test]
    async fn test_shared_id_is_rejected() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [3]);
        let ctrl = PhysicalController::new(
            "bus0",
            "/dev/ttyUSB0",
            Arc::new(bus.clone()),
            SessionManager::new(),
            policy(),
        );
        ctrl.connect(Duration::from_secs(1)).await.unwrap();

        let motors = [
            motor("a", serde_json::json!({"id": 3})),
            motor("b", serde_json::json!({"id": 3})),
        ];
        let err = ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ArmatureError::Binding { ref object, .. } if object == "b"));
    }

    #[tokio::test]
    async fn test_transient_failures_degrade_then_recover() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1]);
        let motors = vec![motor("m1", serde_json::json!({"id": 1}))];
        let ctrl = bound(&bus, &motors).await;

        // Two failures are absorbed by the retry budget of three attempts
        bus.fail_next("/dev/ttyUSB0", 2);
        ctrl.synchronize().await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Bound);

        bus.fail_next("/dev/ttyUSB0", 3);
        let err = ctrl.synchronize().await.unwrap_err();
        assert!(matches!(err, ArmatureError::Synchronization { .. }));
        let health = ctrl.health();
        assert_eq!(health.state, ControllerState::Degraded);
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.is_some());

        ctrl.synchronize().await.unwrap();
        let health = ctrl.health();
        assert_eq!(health.state, ControllerState::Bound);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_bind_twice_is_rejected() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1]);
        let motors = vec![motor("m1", serde_json::json!({"id": 1}))];
        let ctrl = bound(&bus, &motors).await;

        let err = ctrl.bind(&motors, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ArmatureError::Binding { .. }));
    }

    #[tokio::test]
    async fn test_background_loop_ticks() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1]);
        let motors = vec![motor("m1", serde_json::json!({"id": 1}))];
        let ctrl = bound(&bus, &motors).await;
        let mut health = ctrl.subscribe_health();

        Arc::clone(&ctrl).start().unwrap();
        bus.set_position("/dev/ttyUSB0", 1, 12.5);

        tokio::time::timeout(Duration::from_secs(2), health.wait_for(|h| h.ticks >= 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(motors[0].present_position(), 12.5);
        assert!(motors[0].state().tick >= 3);

        ctrl.shutdown().await.unwrap();
        assert!(!bus.is_open("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn test_drop_closes_port() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1]);
        let motors = vec![motor("m1", serde_json::json!({"id": 1}))];
        {
            let _ctrl = bound(&bus, &motors).await;
            assert!(bus.is_open("/dev/ttyUSB0"));
        }
        assert!(!bus.is_open("/dev/ttyUSB0"));
        assert!(motors[0].owner().is_none());

        let again = bound(&bus, &motors).await;
        assert_eq!(again.state(), ControllerState::Bound);
        again.shutdown().await.unwrap();
    }
}
