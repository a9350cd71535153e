//! Backend session registry
//!
//! Every controller takes a lease on its backend target before opening a
//! session and gives it back when the session closes. A target can hold one
//! lease at a time, so two assemblies in the same process cannot silently
//! share a serial port or a simulator connection, and a leaked session shows
//! up as a refused lease instead of a hung backend.
//!
//! Use [`SessionManager::new`] for an isolated registry (tests, embedded use)
//! or [`SessionManager::global`] for the process-wide one. Call
//! [`SessionManager::close_all`] before process exit to shut down every
//! controller still registered.

use crate::backend::BackendKind;
use crate::controller::MotorController;
use crate::{ArmatureError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Proof that a controller holds the session for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub controller: String,
    pub backend: BackendKind,
    pub target: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    /// target -> lease
    leases: HashMap<String, SessionHandle>,
    controllers: Vec<Weak<dyn MotorController>>,
}

#[derive(Default)]
pub struct SessionManager {
    registry: Mutex<Registry>,
}

static GLOBAL: OnceLock<Arc<SessionManager>> = OnceLock::new();

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide registry, created on first use
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(SessionManager::new))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lease a target for a controller
    pub fn acquire(
        &self,
        controller: &str,
        backend: BackendKind,
        target: &str,
    ) -> Result<SessionHandle> {
        let mut registry = self.registry();
        if let Some(existing) = registry.leases.get(target) {
            return Err(ArmatureError::BackendConnection {
                controller: controller.to_string(),
                target: target.to_string(),
                attempts: 0,
                reason: format!(
                    "target already in use by controller '{}' (session {})",
                    existing.controller, existing.id
                ),
            });
        }

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            controller: controller.to_string(),
            backend,
            target: target.to_string(),
            opened_at: Utc::now(),
        };
        registry.leases.insert(target.to_string(), handle.clone());
        debug!("Session {} leased {} to controller '{}'", handle.id, target, controller);
        Ok(handle)
    }

    /// Return a lease; returns false if it was not held
    pub fn release(&self, handle: &SessionHandle) -> bool {
        let mut registry = self.registry();
        match registry.leases.get(&handle.target) {
            Some(current) if current.id == handle.id => {
                registry.leases.remove(&handle.target);
                debug!("Session {} released {}", handle.id, handle.target);
                true
            }
            _ => false,
        }
    }

    pub fn is_leased(&self, target: &str) -> bool {
        self.registry().leases.contains_key(target)
    }

    pub fn open_sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = self.registry().leases.values().cloned().collect();
        sessions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        sessions
    }

    /// Track a controller so `close_all` can reach it
    pub fn register(&self, controller: &Arc<dyn MotorController>) {
        let mut registry = self.registry();
        registry.controllers.retain(|weak| weak.strong_count() > 0);
        registry.controllers.push(Arc::downgrade(controller));
    }

    /// Shut down every registered controller that is still alive
    pub async fn close_all(&self) {
        let controllers: Vec<Arc<dyn MotorController>> = {
            let mut registry = self.registry();
            registry
                .controllers
                .drain(..)
                .filter_map(|weak| weak.upgrade())
                .collect()
        };

        info!("Closing {} registered controller(s)", controllers.len());
        let results = futures::future::join_all(controllers.iter().map(|c| c.shutdown())).await;
        for (controller, result) in controllers.iter().zip(results) {
            if let Err(e) = result {
                warn!("Controller '{}' failed to shut down cleanly: {}", controller.name(), e);
            }
        }

        let leftover: Vec<SessionHandle> = self.registry().leases.drain().map(|(_, h)| h).collect();
        for handle in leftover {
            warn!("Dropping orphaned session {} on {}", handle.id, handle.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_is_exclusive() {
        let sessions = SessionManager::new();
        let first = sessions.acquire("sim", BackendKind::Simulated, "127.0.0.1:19997").unwrap();

        let err = sessions
            .acquire("other", BackendKind::Simulated, "127.0.0.1:19997")
            .unwrap_err();
        assert!(matches!(err, ArmatureError::BackendConnection { ref reason, .. } if reason.contains("'sim'")));

        assert!(sessions.release(&first));
        assert!(!sessions.release(&first));
        assert!(sessions.acquire("other", BackendKind::Simulated, "127.0.0.1:19997").is_ok());
    }

    #[test]
    fn test_distinct_targets_coexist() {
        let sessions = SessionManager::new();
        sessions.acquire("a", BackendKind::Physical, "/dev/ttyUSB0").unwrap();
        sessions.acquire("b", BackendKind::Physical, "/dev/ttyUSB1").unwrap();
        assert_eq!(sessions.open_sessions().len(), 2);
        assert!(sessions.is_leased("/dev/ttyUSB1"));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&SessionManager::global(), &SessionManager::global()));
    }
}
