//! In-process motor bus
//!
//! Each address is a port with a fixed set of motor ids. A port accepts one
//! session at a time, the way a serial device does.

use super::{BusLink, IoResult, MotorBus};
use crate::error::BackendIoError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Port {
    /// id -> position in degrees
    motors: HashMap<u32, f64>,
    open: bool,
    pending_failures: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualBus {
    ports: Arc<Mutex<HashMap<String, Port>>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port with motors answering on the given ids
    pub fn with_port<I>(self, address: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        self.ports().insert(
            address.to_string(),
            Port {
                motors: ids.into_iter().map(|id| (id, 0.0)).collect(),
                ..Port::default()
            },
        );
        self
    }

    fn ports(&self) -> MutexGuard<'_, HashMap<String, Port>> {
        self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self, address: &str) -> bool {
        self.ports().get(address).is_some_and(|port| port.open)
    }

    pub fn position(&self, address: &str, id: u32) -> Option<f64> {
        self.ports().get(address)?.motors.get(&id).copied()
    }

    pub fn set_position(&self, address: &str, id: u32, degrees: f64) {
        if let Some(motor) = self
            .ports()
            .get_mut(address)
            .and_then(|port| port.motors.get_mut(&id))
        {
            *motor = degrees;
        }
    }

    /// Fail the next `count` reads or writes on a port with a transient error
    pub fn fail_next(&self, address: &str, count: u32) {
        if let Some(port) = self.ports().get_mut(address) {
            port.pending_failures = count;
        }
    }
}

#[async_trait]
impl MotorBus for VirtualBus {
    async fn open(&self, address: &str) -> IoResult<Box<dyn BusLink>> {
        let mut ports = self.ports();
        let port = ports
            .get_mut(address)
            .ok_or_else(|| BackendIoError::Unreachable(format!("no device at {}", address)))?;
        if port.open {
            return Err(BackendIoError::Refused(format!("{} is busy", address)));
        }
        port.open = true;

        Ok(Box::new(VirtualBusLink {
            ports: Arc::clone(&self.ports),
            address: address.to_string(),
            closed: false,
        }))
    }
}

struct VirtualBusLink {
    ports: Arc<Mutex<HashMap<String, Port>>>,
    address: String,
    closed: bool,
}

impl VirtualBusLink {
    fn with_port<T>(&self, f: impl FnOnce(&mut Port) -> IoResult<T>) -> IoResult<T> {
        if self.closed {
            return Err(BackendIoError::SessionClosed);
        }
        let mut ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let port = ports.get_mut(&self.address).ok_or(BackendIoError::SessionClosed)?;
        f(port)
    }

    fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut ports = self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(port) = ports.get_mut(&self.address) {
                port.open = false;
            }
        }
    }
}

fn take_failure(port: &mut Port) -> IoResult<()> {
    if port.pending_failures > 0 {
        port.pending_failures -= 1;
        return Err(BackendIoError::Transient("status packet checksum mismatch".to_string()));
    }
    Ok(())
}

#[async_trait]
impl BusLink for VirtualBusLink {
    async fn ping(&mut self, id: u32) -> IoResult<bool> {
        self.with_port(|port| Ok(port.motors.contains_key(&id)))
    }

    async fn read_positions(&mut self, ids: &[u32]) -> IoResult<Vec<f64>> {
        self.with_port(|port| {
            take_failure(port)?;
            ids.iter()
                .map(|id| {
                    port.motors
                        .get(id)
                        .copied()
                        .ok_or_else(|| BackendIoError::NotFound(format!("motor id {}", id)))
                })
                .collect()
        })
    }

    async fn write_goal_positions(&mut self, goals: &[(u32, f64)]) -> IoResult<()> {
        self.with_port(|port| {
            take_failure(port)?;
            for (id, degrees) in goals {
                let motor = port
                    .motors
                    .get_mut(id)
                    .ok_or_else(|| BackendIoError::NotFound(format!("motor id {}", id)))?;
                *motor = *degrees;
            }
            Ok(())
        })
    }

    async fn close(&mut self) {
        self.disconnect();
    }
}

impl Drop for VirtualBusLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_is_exclusive() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1, 2]);
        let mut link = bus.open("/dev/ttyUSB0").await.unwrap();
        assert!(bus.is_open("/dev/ttyUSB0"));
        assert!(matches!(bus.open("/dev/ttyUSB0").await, Err(BackendIoError::Refused(_))));

        link.close().await;
        assert!(!bus.is_open("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn test_unknown_port_is_unreachable() {
        let bus = VirtualBus::new();
        assert!(matches!(bus.open("/dev/ttyUSB9").await, Err(BackendIoError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_ping_read_write() {
        let bus = VirtualBus::new().with_port("/dev/ttyUSB0", [1, 2]);
        let mut link = bus.open("/dev/ttyUSB0").await.unwrap();

        assert!(link.ping(2).await.unwrap());
        assert!(!link.ping(3).await.unwrap());

        link.write_goal_positions(&[(1, 42.0)]).await.unwrap();
        assert_eq!(link.read_positions(&[1, 2]).await.unwrap(), vec![42.0, 0.0]);

        bus.fail_next("/dev/ttyUSB0", 1);
        assert!(link.read_positions(&[1]).await.unwrap_err().is_transient());
    }
}
