//! In-process simulator
//!
//! Mimics the behaviour of a remote-API simulator closely enough to exercise
//! the simulated controller: one client per port, scenes made of named joint
//! objects, joints that reach their target on the next step. Failures can be
//! injected to drive retry, degradation and timeout paths.

use super::{IoResult, SimulatorIo, SimulatorLink};
use crate::error::BackendIoError;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct SimWorld {
    reachable: bool,
    handshake_ok: bool,
    connect_delay: Option<Duration>,
    io_delay: Option<Duration>,
    scenes: HashMap<String, Vec<String>>,
    active_scene: Option<String>,
    running: bool,
    objects: IndexMap<String, i64>,
    /// handle -> joint position in radians
    joints: HashMap<i64, f64>,
    next_handle: i64,
    open_links: usize,
    connections: usize,
    scene_loads: usize,
    pending_failures: u32,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self {
            reachable: true,
            handshake_ok: true,
            connect_delay: None,
            io_delay: None,
            scenes: HashMap::new(),
            active_scene: None,
            running: false,
            objects: IndexMap::new(),
            joints: HashMap::new(),
            next_handle: 1,
            open_links: 0,
            connections: 0,
            scene_loads: 0,
            pending_failures: 0,
        }
    }
}

impl SimWorld {
    fn take_failure(&mut self) -> IoResult<()> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(BackendIoError::Transient("simulated packet loss".to_string()));
        }
        Ok(())
    }
}

/// Shared handle to an in-process simulator
#[derive(Debug, Clone, Default)]
pub struct VirtualSimulator {
    world: Arc<Mutex<SimWorld>>,
}

impl VirtualSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scene made of the given joint objects
    pub fn with_scene<I, S>(self, scene: &str, objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.world()
            .scenes
            .insert(scene.to_string(), objects.into_iter().map(Into::into).collect());
        self
    }

    fn world(&self) -> MutexGuard<'_, SimWorld> {
        self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.world().reachable = reachable;
    }

    pub fn set_handshake_ok(&self, ok: bool) {
        self.world().handshake_ok = ok;
    }

    /// Delay every connection attempt, e.g. to trigger connect timeouts
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.world().connect_delay = delay;
    }

    /// Delay every joint read and write, e.g. to keep a tick in flight
    pub fn set_io_delay(&self, delay: Option<Duration>) {
        self.world().io_delay = delay;
    }

    /// Fail the next `count` joint reads or writes with a transient error
    pub fn fail_next(&self, count: u32) {
        self.world().pending_failures = count;
    }

    pub fn open_links(&self) -> usize {
        self.world().open_links
    }

    /// Number of successful connections so far
    pub fn connections(&self) -> usize {
        self.world().connections
    }

    pub fn scene_loads(&self) -> usize {
        self.world().scene_loads
    }

    pub fn active_scene(&self) -> Option<String> {
        self.world().active_scene.clone()
    }

    pub fn is_running(&self) -> bool {
        self.world().running
    }

    /// Joint position in radians of a scene object
    pub fn joint_position(&self, object: &str) -> Option<f64> {
        let world = self.world();
        let handle = world.objects.get(object)?;
        world.joints.get(handle).copied()
    }

    /// Move a joint from outside, as if something pushed it
    pub fn set_joint_position(&self, object: &str, radians: f64) -> bool {
        let mut world = self.world();
        match world.objects.get(object).copied() {
            Some(handle) => {
                world.joints.insert(handle, radians);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SimulatorIo for VirtualSimulator {
    async fn connect(&self, host: &str, port: u16) -> IoResult<Box<dyn SimulatorLink>> {
        let delay = self.world().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut world = self.world();
        if !world.reachable {
            return Err(BackendIoError::Unreachable(format!("{}:{}", host, port)));
        }
        if world.open_links > 0 {
            return Err(BackendIoError::Refused(format!(
                "remote API port {} already has a client",
                port
            )));
        }
        if !world.handshake_ok {
            return Err(BackendIoError::Handshake("unexpected protocol version".to_string()));
        }

        world.open_links += 1;
        world.connections += 1;
        Ok(Box::new(VirtualSimLink {
            world: Arc::clone(&self.world),
            closed: false,
        }))
    }
}

struct VirtualSimLink {
    world: Arc<Mutex<SimWorld>>,
    closed: bool,
}

impl VirtualSimLink {
    fn world(&self) -> IoResult<MutexGuard<'_, SimWorld>> {
        if self.closed {
            return Err(BackendIoError::SessionClosed);
        }
        Ok(self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    async fn io_pause(&self) -> IoResult<()> {
        let delay = self.world()?.io_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut world = self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            world.open_links = world.open_links.saturating_sub(1);
        }
    }
}

#[async_trait]
impl SimulatorLink for VirtualSimLink {
    async fn active_scene(&mut self) -> IoResult<Option<String>> {
        Ok(self.world()?.active_scene.clone())
    }

    async fn load_scene(&mut self, scene: &str) -> IoResult<()> {
        let mut world = self.world()?;
        let objects = world
            .scenes
            .get(scene)
            .cloned()
            .ok_or_else(|| BackendIoError::NotFound(format!("scene '{}'", scene)))?;

        world.objects.clear();
        world.joints.clear();
        for object in objects {
            let handle = world.next_handle;
            world.next_handle += 1;
            world.objects.insert(object, handle);
            world.joints.insert(handle, 0.0);
        }
        world.active_scene = Some(scene.to_string());
        world.running = false;
        world.scene_loads += 1;
        Ok(())
    }

    async fn start_simulation(&mut self) -> IoResult<()> {
        let mut world = self.world()?;
        if world.active_scene.is_none() {
            return Err(BackendIoError::NotFound("no scene loaded".to_string()));
        }
        world.running = true;
        Ok(())
    }

    async fn object_handle(&mut self, name: &str) -> IoResult<i64> {
        self.world()?
            .objects
            .get(name)
            .copied()
            .ok_or_else(|| BackendIoError::NotFound(format!("object '{}'", name)))
    }

    async fn joint_positions(&mut self, handles: &[i64]) -> IoResult<Vec<f64>> {
        self.io_pause().await?;
        let mut world = self.world()?;
        world.take_failure()?;
        handles
            .iter()
            .map(|handle| {
                world
                    .joints
                    .get(handle)
                    .copied()
                    .ok_or_else(|| BackendIoError::NotFound(format!("object handle {}", handle)))
            })
            .collect()
    }

    async fn set_joint_targets(&mut self, targets: &[(i64, f64)]) -> IoResult<()> {
        self.io_pause().await?;
        let mut world = self.world()?;
        world.take_failure()?;
        for (handle, radians) in targets {
            if !world.joints.contains_key(handle) {
                return Err(BackendIoError::NotFound(format!("object handle {}", handle)));
            }
            world.joints.insert(*handle, *radians);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.disconnect();
    }
}

impl Drop for VirtualSimLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_client_per_port() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let mut link = sim.connect("127.0.0.1", 19997).await.unwrap();
        assert_eq!(sim.open_links(), 1);

        let second = sim.connect("127.0.0.1", 19997).await;
        assert!(matches!(second, Err(BackendIoError::Refused(_))));

        link.close().await;
        assert_eq!(sim.open_links(), 0);
        assert!(sim.connect("127.0.0.1", 19997).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_a_link_frees_the_port() {
        let sim = VirtualSimulator::new();
        {
            let _link = sim.connect("localhost", 19997).await.unwrap();
            assert_eq!(sim.open_links(), 1);
        }
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test]
    async fn test_scene_objects_and_joints() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1", "m2"]);
        let mut link = sim.connect("localhost", 19997).await.unwrap();

        assert_eq!(link.active_scene().await.unwrap(), None);
        assert!(link.start_simulation().await.is_err());
        link.load_scene("arm.ttt").await.unwrap();
        link.start_simulation().await.unwrap();

        let m2 = link.object_handle("m2").await.unwrap();
        assert!(matches!(link.object_handle("m3").await, Err(BackendIoError::NotFound(_))));

        link.set_joint_targets(&[(m2, 0.5)]).await.unwrap();
        assert_eq!(link.joint_positions(&[m2]).await.unwrap(), vec![0.5]);
        assert_eq!(sim.joint_position("m2"), Some(0.5));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let sim = VirtualSimulator::new().with_scene("arm.ttt", ["m1"]);
        let mut link = sim.connect("localhost", 19997).await.unwrap();
        link.load_scene("arm.ttt").await.unwrap();
        let m1 = link.object_handle("m1").await.unwrap();

        sim.fail_next(1);
        let err = link.joint_positions(&[m1]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(link.joint_positions(&[m1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_and_handshake() {
        let sim = VirtualSimulator::new();
        sim.set_reachable(false);
        let result = sim.connect("10.0.0.9", 19997).await;
        assert!(matches!(result, Err(BackendIoError::Unreachable(_))));

        sim.set_reachable(true);
        sim.set_handshake_ok(false);
        assert!(matches!(sim.connect("10.0.0.9", 19997).await, Err(BackendIoError::Handshake(_))));
        assert_eq!(sim.open_links(), 0);
    }
}
