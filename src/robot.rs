//! Assembled robot
//!
//! A [`RobotAssembly`] is what client code holds after assembly: the motor
//! descriptors, the alias index over them and the controllers keeping them in
//! sync. Motors and groups are addressed by name; groups are views over the
//! same shared descriptors.

use crate::alias::{Alias, AliasIndex};
use crate::controller::{ControllerHealth, MotorController};
use crate::motor::{MotorDescriptor, MotorSnapshot};
use crate::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RobotAssembly {
    motors: Vec<Arc<MotorDescriptor>>,
    aliases: AliasIndex,
    controllers: Vec<Arc<dyn MotorController>>,
}

impl RobotAssembly {
    pub(crate) fn new(
        motors: Vec<Arc<MotorDescriptor>>,
        aliases: AliasIndex,
        controllers: Vec<Arc<dyn MotorController>>,
    ) -> Self {
        Self {
            motors,
            aliases,
            controllers,
        }
    }

    pub fn motor(&self, name: &str) -> Option<&Arc<MotorDescriptor>> {
        self.aliases.motor(name)
    }

    /// Flattened, ordered members of a group
    pub fn group(&self, name: &str) -> Option<&[Arc<MotorDescriptor>]> {
        self.aliases.group(name)
    }

    /// Look a name up as either a motor or a group
    pub fn get(&self, name: &str) -> Option<Alias<'_>> {
        self.aliases.get(name)
    }

    pub fn motor_names(&self) -> impl Iterator<Item = &str> {
        self.aliases.motor_names()
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.aliases.group_names()
    }

    /// Groups a motor belongs to, in definition order
    pub fn groups_of(&self, motor: &str) -> &[String] {
        self.aliases.groups_of(motor)
    }

    /// Every motor in configuration order
    pub fn motors(&self) -> &[Arc<MotorDescriptor>] {
        &self.motors
    }

    pub fn aliases(&self) -> &AliasIndex {
        &self.aliases
    }

    pub fn controllers(&self) -> &[Arc<dyn MotorController>] {
        &self.controllers
    }

    pub fn controller(&self, name: &str) -> Option<&Arc<dyn MotorController>> {
        self.controllers.iter().find(|c| c.name() == name)
    }

    pub fn health(&self) -> Vec<ControllerHealth> {
        self.controllers.iter().map(|c| c.health()).collect()
    }

    /// True when every controller is bound or running
    pub fn is_healthy(&self) -> bool {
        self.controllers.iter().all(|c| c.health().is_healthy())
    }

    pub fn snapshot(&self) -> Vec<MotorSnapshot> {
        self.motors.iter().map(|m| MotorSnapshot::from(m.as_ref())).collect()
    }

    /// Start the background loop of every controller
    pub fn start(&self) -> Result<()> {
        for controller in &self.controllers {
            Arc::clone(controller).start()?;
        }
        Ok(())
    }

    /// Shut every controller down concurrently
    ///
    /// All controllers are stopped even if some fail; the first error is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down robot assembly ({} controller(s))", self.controllers.len());
        let results =
            futures::future::join_all(self.controllers.iter().map(|c| c.shutdown())).await;

        let mut first_error = None;
        for (controller, result) in self.controllers.iter().zip(results) {
            if let Err(e) = result {
                warn!("Controller '{}' failed to shut down: {}", controller.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for RobotAssembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotAssembly")
            .field("motors", &self.motors.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("groups", &self.aliases.group_names().collect::<Vec<_>>())
            .field("controllers", &self.controllers.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}
