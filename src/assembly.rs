//! Robot assembly
//!
//! Turns a configuration document and a backend target into a live
//! [`RobotAssembly`]:
//!
//! 1. resolve every motor entry into a descriptor
//! 2. build the alias index over them
//! 3. plan which controller drives which motors
//! 4. construct, connect and bind each controller
//! 5. optionally start the synchronization loops
//!
//! Resolution and indexing happen before any backend is touched, so a bad
//! document never opens a session. Once connections start, the first failure
//! shuts down every controller brought up so far and is returned as is.

use crate::alias::AliasIndex;
use crate::backend::{BackendTarget, MotorBus, SimulatorIo};
use crate::config::{validate_name, MotorConfig, RobotConfig};
use crate::controller::{MotorController, PhysicalController, SimulatedController, SyncPolicy};
use crate::motor::MotorDescriptor;
use crate::robot::RobotAssembly;
use crate::session::SessionManager;
use crate::{ArmatureError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Name of the single controller used when the configuration defines none
const SIMULATOR_CONTROLLER: &str = "simulator";
const BUS_CONTROLLER: &str = "bus";

/// Which motors one controller drives, and where
#[derive(Debug)]
struct ControllerPlan {
    name: String,
    target: BackendTarget,
    motors: Vec<Arc<MotorDescriptor>>,
}

/// Builder for robot assemblies
pub struct Assembler {
    sessions: Arc<SessionManager>,
    simulator: Option<Arc<dyn SimulatorIo>>,
    bus: Option<Arc<dyn MotorBus>>,
    policy: Option<SyncPolicy>,
    start_sync: bool,
}

impl Assembler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            simulator: None,
            bus: None,
            policy: None,
            start_sync: true,
        }
    }

    pub fn with_simulator(mut self, io: Arc<dyn SimulatorIo>) -> Self {
        self.simulator = Some(io);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MotorBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the policy otherwise taken from the `sync` section
    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Whether `assemble` starts the background loops (default: true)
    pub fn start_sync(mut self, start: bool) -> Self {
        self.start_sync = start;
        self
    }

    pub async fn assemble(
        &self,
        config: &RobotConfig,
        target: &BackendTarget,
    ) -> Result<RobotAssembly> {
        info!("Assembling robot on {} backend at {}", target.kind(), target);

        // Step 1: resolve motors
        let motors = resolve_motors(config)?;

        // Step 2: alias index, before any backend is contacted
        let aliases = AliasIndex::build(&motors, &config.group_definitions()?)?;
        debug!(
            "Alias index: {} motor(s), {} group(s)",
            aliases.motor_count(),
            aliases.group_count()
        );

        // Step 3: controller planning
        let plans = plan_controllers(config, target, &motors, &aliases)?;
        let policy = self
            .policy
            .clone()
            .unwrap_or_else(|| SyncPolicy::from(config.sync()));

        // Step 4: bring every controller up, tearing all down on the first failure
        let mut controllers: Vec<Arc<dyn MotorController>> = Vec::with_capacity(plans.len());
        for plan in plans {
            let controller = self.build_controller(&plan, &policy)?;
            controllers.push(Arc::clone(&controller));

            if let Err(e) = bring_up(controller.as_ref(), &plan.motors, &policy).await {
                error!("Assembly failed at controller '{}': {}", plan.name, e);
                teardown(&controllers).await;
                return Err(e);
            }
        }

        // Step 5: synchronization loops
        if self.start_sync {
            for controller in &controllers {
                if let Err(e) = Arc::clone(controller).start() {
                    teardown(&controllers).await;
                    return Err(e);
                }
            }
        }

        for controller in &controllers {
            self.sessions.register(controller);
        }

        info!(
            "Robot assembled: {} motor(s), {} group(s), {} controller(s)",
            motors.len(),
            aliases.group_count(),
            controllers.len()
        );
        Ok(RobotAssembly::new(motors, aliases, controllers))
    }

    fn build_controller(
        &self,
        plan: &ControllerPlan,
        policy: &SyncPolicy,
    ) -> Result<Arc<dyn MotorController>> {
        match &plan.target {
            BackendTarget::Simulated { host, port, scene } => {
                let io = self.simulator.clone().ok_or_else(|| {
                    ArmatureError::Configuration(
                        "no simulator I/O was provided for a simulated target".to_string(),
                    )
                })?;
                Ok(Arc::new(SimulatedController::new(
                    plan.name.clone(),
                    host.clone(),
                    *port,
                    scene.clone(),
                    io,
                    Arc::clone(&self.sessions),
                    policy.clone(),
                )))
            }
            BackendTarget::Physical { address } => {
                let bus = self.bus.clone().ok_or_else(|| {
                    ArmatureError::Configuration(
                        "no motor bus was provided for a physical target".to_string(),
                    )
                })?;
                Ok(Arc::new(PhysicalController::new(
                    plan.name.clone(),
                    address.clone(),
                    bus,
                    Arc::clone(&self.sessions),
                    policy.clone(),
                )))
            }
        }
    }
}

/// Resolve every motor entry, in document order
fn resolve_motors(config: &RobotConfig) -> Result<Vec<Arc<MotorDescriptor>>> {
    config
        .motor_entries()
        .iter()
        .map(|(name, raw)| {
            let entry = MotorConfig::parse(name, raw)?;
            MotorDescriptor::from_config(name, &entry).map(Arc::new)
        })
        .collect()
}

fn plan_controllers(
    config: &RobotConfig,
    target: &BackendTarget,
    motors: &[Arc<MotorDescriptor>],
    aliases: &AliasIndex,
) -> Result<Vec<ControllerPlan>> {
    let address = match target {
        BackendTarget::Simulated { .. } => {
            if config.has_controllers() {
                debug!("Ignoring `controllers` section for a simulated target");
            }
            return Ok(vec![ControllerPlan {
                name: SIMULATOR_CONTROLLER.to_string(),
                target: target.clone(),
                motors: motors.to_vec(),
            }]);
        }
        BackendTarget::Physical { address } => address,
    };

    let definitions = config.controller_definitions()?;
    if definitions.is_empty() {
        return Ok(vec![ControllerPlan {
            name: BUS_CONTROLLER.to_string(),
            target: target.clone(),
            motors: motors.to_vec(),
        }]);
    }

    let mut owners: HashMap<String, String> = HashMap::new();
    let mut ports: HashMap<String, String> = HashMap::new();
    let mut plans = Vec::with_capacity(definitions.len());

    for definition in definitions {
        validate_name("controller", &definition.name)?;
        let port = definition.port.clone().unwrap_or_else(|| address.clone());
        if let Some(other) = ports.insert(port.clone(), definition.name.clone()) {
            return Err(ArmatureError::Configuration(format!(
                "controllers.{} and controllers.{} both use port {}",
                other, definition.name, port
            )));
        }

        let attached = aliases.expand(&definition.attached_motors).map_err(|e| match e {
            ArmatureError::Configuration(reason) => {
                ArmatureError::Configuration(format!("controllers.{}: {}", definition.name, reason))
            }
            other => other,
        })?;
        if attached.is_empty() {
            return Err(ArmatureError::Configuration(format!(
                "controllers.{} has no attached motors",
                definition.name
            )));
        }

        for motor in &attached {
            if let Some(other) = owners.insert(motor.name().to_string(), definition.name.clone()) {
                return Err(ArmatureError::Configuration(format!(
                    "motor '{}' is attached to both controllers '{}' and '{}'",
                    motor.name(),
                    other,
                    definition.name
                )));
            }
        }

        plans.push(ControllerPlan {
            name: definition.name,
            target: BackendTarget::physical(port),
            motors: attached,
        });
    }

    if let Some(orphan) = motors.iter().find(|m| !owners.contains_key(m.name())) {
        return Err(ArmatureError::Configuration(format!(
            "motor '{}' is not attached to any controller",
            orphan.name()
        )));
    }
    Ok(plans)
}

async fn bring_up(
    controller: &dyn MotorController,
    motors: &[Arc<MotorDescriptor>],
    policy: &SyncPolicy,
) -> Result<()> {
    controller.connect(policy.connect_timeout).await?;
    controller.bind(motors, policy.bind_timeout).await
}

async fn teardown(controllers: &[Arc<dyn MotorController>]) {
    let results = futures::future::join_all(controllers.iter().map(|c| c.shutdown())).await;
    for (controller, result) in controllers.iter().zip(results) {
        if let Err(e) = result {
            error!("Controller '{}' failed to shut down during rollback: {}", controller.name(), e);
        }
    }
}

/// Assemble a robot against a simulator and start synchronizing it
pub async fn from_simulator(
    config: &RobotConfig,
    host: &str,
    port: u16,
    scene: &str,
    io: Arc<dyn SimulatorIo>,
    sessions: Arc<SessionManager>,
) -> Result<RobotAssembly> {
    Assembler::new(sessions)
        .with_simulator(io)
        .assemble(config, &BackendTarget::simulated(host, port, scene))
        .await
}

/// Assemble a robot on a motor bus and start synchronizing it
pub async fn from_bus(
    config: &RobotConfig,
    address: &str,
    bus: Arc<dyn MotorBus>,
    sessions: Arc<SessionManager>,
) -> Result<RobotAssembly> {
    Assembler::new(sessions)
        .with_bus(bus)
        .assemble(config, &BackendTarget::physical(address))
        .await
}
