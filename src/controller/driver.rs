//! Generic controller driving any [`BackendSession`]

use super::{BackendSession, ControllerHealth, ControllerState, MotorController, SyncPolicy};
use crate::backend::{BackendKind, IoResult};
use crate::error::BackendIoError;
use crate::motor::MotorDescriptor;
use crate::session::{SessionHandle, SessionManager};
use crate::{ArmatureError, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

struct Inner<S: BackendSession> {
    session: S,
    lease: Option<SessionHandle>,
    bound: Vec<Arc<MotorDescriptor>>,
    /// Backend handles, parallel to `bound`
    handles: Vec<S::Handle>,
}

/// Controller for one backend session
///
/// All backend traffic goes through `inner`, so a manual `synchronize` and the
/// background loop never interleave on the wire.
pub struct Controller<S: BackendSession> {
    name: String,
    backend: BackendKind,
    target: String,
    policy: SyncPolicy,
    sessions: Arc<SessionManager>,
    inner: Mutex<Inner<S>>,
    motors: ArcSwap<Vec<Arc<MotorDescriptor>>>,
    health: watch::Sender<ControllerHealth>,
    stop: watch::Sender<bool>,
    started: AtomicBool,
    sync_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: BackendSession> Controller<S> {
    pub fn with_session(
        name: impl Into<String>,
        session: S,
        sessions: Arc<SessionManager>,
        policy: SyncPolicy,
    ) -> Self {
        let name = name.into();
        let backend = session.backend();
        let target = session.target();
        let (health, _) = watch::channel(ControllerHealth::new(&name, backend, &target));
        let (stop, _) = watch::channel(false);

        Self {
            name,
            backend,
            target,
            policy,
            sessions,
            inner: Mutex::new(Inner {
                session,
                lease: None,
                bound: Vec::new(),
                handles: Vec::new(),
            }),
            motors: ArcSwap::from_pointee(Vec::new()),
            health,
            stop,
            started: AtomicBool::new(false),
            sync_task: std::sync::Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    fn set_state(&self, state: ControllerState) {
        self.health.send_modify(|health| health.state = state);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ControllerState::Stopped {
            return Err(ArmatureError::ControllerClosed(self.name.clone()));
        }
        Ok(())
    }

    fn binding_error(&self, object: &str, reason: impl Into<String>) -> ArmatureError {
        ArmatureError::Binding {
            controller: self.name.clone(),
            object: object.to_string(),
            reason: reason.into(),
        }
    }

    fn sync_error(&self, reason: impl Into<String>) -> ArmatureError {
        ArmatureError::Synchronization {
            controller: self.name.clone(),
            reason: reason.into(),
        }
    }

    async fn locate_all(
        &self,
        session: &mut S,
        motors: &[Arc<MotorDescriptor>],
    ) -> Result<Vec<S::Handle>> {
        if let Err(e) = session.prepare().await {
            return Err(self.binding_error(&session.setup_label(), e.to_string()));
        }

        let mut handles = Vec::with_capacity(motors.len());
        let mut seen: HashMap<S::Handle, &str> = HashMap::new();
        for motor in motors {
            let handle = session
                .locate(motor)
                .await
                .map_err(|e| self.binding_error(motor.name(), e.to_string()))?;
            if let Some(other) = seen.insert(handle.clone(), motor.name()) {
                return Err(self.binding_error(
                    motor.name(),
                    format!("resolves to the same backend object as '{}'", other),
                ));
            }
            debug!("Controller '{}' located '{}' as {:?}", self.name, motor.name(), handle);
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Write pending goals, then read every bound motor back
    async fn tick(&self, inner: &mut Inner<S>) -> IoResult<()> {
        let goals: Vec<(S::Handle, f64)> = inner
            .bound
            .iter()
            .zip(&inner.handles)
            .filter_map(|(motor, handle)| {
                motor
                    .pending_command()
                    .map(|command| (handle.clone(), command))
            })
            .collect();
        if !goals.is_empty() {
            inner.session.write_goal_positions(&goals).await?;
        }

        let readings = inner.session.read_positions(&inner.handles).await?;
        if readings.len() != inner.handles.len() {
            return Err(BackendIoError::Transient(format!(
                "expected {} readings, got {}",
                inner.handles.len(),
                readings.len()
            )));
        }

        let read_at = Instant::now();
        let synced_at = Utc::now();
        for (motor, raw) in inner.bound.iter().zip(readings) {
            motor.record_reading(raw, read_at, synced_at);
        }
        Ok(())
    }

    async fn sync_with_retry(&self, inner: &mut Inner<S>) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.tick(inner).await {
                Ok(()) => {
                    self.record_success();
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.policy.sync_attempts => {
                    let delay = self.policy.backoff(attempt);
                    debug!(
                        "Controller '{}' sync attempt {}/{} failed: {} (retrying in {:?})",
                        self.name, attempt, self.policy.sync_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = format!("{} (after {} attempt(s))", e, attempt);
                    self.record_failure(&reason);
                    return Err(self.sync_error(reason));
                }
            }
        }
    }

    fn record_success(&self) {
        let resume = if self.started.load(Ordering::SeqCst) {
            ControllerState::Running
        } else {
            ControllerState::Bound
        };
        let mut recovered = false;
        self.health.send_modify(|health| {
            if health.state == ControllerState::Degraded {
                health.state = resume;
                recovered = true;
            }
            health.ticks += 1;
            health.consecutive_failures = 0;
            health.last_sync = Some(Utc::now());
            health.last_error = None;
        });
        if recovered {
            info!("Controller '{}' recovered, back to {}", self.name, resume);
        }
    }

    fn record_failure(&self, reason: &str) {
        let mut degraded_now = false;
        self.health.send_modify(|health| {
            if health.state != ControllerState::Degraded {
                degraded_now = true;
            }
            health.state = ControllerState::Degraded;
            health.consecutive_failures += 1;
            health.last_error = Some(reason.to_string());
        });
        if degraded_now {
            warn!("Controller '{}' degraded: {}", self.name, reason);
        }
    }
}

/// Resolves once the stop flag is raised
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_sync_loop<S: BackendSession>(
    weak: Weak<Controller<S>>,
    mut stop: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = ticker.tick() => {}
        }

        let Some(controller) = weak.upgrade() else {
            break;
        };
        match controller.synchronize().await {
            Ok(()) => {}
            Err(ArmatureError::ControllerClosed(_)) => break,
            // Degradation is already recorded in the health channel
            Err(e) => debug!("{}", e),
        }
    }
    debug!("Sync loop exited");
}

#[async_trait]
impl<S: BackendSession> MotorController for Controller<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self) -> ControllerState {
        self.health.borrow().state
    }

    fn health(&self) -> ControllerHealth {
        self.health.borrow().clone()
    }

    fn subscribe_health(&self) -> watch::Receiver<ControllerHealth> {
        self.health.subscribe()
    }

    fn motors(&self) -> Vec<Arc<MotorDescriptor>> {
        self.motors.load().as_ref().clone()
    }

    async fn connect(&self, timeout: Duration) -> Result<SessionHandle> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;
        self.ensure_open()?;

        match self.state() {
            ControllerState::Connected
            | ControllerState::Bound
            | ControllerState::Running
            | ControllerState::Degraded => {
                if let Some(lease) = &inner.lease {
                    return Ok(lease.clone());
                }
            }
            _ => {}
        }
        // A connect that was cancelled halfway may have left its lease behind
        if let Some(stale) = inner.lease.take() {
            self.sessions.release(&stale);
        }

        let lease = self.sessions.acquire(&self.name, self.backend, &self.target)?;
        inner.lease = Some(lease.clone());
        self.set_state(ControllerState::Connecting);
        info!(
            "Controller '{}' connecting to {} backend at {}",
            self.name, self.backend, self.target
        );

        let attempts = self.policy.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, inner.session.open()).await {
                Ok(Ok(())) => {
                    self.set_state(ControllerState::Connected);
                    info!(
                        "Controller '{}' connected to {} (session {})",
                        self.name, self.target, lease.id
                    );
                    return Ok(lease);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", timeout),
            }
            inner.session.close().await;

            if attempt < attempts {
                let delay = self.policy.backoff(attempt);
                warn!(
                    "Controller '{}' connection attempt {}/{} failed: {} (retrying in {:?})",
                    self.name, attempt, attempts, last_error, delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        if let Some(lease) = inner.lease.take() {
            self.sessions.release(&lease);
        }
        self.set_state(ControllerState::Unconnected);
        error!("Controller '{}' could not reach {}: {}", self.name, self.target, last_error);
        Err(ArmatureError::BackendConnection {
            controller: self.name.clone(),
            target: self.target.clone(),
            attempts,
            reason: last_error,
        })
    }

    async fn bind(&self, motors: &[Arc<MotorDescriptor>], timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner.lock().await;

        match self.state() {
            ControllerState::Stopped => {
                return Err(ArmatureError::ControllerClosed(self.name.clone()))
            }
            ControllerState::Connected => {}
            ControllerState::Bound | ControllerState::Running | ControllerState::Degraded => {
                return Err(self.binding_error("controller", "motors are already bound"));
            }
            other => {
                return Err(self.binding_error(
                    "session",
                    format!("controller is {}, connect first", other),
                ));
            }
        }

        let located = self.locate_all(&mut inner.session, motors);
        let handles = match tokio::time::timeout(timeout, located).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(self.binding_error(
                    "backend",
                    format!("binding timed out after {:?}", timeout),
                ));
            }
        };

        let mut claimed: Vec<&Arc<MotorDescriptor>> = Vec::with_capacity(motors.len());
        for motor in motors {
            if let Err(owner) = motor.claim(&self.name) {
                for done in claimed {
                    done.release(&self.name);
                }
                return Err(self.binding_error(
                    motor.name(),
                    format!("already synchronized by controller '{}'", owner),
                ));
            }
            claimed.push(motor);
        }

        inner.bound = motors.to_vec();
        inner.handles = handles;
        self.motors.store(Arc::new(motors.to_vec()));
        self.set_state(ControllerState::Bound);
        info!("Controller '{}' bound {} motor(s)", self.name, motors.len());
        Ok(())
    }

    async fn synchronize(&self) -> Result<()> {
        self.ensure_open()?;
        let mut stop = self.stop.subscribe();

        let work = async {
            let mut inner = self.inner.lock().await;
            match self.state() {
                ControllerState::Stopped => Err(ArmatureError::ControllerClosed(self.name.clone())),
                ControllerState::Bound | ControllerState::Running | ControllerState::Degraded => {
                    self.sync_with_retry(&mut inner).await
                }
                other => Err(self.sync_error(format!(
                    "controller is {} and has no bound motors",
                    other
                ))),
            }
        };

        tokio::select! {
            biased;
            _ = stopped(&mut stop) => Err(ArmatureError::ControllerClosed(self.name.clone())),
            result = work => result,
        }
    }

    fn start(self: Arc<Self>) -> Result<()> {
        match self.state() {
            ControllerState::Stopped => {
                return Err(ArmatureError::ControllerClosed(self.name.clone()))
            }
            ControllerState::Bound | ControllerState::Running | ControllerState::Degraded => {}
            other => {
                return Err(self.sync_error(format!(
                    "cannot start synchronization while {}",
                    other
                )))
            }
        }

        let mut task = self.sync_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return Ok(());
        }

        let period = self.policy.sync_period;
        *task = Some(tokio::spawn(run_sync_loop(
            Arc::downgrade(&self),
            self.stop.subscribe(),
            period,
        )));
        self.started.store(true, Ordering::SeqCst);
        self.health.send_modify(|health| {
            if health.state == ControllerState::Bound {
                health.state = ControllerState::Running;
            }
        });
        info!("Controller '{}' synchronizing every {:?}", self.name, period);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.state() == ControllerState::Stopped {
            return Ok(());
        }
        info!("Shutting down controller '{}'", self.name);
        self.stop.send_replace(true);

        let task = self
            .sync_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.policy.shutdown_grace, &mut task).await.is_err() {
                warn!(
                    "Sync loop of '{}' did not stop within {:?}, aborting it",
                    self.name, self.policy.shutdown_grace
                );
                task.abort();
            }
        }

        let mut inner = self.inner.lock().await;
        if self.state() == ControllerState::Stopped {
            return Ok(());
        }

        for motor in inner.bound.drain(..) {
            motor.release(&self.name);
        }
        inner.handles.clear();
        inner.session.close().await;
        if let Some(lease) = inner.lease.take() {
            self.sessions.release(&lease);
        }
        self.motors.store(Arc::new(Vec::new()));
        self.set_state(ControllerState::Stopped);
        info!("Controller '{}' stopped", self.name);
        Ok(())
    }
}

impl<S: BackendSession> Drop for Controller<S> {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        if let Some(task) = self.sync_task.get_mut().ok().and_then(Option::take) {
            task.abort();
        }

        let inner = self.inner.get_mut();
        for motor in inner.bound.drain(..) {
            motor.release(&self.name);
        }
        if let Some(lease) = inner.lease.take() {
            debug!(
                "Controller '{}' dropped without shutdown, releasing {}",
                self.name, lease.target
            );
            self.sessions.release(&lease);
        }
    }
}
