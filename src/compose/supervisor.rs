//! Service supervision
//!
//! Each service moves through
//! `pending -> starting -> running -> (stopped | crashed)`; a crashed
//! service goes back to `starting` when its restart policy allows it and
//! ends in `failed` otherwise. One tokio task per service drives its
//! container and records every transition here.

use super::model::RestartPolicy;
use crate::engine::{stop_gracefully, ContainerHandle, ContainerRuntime, ContainerSpec};
use crate::error::{ComposeError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Waiting for dependencies and resources
    Pending,
    /// Container is being started
    Starting,
    /// Container is running
    Running,
    /// Exited cleanly or stopped on request
    Stopped,
    /// Exited in a way the restart policy treats as a crash
    Crashed,
    /// Will not run again during this run
    Failed,
}

impl ServiceStatus {
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Pending, Starting | Stopped | Failed)
                | (Starting, Running | Stopped | Crashed | Failed)
                | (Running, Stopped | Crashed)
                | (Crashed, Starting | Stopped | Failed)
        )
    }

    /// Terminal states are never left during a run
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Crashed => "crashed",
            ServiceStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Observable state of one service
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub name: String,
    pub status: ServiceStatus,
    /// Current or last container
    pub container: Option<ContainerHandle>,
    /// Restarts performed so far
    pub restarts: u32,
    /// Exit code of the last container
    pub exit_code: Option<i32>,
    /// Why the service failed
    pub error: Option<String>,
}

impl ServiceState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Pending,
            container: None,
            restarts: 0,
            exit_code: None,
            error: None,
        }
    }
}

/// Whether dependents may launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Waiting,
    /// The container was started at least once
    Ready,
    /// The service never started; carries the reason
    Failed(String),
}

/// Exponential delay between restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl RestartBackoff {
    /// Delay before restart number `attempt` (zero based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

struct Slot {
    readiness: watch::Sender<Readiness>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks and drives the services of one run
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    states: Arc<RwLock<HashMap<String, ServiceState>>>,
    slots: HashMap<String, Slot>,
    /// Bumped on every transition
    changes: watch::Sender<u64>,
    backoff: RestartBackoff,
}

/// Resolves once `rx` reports a stop request; never when the sender is gone
pub(crate) async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await
    }
}

impl Supervisor {
    /// Supervisor for `services`, all starting out `pending`
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        services: &[String],
        backoff: RestartBackoff,
    ) -> Self {
        let states = services
            .iter()
            .map(|name| (name.clone(), ServiceState::new(name)))
            .collect();
        let slots = services
            .iter()
            .map(|name| {
                let slot = Slot {
                    readiness: watch::channel(Readiness::Waiting).0,
                    stop: watch::channel(false).0,
                    task: Mutex::new(None),
                };
                (name.clone(), slot)
            })
            .collect();

        Self {
            runtime,
            states: Arc::new(RwLock::new(states)),
            slots,
            changes: watch::channel(0).0,
            backoff,
        }
    }

    /// Whether `service` is supervised in this run
    pub fn supervises(&self, service: &str) -> bool {
        self.slots.contains_key(service)
    }

    /// Readiness of `service` as seen by its dependents
    pub fn readiness(&self, service: &str) -> Option<watch::Receiver<Readiness>> {
        self.slots.get(service).map(|s| s.readiness.subscribe())
    }

    /// Stop request flag of `service`
    pub fn stop_signal(&self, service: &str) -> Option<watch::Receiver<bool>> {
        self.slots.get(service).map(|s| s.stop.subscribe())
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Register the task driving `service`
    pub fn attach(&self, service: &str, task: JoinHandle<()>) -> Result<()> {
        let slot = self
            .slots
            .get(service)
            .ok_or_else(|| ComposeError::ServiceNotFound(service.to_string()))?;
        let mut guard = slot
            .task
            .lock()
            .map_err(|_| ComposeError::Lock("Failed to acquire task lock".to_string()))?;
        *guard = Some(task);
        Ok(())
    }

    /// Snapshot of one service
    pub fn state(&self, service: &str) -> Result<ServiceState> {
        let states = self
            .states
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;
        states
            .get(service)
            .cloned()
            .ok_or_else(|| ComposeError::ServiceNotFound(service.to_string()))
    }

    /// Snapshot of every service, sorted by name
    pub fn states(&self) -> Result<Vec<ServiceState>> {
        let states = self
            .states
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;
        let mut list: Vec<ServiceState> = states.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Wait until every service is either ready or known to have failed to start
    pub async fn wait_settled(&self) {
        for slot in self.slots.values() {
            let mut rx = slot.readiness.subscribe();
            let _ = rx.wait_for(|r| *r != Readiness::Waiting).await;
        }
    }

    fn update(
        &self,
        service: &str,
        next: ServiceStatus,
        apply: impl FnOnce(&mut ServiceState),
    ) -> Result<()> {
        {
            let mut states = self
                .states
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            let state = states
                .get_mut(service)
                .ok_or_else(|| ComposeError::ServiceNotFound(service.to_string()))?;

            if !state.status.can_transition_to(next) {
                return Err(ComposeError::Runtime(format!(
                    "invalid transition of {} from {} to {}",
                    service, state.status, next
                )));
            }
            tracing::info!("Service {}: {} -> {}", service, state.status, next);
            state.status = next;
            apply(state);
        }

        self.changes.send_modify(|n| *n += 1);
        Ok(())
    }

    fn transition(&self, service: &str, next: ServiceStatus) {
        if let Err(e) = self.update(service, next, |_| {}) {
            tracing::warn!("{}", e);
        }
    }

    fn set_readiness(&self, service: &str, readiness: Readiness) {
        if let Some(slot) = self.slots.get(service) {
            // Readiness is decided once
            slot.readiness.send_if_modified(|current| {
                if *current == Readiness::Waiting {
                    *current = readiness;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Mark `service` as failed for this run
    pub fn fail(&self, service: &str, error: &ComposeError) {
        tracing::error!("{}", error);
        let message = error.to_string();
        if let Err(e) = self.update(service, ServiceStatus::Failed, |s| {
            s.error = Some(message.clone())
        }) {
            tracing::warn!("{}", e);
        }
        self.set_readiness(service, Readiness::Failed(message));
    }

    /// Mark a service stopped before it ever started
    pub fn abandon(&self, service: &str) {
        self.transition(service, ServiceStatus::Stopped);
        self.set_readiness(service, Readiness::Failed("stopped before start".to_string()));
    }

    fn exited(&self, service: &str, next: ServiceStatus, code: Option<i32>) {
        if let Err(e) = self.update(service, next, |s| s.exit_code = code) {
            tracing::warn!("{}", e);
        }
    }

    /// Start `spec` and keep it running according to `policy` until stopped.
    ///
    /// The first start failure is reported as a launch failure; dependents
    /// waiting on this service are released either way.
    pub async fn run(&self, spec: ContainerSpec, policy: RestartPolicy, grace: Duration) {
        let service = spec.service.clone();
        let Some(mut stop_rx) = self.stop_signal(&service) else {
            tracing::warn!("Service {} is not supervised", service);
            return;
        };
        let mut restarts = 0u32;

        loop {
            let stopping = *stop_rx.borrow();
            if stopping {
                self.abandon(&service);
                return;
            }

            self.transition(&service, ServiceStatus::Starting);
            let handle = match self.runtime.start(&spec).await {
                Ok(handle) => Some(handle),
                // Only restarts are retried; the first start decides the launch
                Err(e) if restarts > 0 && e.is_retryable() => {
                    tracing::warn!("Restart of {} failed: {}", service, e);
                    None
                }
                Err(e @ ComposeError::LaunchFailure { .. }) => {
                    self.fail(&service, &e);
                    return;
                }
                Err(e) => {
                    self.fail(&service, &ComposeError::launch(&service, e));
                    return;
                }
            };

            let crash = match handle {
                Some(handle) => {
                    if let Err(e) = self.update(&service, ServiceStatus::Running, |s| {
                        s.container = Some(handle.clone());
                        s.exit_code = None;
                    }) {
                        tracing::warn!("{}", e);
                    }
                    self.set_readiness(&service, Readiness::Ready);

                    let exit = tokio::select! {
                        code = self.runtime.wait(&handle) => code,
                        _ = stop_requested(&mut stop_rx) => {
                            let code = match stop_gracefully(self.runtime.as_ref(), &handle, grace).await {
                                Ok(code) => code,
                                Err(e) => {
                                    tracing::warn!("Failed to stop {}: {}", handle.name, e);
                                    None
                                }
                            };
                            self.exited(&service, ServiceStatus::Stopped, code);
                            return;
                        }
                    };

                    let code = match exit {
                        Ok(code) => code,
                        Err(e) => {
                            tracing::warn!("Lost track of {}: {}", handle.name, e);
                            -1
                        }
                    };

                    let stopping = *stop_rx.borrow();
                    if stopping || !policy.treats_as_crash(code) {
                        tracing::info!("Service {} exited with code {}", service, code);
                        self.exited(&service, ServiceStatus::Stopped, Some(code));
                        return;
                    }

                    tracing::warn!("Service {} crashed with exit code {}", service, code);
                    self.exited(&service, ServiceStatus::Crashed, Some(code));
                    format!("exited with code {}", code)
                }
                None => {
                    self.transition(&service, ServiceStatus::Crashed);
                    "could not be started".to_string()
                }
            };

            if !policy.allows_restart(restarts) {
                let cause = format!("{} after {} restart(s)", crash, restarts);
                self.fail(&service, &ComposeError::Runtime(format!("{}: {}", service, cause)));
                return;
            }

            let delay = self.backoff.delay(restarts);
            restarts += 1;
            tracing::info!("Restarting {} in {:?} (attempt {})", service, delay, restarts);

            if let Ok(mut states) = self.states.write() {
                if let Some(state) = states.get_mut(&service) {
                    state.restarts = restarts;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut stop_rx) => {
                    self.transition(&service, ServiceStatus::Stopped);
                    return;
                }
            }
        }
    }

    /// Request `service` to stop and wait until its task has finished
    pub async fn stop(&self, service: &str) -> Result<ServiceState> {
        let slot = self
            .slots
            .get(service)
            .ok_or_else(|| ComposeError::ServiceNotFound(service.to_string()))?;

        slot.stop.send_replace(true);

        let task = slot
            .task
            .lock()
            .map_err(|_| ComposeError::Lock("Failed to acquire task lock".to_string()))?
            .take();

        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::warn!("Task of service {} ended abnormally: {}", service, e);
                }
            }
            None => {
                let state = self.state(service)?;
                if !state.status.is_terminal() {
                    self.abandon(service);
                }
            }
        }

        self.state(service)
    }
}
