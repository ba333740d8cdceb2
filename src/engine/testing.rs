//! In-memory engine used by the orchestration tests
//!
//! The fake runtime records every call per service and lets a test script
//! start failures, exit codes and containers that ignore a stop request.

use super::{BuildRequest, ContainerHandle, ContainerRuntime, ContainerSpec, ImageBuilder};
use crate::error::{ComposeError, Result};
use crate::network::NetworkSpec;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;

/// Exit code reported for a container that honoured a stop request
pub const STOPPED_EXIT: i32 = 143;
/// Exit code reported for a killed container
pub const KILLED_EXIT: i32 = 137;

#[derive(Default)]
struct FakeState {
    /// `(service, call)` in call order
    calls: Vec<(String, String)>,
    fail_start: HashSet<String>,
    /// 1-based start attempts that fail, per service
    failing_attempts: HashMap<String, HashSet<usize>>,
    ignore_stop: HashSet<String>,
    exits: HashMap<String, VecDeque<i32>>,
    running: HashMap<String, watch::Sender<Option<i32>>>,
    specs: HashMap<String, ContainerSpec>,
    networks: BTreeSet<String>,
    failing_networks: HashSet<String>,
    next_id: u64,
}

/// Scriptable in-memory container runtime
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every start of `service` fails
    pub fn fail_start(self, service: &str) -> Self {
        self.with_state(|s| {
            s.fail_start.insert(service.to_string());
        });
        self
    }

    /// Only the given start attempts of `service` fail, counting from 1
    pub fn fail_start_attempts(self, service: &str, attempts: &[usize]) -> Self {
        self.with_state(|s| {
            s.failing_attempts
                .entry(service.to_string())
                .or_default()
                .extend(attempts.iter().copied());
        });
        self
    }

    /// `service` ignores stop requests and has to be killed
    pub fn ignore_stop(self, service: &str) -> Self {
        self.with_state(|s| {
            s.ignore_stop.insert(service.to_string());
        });
        self
    }

    /// Successive starts of `service` exit right away with these codes.
    /// Once the codes are used up the container keeps running.
    pub fn exit_with(self, service: &str, codes: &[i32]) -> Self {
        self.with_state(|s| {
            s.exits
                .entry(service.to_string())
                .or_default()
                .extend(codes.iter().copied());
        });
        self
    }

    /// An engine network that exists before the run
    pub fn with_network(self, name: &str) -> Self {
        self.with_state(|s| {
            s.networks.insert(name.to_string());
        });
        self
    }

    /// Creating the network `name` fails
    pub fn fail_network(self, name: &str) -> Self {
        self.with_state(|s| {
            s.failing_networks.insert(name.to_string());
        });
        self
    }

    /// Calls made for `service`, in order
    pub fn calls_for(&self, service: &str) -> Vec<String> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|(svc, _)| svc == service)
                .map(|(_, call)| call.clone())
                .collect()
        })
    }

    /// Services in the order of their calls named `call`
    pub fn services_with(&self, call: &str) -> Vec<String> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|(_, c)| c == call)
                .map(|(svc, _)| svc.clone())
                .collect()
        })
    }

    /// Number of times `service` was started
    pub fn starts(&self, service: &str) -> usize {
        self.calls_for(service).iter().filter(|c| *c == "start").count()
    }

    /// Last container spec started for `service`
    pub fn spec_for(&self, service: &str) -> Option<ContainerSpec> {
        self.with_state(|s| s.specs.get(service).cloned())
    }

    /// Engine networks currently present
    pub fn networks(&self) -> Vec<String> {
        self.with_state(|s| s.networks.iter().cloned().collect())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn record(&self, service: &str, call: &str) {
        self.with_state(|s| s.calls.push((service.to_string(), call.to_string())));
    }

    fn exit(&self, handle: &ContainerHandle, code: i32) {
        self.with_state(|s| {
            if let Some(tx) = s.running.get(&handle.id) {
                tx.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(code);
                        true
                    } else {
                        false
                    }
                });
            }
        });
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_network(&self, network: &NetworkSpec) -> Result<bool> {
        self.with_state(|s| {
            s.calls
                .push((network.resource_name.clone(), "ensure_network".to_string()));
            if s.failing_networks.contains(&network.resource_name) {
                return Err(ComposeError::Runtime(format!(
                    "cannot create network {}",
                    network.resource_name
                )));
            }
            Ok(s.networks.insert(network.resource_name.clone()))
        })
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.with_state(|s| s.networks.contains(name)))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push((name.to_string(), "remove_network".to_string()));
            s.networks.remove(name);
        });
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record(&spec.service, "start");
        self.with_state(|s| {
            let attempt = s
                .calls
                .iter()
                .filter(|(service, call)| *service == spec.service && call == "start")
                .count();
            let scripted = s
                .failing_attempts
                .get(&spec.service)
                .is_some_and(|attempts| attempts.contains(&attempt));
            if scripted || s.fail_start.contains(&spec.service) {
                return Err(ComposeError::Runtime(format!(
                    "image {} not found",
                    spec.image
                )));
            }

            s.next_id += 1;
            let handle = ContainerHandle {
                id: format!("fake-{}", s.next_id),
                name: spec.name.clone(),
                service: spec.service.clone(),
            };
            let exit = s
                .exits
                .get_mut(&spec.service)
                .and_then(|codes| codes.pop_front());
            let (tx, _) = watch::channel(exit);
            s.running.insert(handle.id.clone(), tx);
            s.specs.insert(spec.service.clone(), spec.clone());
            Ok(handle)
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i32> {
        let mut rx = self
            .with_state(|s| s.running.get(&handle.id).map(|tx| tx.subscribe()))
            .ok_or_else(|| ComposeError::Runtime(format!("no such container {}", handle.name)))?;

        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ComposeError::Runtime(format!("container {} vanished", handle.name)))?;
        Ok(code.unwrap_or_default())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.record(&handle.service, "stop");
        let ignored = self.with_state(|s| s.ignore_stop.contains(&handle.service));
        if !ignored {
            self.exit(handle, STOPPED_EXIT);
        }
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        self.record(&handle.service, "kill");
        self.exit(handle, KILLED_EXIT);
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.record(&handle.service, "remove");
        self.with_state(|s| {
            s.running.remove(&handle.id);
        });
        Ok(())
    }
}

/// Image builder that records the tags it was asked to build
#[derive(Default)]
pub struct FakeBuilder {
    built: Mutex<Vec<BuildRequest>>,
    failing: HashSet<String>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Building `tag` fails
    pub fn fail(mut self, tag: &str) -> Self {
        self.failing.insert(tag.to_string());
        self
    }

    /// Tags built so far, in order
    pub fn tags(&self) -> Vec<String> {
        self.built
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.tag.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<BuildRequest> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<()> {
        if self.failing.contains(&request.tag) {
            return Err(ComposeError::Build(format!("build of {} failed", request.tag)));
        }
        self.built.lock().unwrap().push(request.clone());
        Ok(())
    }
}
