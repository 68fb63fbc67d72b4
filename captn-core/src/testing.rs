//! Scripted in-memory container driver for tests.
//!
//! Mirrors the daemon semantics the executor relies on: rename moves a
//! container between names, create/start/stop/remove mutate a shared table,
//! and `observe` can be scripted with a queue of states to simulate flapping
//! or crashing containers. Every mutation is recorded so tests can assert
//! exact daemon interaction sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::docker::{
    ContainerDetails, ContainerDriver, ContainerSpec, ContainerStatus, ContainerSummary,
    ImageDetails, ImageSummary, RestartPolicySetting, RuntimeState,
};
use crate::errors::DriverError;
use crate::registry::Credentials;

/// A recorded daemon mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockAction {
    Pull(String),
    Create(String),
    Start(String),
    Stop(String),
    Rename(String, String),
    SetRestartPolicy(String, String),
    Remove(String),
    RemoveImage(String),
}

#[derive(Debug, Clone)]
struct MockContainer {
    details: ContainerDetails,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    observations: HashMap<String, VecDeque<RuntimeState>>,
    images: Vec<ImageSummary>,
    image_details: HashMap<String, ImageDetails>,
    actions: Vec<MockAction>,
    failures: HashMap<String, String>,
    next_id: u64,
}

/// Scripted driver; clone-free, share via `Arc`.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

pub fn running_state() -> RuntimeState {
    RuntimeState {
        status: ContainerStatus::Running,
        health: None,
        restart_count: 0,
        started_at: Some(Utc::now().to_rfc3339()),
        exit_code: None,
    }
}

pub fn exited_state() -> RuntimeState {
    RuntimeState {
        status: ContainerStatus::Exited,
        health: None,
        restart_count: 0,
        started_at: None,
        exit_code: Some(1),
    }
}

/// A plain running container with the given name and image reference.
pub fn container_details(name: &str, image_ref: &str, image_id: &str) -> ContainerDetails {
    ContainerDetails {
        id: format!("id-{name}"),
        name: name.to_string(),
        image_ref: image_ref.to_string(),
        image_id: image_id.to_string(),
        created_at: Some(Utc::now()),
        env: vec!["PATH=/usr/bin".to_string()],
        labels: HashMap::new(),
        restart_policy: RestartPolicySetting {
            name: "unless-stopped".to_string(),
            maximum_retry_count: None,
        },
        state: running_state(),
        cmd: None,
        entrypoint: None,
        working_dir: None,
        user: None,
        hostname: None,
        exposed_ports: None,
        volumes: None,
        healthcheck: None,
        host_config: None,
        networks: HashMap::new(),
    }
}

impl MockDriver {
    pub fn new() -> MockDriver {
        MockDriver::default()
    }

    pub fn add_container(&self, details: ContainerDetails) {
        let mut state = self.state.lock().unwrap();
        state.containers.push(MockContainer { details });
    }

    pub fn add_image(&self, reference: &str, details: ImageDetails) {
        let mut state = self.state.lock().unwrap();
        state.images.push(ImageSummary {
            id: details.id.clone(),
            repo_tags: vec![reference.to_string()],
        });
        state.image_details.insert(reference.to_string(), details);
    }

    /// Queue scripted `observe` results for a container name. Once drained,
    /// `observe` falls back to the container's table state.
    pub fn script_observations(&self, name: &str, states: Vec<RuntimeState>) {
        let mut state = self.state.lock().unwrap();
        state
            .observations
            .entry(name.to_string())
            .or_default()
            .extend(states);
    }

    /// Make an operation fail. Keys are `"pull"`, `"inspect_image"`,
    /// `"start"`, `"create"`, `"rename"`, `"stop"`, `"remove"` or targeted
    /// forms like `"start:web"`.
    pub fn fail_on(&self, key: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert(key.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.failures.remove(key);
    }

    pub fn actions(&self) -> Vec<MockAction> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .map(|c| c.details.name.clone())
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<ContainerDetails> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .find(|c| c.details.name == name)
            .map(|c| c.details.clone())
    }

    fn check_failure(
        state: &MockState,
        op: &str,
        target: &str,
    ) -> Result<(), DriverError> {
        let targeted = format!("{op}:{target}");
        if let Some(message) = state
            .failures
            .get(&targeted)
            .or_else(|| state.failures.get(op))
        {
            return Err(DriverError::Api(message.clone()));
        }
        Ok(())
    }

    fn find_mut<'a>(
        state: &'a mut MockState,
        name_or_id: &str,
    ) -> Result<&'a mut MockContainer, DriverError> {
        state
            .containers
            .iter_mut()
            .find(|c| c.details.name == name_or_id || c.details.id == name_or_id)
            .ok_or_else(|| DriverError::ContainerNotFound(name_or_id.to_string()))
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.details.state.status == ContainerStatus::Running)
            .map(|c| ContainerSummary {
                id: c.details.id.clone(),
                name: c.details.name.clone(),
                image: c.details.image_ref.clone(),
                state: c.details.state.status.to_string(),
                labels: c.details.labels.clone(),
            })
            .collect())
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerDetails, DriverError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::find_mut(&mut state, name_or_id)?.details.clone())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, DriverError> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, "inspect_image", reference)?;
        state
            .image_details
            .get(reference)
            .cloned()
            .ok_or_else(|| DriverError::ContainerNotFound(reference.to_string()))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DriverError> {
        Ok(self.state.lock().unwrap().images.clone())
    }

    async fn pull_image(
        &self,
        reference: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "pull", reference).map_err(|_| {
            DriverError::ImagePullFailed {
                reference: reference.to_string(),
                reason: "scripted failure".to_string(),
            }
        })?;
        state.actions.push(MockAction::Pull(reference.to_string()));
        if !state.image_details.contains_key(reference) {
            state.image_details.insert(
                reference.to_string(),
                ImageDetails {
                    id: format!("sha256:pulled-{reference}"),
                    repo_digests: vec![],
                    env: vec![],
                },
            );
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "create", &spec.name)?;
        if state.containers.iter().any(|c| c.details.name == spec.name) {
            return Err(DriverError::ConflictName(spec.name.clone()));
        }
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let mut details = container_details(&spec.name, &spec.image, "sha256:created");
        details.id = id.clone();
        details.env = spec.env.clone();
        details.labels = spec.labels.clone();
        details.state = RuntimeState {
            status: ContainerStatus::Created,
            health: None,
            restart_count: 0,
            started_at: None,
            exit_code: None,
        };
        state.actions.push(MockAction::Create(spec.name.clone()));
        state.containers.push(MockContainer { details });
        Ok(id)
    }

    async fn start(&self, name_or_id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "start", name_or_id)?;
        let container = Self::find_mut(&mut state, name_or_id)?;
        container.details.state = running_state();
        let name = container.details.name.clone();
        state.actions.push(MockAction::Start(name));
        Ok(())
    }

    async fn stop(&self, name_or_id: &str, _timeout: Duration) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "stop", name_or_id)?;
        let container = Self::find_mut(&mut state, name_or_id)?;
        container.details.state = RuntimeState {
            status: ContainerStatus::Exited,
            health: None,
            restart_count: container.details.state.restart_count,
            started_at: None,
            exit_code: Some(0),
        };
        let name = container.details.name.clone();
        state.actions.push(MockAction::Stop(name));
        Ok(())
    }

    async fn rename(&self, name_or_id: &str, new_name: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "rename", name_or_id)?;
        if state.containers.iter().any(|c| c.details.name == new_name) {
            return Err(DriverError::ConflictName(new_name.to_string()));
        }
        let container = Self::find_mut(&mut state, name_or_id)?;
        let old_name = container.details.name.clone();
        container.details.name = new_name.to_string();
        state
            .actions
            .push(MockAction::Rename(old_name, new_name.to_string()));
        Ok(())
    }

    async fn set_restart_policy(
        &self,
        name_or_id: &str,
        policy: &RestartPolicySetting,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "set_restart_policy", name_or_id)?;
        let container = Self::find_mut(&mut state, name_or_id)?;
        container.details.restart_policy = policy.clone();
        let name = container.details.name.clone();
        state
            .actions
            .push(MockAction::SetRestartPolicy(name, policy.name.clone()));
        Ok(())
    }

    async fn remove(&self, name_or_id: &str, _force: bool) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "remove", name_or_id)?;
        let index = state
            .containers
            .iter()
            .position(|c| c.details.name == name_or_id || c.details.id == name_or_id)
            .ok_or_else(|| DriverError::ContainerNotFound(name_or_id.to_string()))?;
        let removed = state.containers.remove(index);
        // Scripted observations die with the container they described.
        state.observations.remove(&removed.details.name);
        state
            .actions
            .push(MockAction::Remove(removed.details.name));
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "remove_image", reference)?;
        state.images.retain(|i| {
            i.id != reference && !i.repo_tags.iter().any(|t| t == reference)
        });
        state
            .actions
            .push(MockAction::RemoveImage(reference.to_string()));
        Ok(())
    }

    async fn observe(&self, name_or_id: &str) -> Result<RuntimeState, DriverError> {
        let mut state = self.state.lock().unwrap();
        let name = Self::find_mut(&mut state, name_or_id)?.details.name.clone();
        if let Some(queue) = state.observations.get_mut(&name) {
            if let Some(observation) = queue.pop_front() {
                return Ok(observation);
            }
        }
        Ok(Self::find_mut(&mut state, name_or_id)?.details.state.clone())
    }
}
