//! Container daemon access.
//!
//! The executor depends on the [`ContainerDriver`] capability, not on the
//! daemon client directly; [`DockerDriver`] is the bollard-backed
//! implementation. Model types are daemon-shaped but owned here so tests can
//! provide scripted drivers.

pub mod spec;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, RenameContainerOptions, StopContainerOptions,
    UpdateContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{
    ContainerStateStatusEnum, EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::debug;

use crate::errors::DriverError;
use crate::registry::Credentials;

/// Lightweight listing entry.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

/// Container run state as observed by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Health as reported by the container's healthcheck, when one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// A point-in-time observation used by the verifier.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeState {
    pub status: ContainerStatus,
    /// `None` when the container defines no healthcheck.
    pub health: Option<HealthState>,
    pub restart_count: i64,
    pub started_at: Option<String>,
    pub exit_code: Option<i64>,
}

impl RuntimeState {
    pub fn describe(&self) -> String {
        match self.health {
            Some(health) => format!("{} ({:?})", self.status, health),
            None => self.status.to_string(),
        }
    }
}

/// Restart policy in daemon terms (`no`, `always`, `unless-stopped`,
/// `on-failure`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartPolicySetting {
    pub name: String,
    pub maximum_retry_count: Option<i64>,
}

impl RestartPolicySetting {
    pub fn none() -> RestartPolicySetting {
        RestartPolicySetting {
            name: "no".to_string(),
            maximum_retry_count: None,
        }
    }
}

/// Full inspection of one container: identity, environment, and the verbatim
/// carry-over material for building a replacement.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    /// Image reference as written in the container's config (`nginx:1.25`).
    pub image_ref: String,
    /// Image id (`sha256:...`) the container actually runs.
    pub image_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub restart_policy: RestartPolicySetting,
    pub state: RuntimeState,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    pub volumes: Option<HashMap<String, HashMap<(), ()>>>,
    pub healthcheck: Option<HealthConfig>,
    pub host_config: Option<HostConfig>,
    pub networks: HashMap<String, EndpointSettings>,
}

/// Inspection of a local image.
#[derive(Debug, Clone, Default)]
pub struct ImageDetails {
    pub id: String,
    pub repo_digests: Vec<String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Creation payload for a replacement (or helper) container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    pub volumes: Option<HashMap<String, HashMap<(), ()>>>,
    pub healthcheck: Option<HealthConfig>,
    pub host_config: Option<HostConfig>,
    pub networks: HashMap<String, EndpointSettings>,
}

/// Capability the executor and coordinator depend on for all container
/// mutations and observations.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DriverError>;
    async fn inspect(&self, name_or_id: &str) -> Result<ContainerDetails, DriverError>;
    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, DriverError>;
    async fn list_images(&self) -> Result<Vec<ImageSummary>, DriverError>;
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), DriverError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DriverError>;
    async fn start(&self, name_or_id: &str) -> Result<(), DriverError>;
    async fn stop(&self, name_or_id: &str, timeout: Duration) -> Result<(), DriverError>;
    async fn rename(&self, name_or_id: &str, new_name: &str) -> Result<(), DriverError>;
    async fn set_restart_policy(
        &self,
        name_or_id: &str,
        policy: &RestartPolicySetting,
    ) -> Result<(), DriverError>;
    async fn remove(&self, name_or_id: &str, force: bool) -> Result<(), DriverError>;
    async fn remove_image(&self, reference: &str) -> Result<(), DriverError>;
    /// Single state observation for verification polling.
    async fn observe(&self, name_or_id: &str) -> Result<RuntimeState, DriverError>;
}

/// Bollard-backed driver.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect via the platform's local defaults (Unix socket on Linux).
    pub async fn connect() -> Result<DockerDriver, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::DaemonUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| DriverError::DaemonUnavailable(e.to_string()))?;
        Ok(DockerDriver { docker })
    }
}

fn map_bollard_error(context: &str, error: bollard::errors::Error) -> DriverError {
    match &error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::ContainerNotFound(context.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => DriverError::ConflictName(context.to_string()),
        bollard::errors::Error::HyperResponseError { .. }
        | bollard::errors::Error::IOError { .. } => {
            DriverError::DaemonUnavailable(error.to_string())
        }
        _ => DriverError::Api(format!("{context}: {error}")),
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

fn map_health(health: Option<HealthStatusEnum>) -> Option<HealthState> {
    match health {
        Some(HealthStatusEnum::STARTING) => Some(HealthState::Starting),
        Some(HealthStatusEnum::HEALTHY) => Some(HealthState::Healthy),
        Some(HealthStatusEnum::UNHEALTHY) => Some(HealthState::Unhealthy),
        _ => None,
    }
}

fn restart_policy_enum(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DriverError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let listed = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_bollard_error("list containers", e))?;

        Ok(listed
            .into_iter()
            .map(|entry| ContainerSummary {
                id: entry.id.unwrap_or_default(),
                name: entry
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: entry.image.unwrap_or_default(),
                state: entry.state.unwrap_or_default(),
                labels: entry.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerDetails, DriverError> {
        let inspected = self
            .docker
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_bollard_error(name_or_id, e))?;

        let state = inspected.state.unwrap_or_default();
        let config = inspected.config.unwrap_or_default();
        let host_config = inspected.host_config;
        let restart = host_config
            .as_ref()
            .and_then(|hc| hc.restart_policy.clone());

        Ok(ContainerDetails {
            id: inspected.id.unwrap_or_default(),
            name: inspected
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image_ref: config.image.clone().unwrap_or_default(),
            image_id: inspected.image.unwrap_or_default(),
            created_at: inspected
                .created
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
            env: config.env.clone().unwrap_or_default(),
            labels: config.labels.clone().unwrap_or_default(),
            restart_policy: RestartPolicySetting {
                name: restart
                    .as_ref()
                    .and_then(|r| r.name.as_ref())
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "no".to_string()),
                maximum_retry_count: restart.as_ref().and_then(|r| r.maximum_retry_count),
            },
            state: RuntimeState {
                status: map_status(state.status),
                health: map_health(state.health.as_ref().and_then(|h| h.status)),
                restart_count: inspected.restart_count.unwrap_or(0),
                started_at: state.started_at.clone(),
                exit_code: state.exit_code,
            },
            cmd: config.cmd,
            entrypoint: config.entrypoint,
            working_dir: config.working_dir.filter(|w| !w.is_empty()),
            user: config.user.filter(|u| !u.is_empty()),
            hostname: config.hostname.filter(|h| !h.is_empty()),
            exposed_ports: config.exposed_ports,
            volumes: config.volumes,
            healthcheck: config.healthcheck,
            host_config,
            networks: inspected
                .network_settings
                .and_then(|ns| ns.networks)
                .unwrap_or_default(),
        })
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails, DriverError> {
        let inspected = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| map_bollard_error(reference, e))?;
        Ok(ImageDetails {
            id: inspected.id.unwrap_or_default(),
            repo_digests: inspected.repo_digests.unwrap_or_default(),
            env: inspected
                .config
                .and_then(|c| c.env)
                .unwrap_or_default(),
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DriverError> {
        let listed = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_bollard_error("list images", e))?;
        Ok(listed
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                repo_tags: image.repo_tags,
            })
            .collect())
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), DriverError> {
        let creds = credentials.map(|c| bollard::auth::DockerCredentials {
            username: c.username.clone(),
            password: c.password.clone().or_else(|| c.token.clone()),
            ..Default::default()
        });

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: reference.to_string(),
                    ..Default::default()
                }),
                None,
                creds,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| DriverError::ImagePullFailed {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
        debug!(reference, "image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            hostname: spec.hostname.clone(),
            exposed_ports: spec.exposed_ports.clone(),
            volumes: spec.volumes.clone(),
            healthcheck: spec.healthcheck.clone(),
            host_config: spec.host_config.clone(),
            networking_config: if spec.networks.is_empty() {
                None
            } else {
                Some(NetworkingConfig {
                    endpoints_config: spec.networks.clone(),
                })
            },
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| map_bollard_error(&spec.name, e))?;
        Ok(created.id)
    }

    async fn start(&self, name_or_id: &str) -> Result<(), DriverError> {
        self.docker
            .start_container::<String>(name_or_id, None)
            .await
            .map_err(|e| map_bollard_error(name_or_id, e))
    }

    async fn stop(&self, name_or_id: &str, timeout: Duration) -> Result<(), DriverError> {
        self.docker
            .stop_container(
                name_or_id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(|e| map_bollard_error(name_or_id, e))
    }

    async fn rename(&self, name_or_id: &str, new_name: &str) -> Result<(), DriverError> {
        self.docker
            .rename_container(
                name_or_id,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await
            .map_err(|e| map_bollard_error(name_or_id, e))
    }

    async fn set_restart_policy(
        &self,
        name_or_id: &str,
        policy: &RestartPolicySetting,
    ) -> Result<(), DriverError> {
        let update = UpdateContainerOptions::<String> {
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(restart_policy_enum(&policy.name)),
                maximum_retry_count: policy.maximum_retry_count,
            }),
            ..Default::default()
        };
        self.docker
            .update_container(name_or_id, update)
            .await
            .map_err(|e| map_bollard_error(name_or_id, e))?;
        Ok(())
    }

    async fn remove(&self, name_or_id: &str, force: bool) -> Result<(), DriverError> {
        self.docker
            .remove_container(
                name_or_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_bollard_error(name_or_id, e))
    }

    async fn remove_image(&self, reference: &str) -> Result<(), DriverError> {
        self.docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
            .map_err(|e| map_bollard_error(reference, e))?;
        Ok(())
    }

    async fn observe(&self, name_or_id: &str) -> Result<RuntimeState, DriverError> {
        let details = self.inspect(name_or_id).await?;
        Ok(details.state)
    }
}
