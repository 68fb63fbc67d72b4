//! Replacement-container spec construction.
//!
//! The new container is the old one with a digest-pinned image, the filtered
//! environment, and a `captn.lastUpdatedAt` label; network, mount, port,
//! restart-policy and resource settings are copied verbatim.

use chrono::{DateTime, Utc};

use crate::env_filter::EnvFilter;
use crate::LAST_UPDATED_LABEL;

use super::{ContainerDetails, ContainerSpec, ImageDetails};

/// Derive the spec for the container that replaces `old`, running
/// `image_reference`.
pub fn replacement_spec(
    old: &ContainerDetails,
    image: &ImageDetails,
    image_reference: &str,
    env_filter: &EnvFilter,
    now: DateTime<Utc>,
) -> ContainerSpec {
    let env = env_filter.filter(&old.name, &old.env, &image.env);

    let mut labels = old.labels.clone();
    labels.insert(LAST_UPDATED_LABEL.to_string(), now.to_rfc3339());

    ContainerSpec {
        name: old.name.clone(),
        image: image_reference.to_string(),
        env,
        labels,
        cmd: old.cmd.clone(),
        entrypoint: old.entrypoint.clone(),
        working_dir: old.working_dir.clone(),
        user: old.user.clone(),
        hostname: old.hostname.clone(),
        exposed_ports: old.exposed_ports.clone(),
        volumes: old.volumes.clone(),
        healthcheck: old.healthcheck.clone(),
        host_config: old.host_config.clone(),
        networks: old.networks.clone(),
    }
}
