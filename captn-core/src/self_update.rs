//! Self-update choreography.
//!
//! The updater cannot stop and replace its own container from inside it.
//! When the target of a step is the updater itself, the coordinator defers
//! the step to the end of the run and hands it to a short-lived helper
//! container running the new image, which performs a single forced, filtered
//! run against the original container and exits.

use std::collections::HashMap;

use bollard::models::HostConfig;
use tracing::{debug, info};

use crate::docker::{ContainerDriver, ContainerSpec};
use crate::errors::DriverError;

/// Role marker carried by the helper container.
pub const ROLE_ENV: &str = "CAPTN_ROLE";
pub const ROLE_HELPER: &str = "self-update-helper";
/// Name of the container the helper must update.
pub const TARGET_ENV: &str = "CAPTN_TARGET_CONTAINER";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// The target container name, when this process runs as a self-update
/// helper.
pub fn helper_target() -> Option<String> {
    if std::env::var(ROLE_ENV).ok()? == ROLE_HELPER {
        std::env::var(TARGET_ENV).ok()
    } else {
        None
    }
}

/// Whether the named container is the updater's own container. Only
/// meaningful inside a container; detection uses the container environment
/// marker plus hostname and cgroup identifiers.
pub fn is_self_container(container_name: &str, container_id: &str) -> bool {
    if !std::path::Path::new("/.dockerenv").exists() {
        return false;
    }

    let mut identifiers = Vec::new();
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        identifiers.push(hostname.trim_start_matches('/').to_string());
    }
    if let Ok(cgroup) = std::fs::read_to_string("/proc/self/cgroup") {
        identifiers.extend(cgroup_container_ids(&cgroup));
    }

    debug!(?identifiers, container_name, container_id, "self-container check");
    matches_identifiers(container_name, container_id, &identifiers)
}

/// Container ids appearing in a cgroup file.
fn cgroup_container_ids(cgroup: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in cgroup.lines() {
        if !line.contains("docker") && !line.contains("containerd") {
            continue;
        }
        for part in line.trim().split('/') {
            if let Some(id) = part
                .strip_prefix("docker-")
                .and_then(|rest| rest.strip_suffix(".scope"))
            {
                ids.push(id.to_string());
            } else if part.len() == 64 && part.chars().all(|c| c.is_ascii_hexdigit()) {
                ids.push(part.to_string());
            }
        }
    }
    ids
}

fn matches_identifiers(container_name: &str, container_id: &str, identifiers: &[String]) -> bool {
    for identifier in identifiers {
        if container_name == identifier || container_id == identifier {
            return true;
        }
        // Short ids: either side may be a prefix of the other.
        if !container_id.is_empty()
            && (container_id.starts_with(identifier.as_str())
                || identifier.starts_with(container_id))
        {
            return true;
        }
    }
    false
}

/// Create and start the helper container that will replace `container_name`
/// with `image_reference`. Returns the helper's id, or `None` in dry-run.
pub async fn spawn_helper(
    driver: &dyn ContainerDriver,
    container_name: &str,
    image_reference: &str,
    remove_helper: bool,
    dry_run: bool,
) -> Result<Option<String>, DriverError> {
    let helper_name = format!("{container_name}_self_update_helper");

    if dry_run {
        info!(helper = %helper_name, image = %image_reference, "would create self-update helper container");
        return Ok(None);
    }

    info!(helper = %helper_name, image = %image_reference, "creating self-update helper container");
    let spec = ContainerSpec {
        name: helper_name,
        image: image_reference.to_string(),
        env: vec![
            format!("{ROLE_ENV}={ROLE_HELPER}"),
            format!("{TARGET_ENV}={container_name}"),
        ],
        labels: HashMap::new(),
        cmd: Some(vec![
            "--run".to_string(),
            "--force".to_string(),
            "--filter".to_string(),
            format!("name={container_name}"),
        ]),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}")]),
            auto_remove: Some(remove_helper),
            ..Default::default()
        }),
        ..Default::default()
    };

    let id = driver.create_container(&spec).await?;
    driver.start(&id).await?;
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_container_ids() {
        let scope = "0::/system.slice/docker-0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef.scope";
        let ids = cgroup_container_ids(scope);
        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with("0123456789abcdef"));

        let plain = "12:memory:/docker/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(cgroup_container_ids(plain).len(), 1);

        assert!(cgroup_container_ids("0::/init.scope").is_empty());
    }

    #[test]
    fn test_matches_identifiers() {
        let identifiers = vec!["abcdef123456".to_string()];
        // Hostname is the truncated container id.
        assert!(matches_identifiers(
            "captn",
            "abcdef123456789000000000",
            &identifiers
        ));
        assert!(matches_identifiers("abcdef123456", "", &identifiers));
        assert!(!matches_identifiers("web", "fedcba654321", &identifiers));
    }

    #[tokio::test]
    async fn test_spawn_helper_dry_run_creates_nothing() {
        let driver = crate::testing::MockDriver::new();
        let id = spawn_helper(&driver, "captn", "captn:2.0", true, true)
            .await
            .unwrap();
        assert!(id.is_none());
        assert!(driver.actions().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_helper_creates_and_starts() {
        let driver = crate::testing::MockDriver::new();
        let id = spawn_helper(&driver, "captn", "captn:2.0", true, false)
            .await
            .unwrap();
        assert!(id.is_some());
        let helper = driver.container("captn_self_update_helper").unwrap();
        assert!(helper
            .env
            .contains(&format!("{TARGET_ENV}=captn")));
    }
}
