//! Typed errors for every component boundary.
//!
//! Each error carries a machine-readable kind plus a human message. Failures
//! scoped to one image or container are converted into outcomes at the
//! executor or coordinator boundary; only configuration and environment
//! failures abort a run.

use thiserror::Error;

/// Configuration and input failures. Surfaced immediately, run aborted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration validation failed:\n{}", format_issues(.0))]
    Invalid(Vec<String>),

    #[error("rule '{name}' is invalid: {reason}")]
    RuleInvalid { name: String, reason: String },

    #[error("credentials file '{path}' is invalid: {reason}")]
    CredentialsInvalid { path: String, reason: String },

    #[error("failed to read configuration: {0}")]
    Read(String),
}

fn format_issues(issues: &[String]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Host environment failures. Run aborted.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("container daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("another updater instance holds the lock (pid {pid})")]
    LockHeld { pid: u32 },

    #[error("host access denied: {0}")]
    HostAccessDenied(String),
}

/// Registry failures. Per-image scope: the image's containers are reported
/// as skipped, the run continues.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registry authentication failed: {0}")]
    AuthFailed(String),

    #[error("registry rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("registry returned an empty tag list for '{0}'")]
    TagListEmpty(String),

    #[error("registry protocol error: {0}")]
    Protocol(String),
}

impl RegistryError {
    /// Whether a retry within the same run could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RegistryError::Unreachable(_) | RegistryError::RateLimited(_)
        )
    }

    /// Short machine-readable kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Unreachable(_) => "RegistryUnreachable",
            RegistryError::AuthFailed(_) => "AuthFailed",
            RegistryError::RateLimited(_) => "RateLimited",
            RegistryError::TagListEmpty(_) => "TagListEmpty",
            RegistryError::Protocol(_) => "ProtocolError",
        }
    }
}

/// Container daemon failures surfaced by the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container name conflict: {0}")]
    ConflictName(String),

    #[error("image pull failed for '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    #[error("daemon api error: {0}")]
    Api(String),
}

/// Failures inside a single container's update execution. Converted into an
/// `UpdateOutcome` at the executor boundary.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("new container failed to start: {0}")]
    StartFailed(String),

    #[error("container did not stabilize: {reason} (last state: {last_state})")]
    DidNotStabilize { reason: String, last_state: String },

    #[error("{kind}-hook failed with exit code {exit_code:?}")]
    HookFailed {
        kind: &'static str,
        exit_code: Option<i32>,
    },

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("run cancelled")]
    Cancelled,
}
