//! Pre/post hook script execution.
//!
//! Scripts resolve container-specific first (`<name>_pre.sh`), then generic
//! (`pre.sh`); absence is not an error. Each script runs in its own process
//! group with a wall-clock timeout; on expiry the group gets SIGTERM, a
//! short grace, then SIGKILL. Scripts communicate only via exit code and
//! captured output.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::Config;

const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    Post,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Pre => "pre",
            HookKind::Post => "post",
        }
    }
}

/// Result of one hook invocation, kept for the report.
#[derive(Debug, Clone, Serialize)]
pub struct HookOutcome {
    pub kind: &'static str,
    /// False when no script exists or execution is disabled.
    pub invoked: bool,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl HookOutcome {
    fn skipped(kind: HookKind, note: &str) -> HookOutcome {
        HookOutcome {
            kind: kind.as_str(),
            invoked: false,
            success: true,
            exit_code: None,
            output: note.to_string(),
            timed_out: false,
            duration_ms: 0,
        }
    }
}

/// Resolves and executes hook scripts with the documented environment
/// contract.
pub struct HookRunner {
    pre_enabled: bool,
    pre_dir: PathBuf,
    pre_timeout: Duration,
    continue_on_pre_failure: bool,
    post_enabled: bool,
    post_dir: PathBuf,
    post_timeout: Duration,
    rollback_on_post_failure: bool,
    config_dir: PathBuf,
    log_level: String,
    dry_run: bool,
}

impl HookRunner {
    pub fn new(cfg: &Config, dry_run: bool) -> HookRunner {
        HookRunner {
            pre_enabled: cfg.pre_scripts.enabled,
            pre_dir: cfg.pre_scripts.scripts_directory.clone(),
            pre_timeout: cfg.pre_scripts.timeout,
            continue_on_pre_failure: cfg.pre_scripts.continue_on_failure,
            post_enabled: cfg.post_scripts.enabled,
            post_dir: cfg.post_scripts.scripts_directory.clone(),
            post_timeout: cfg.post_scripts.timeout,
            rollback_on_post_failure: cfg.post_scripts.rollback_on_failure,
            config_dir: cfg.config_dir.clone(),
            log_level: cfg.logging.level.clone(),
            dry_run,
        }
    }

    pub fn continue_on_pre_failure(&self) -> bool {
        self.continue_on_pre_failure
    }

    pub fn rollback_on_post_failure(&self) -> bool {
        self.rollback_on_post_failure
    }

    fn settings(&self, kind: HookKind) -> (bool, &Path, Duration) {
        match kind {
            HookKind::Pre => (self.pre_enabled, &self.pre_dir, self.pre_timeout),
            HookKind::Post => (self.post_enabled, &self.post_dir, self.post_timeout),
        }
    }

    /// Container-specific script first, generic fallback second.
    fn resolve_script(&self, kind: HookKind, container_name: &str) -> Option<PathBuf> {
        let (_, dir, _) = self.settings(kind);
        let specific = dir.join(format!("{container_name}_{}.sh", kind.as_str()));
        if specific.exists() {
            return Some(specific);
        }
        let generic = dir.join(format!("{}.sh", kind.as_str()));
        if generic.exists() {
            return Some(generic);
        }
        None
    }

    /// Run the hook for a container. Hooks execute in dry-run too, with
    /// `CAPTN_DRY_RUN=true`, so they can guard their own side effects.
    pub async fn run(&self, kind: HookKind, container_name: &str) -> HookOutcome {
        let (enabled, dir, timeout) = self.settings(kind);
        if !enabled {
            debug!(kind = kind.as_str(), "hook execution disabled");
            return HookOutcome::skipped(kind, "script execution disabled");
        }

        let script = match self.resolve_script(kind, container_name) {
            Some(path) => path,
            None => {
                debug!(
                    kind = kind.as_str(),
                    container = container_name,
                    "no hook script found"
                );
                return HookOutcome::skipped(kind, "no script found");
            }
        };

        info!(
            kind = kind.as_str(),
            container = container_name,
            script = %script.display(),
            timeout_s = timeout.as_secs(),
            "executing hook script"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755));
        }

        let mut command = Command::new(&script);
        command
            .current_dir(dir)
            .env("CAPTN_CONTAINER_NAME", container_name)
            .env("CAPTN_SCRIPT_TYPE", kind.as_str())
            .env("CAPTN_DRY_RUN", if self.dry_run { "true" } else { "false" })
            .env("CAPTN_LOG_LEVEL", &self.log_level)
            .env("CAPTN_CONFIG_DIR", &self.config_dir)
            .env("CAPTN_SCRIPTS_DIR", dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(script = %script.display(), error = %e, "failed to spawn hook script");
                return HookOutcome {
                    kind: kind.as_str(),
                    invoked: true,
                    success: false,
                    exit_code: None,
                    output: format!("failed to spawn: {e}"),
                    timed_out: false,
                    duration_ms: 0,
                };
            }
        };
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                let exit_code = output.status.code();
                let success = output.status.success();
                if success {
                    info!(kind = kind.as_str(), "hook script completed");
                } else {
                    error!(
                        kind = kind.as_str(),
                        exit_code = ?exit_code,
                        "hook script failed"
                    );
                }
                HookOutcome {
                    kind: kind.as_str(),
                    invoked: true,
                    success,
                    exit_code,
                    output: text,
                    timed_out: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Ok(Err(e)) => HookOutcome {
                kind: kind.as_str(),
                invoked: true,
                success: false,
                exit_code: None,
                output: format!("wait failed: {e}"),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(_) => {
                warn!(
                    kind = kind.as_str(),
                    timeout_s = timeout.as_secs(),
                    "hook script timed out, terminating process group"
                );
                if let Some(pid) = pid {
                    terminate_process_group(pid).await;
                }
                HookOutcome {
                    kind: kind.as_str(),
                    invoked: true,
                    success: false,
                    exit_code: None,
                    output: format!("terminated after {}s timeout", timeout.as_secs()),
                    timed_out: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }
}

/// SIGTERM the group, wait a short grace, then SIGKILL.
#[cfg(unix)]
async fn terminate_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(pid as i32);
    let _ = killpg(group, Signal::SIGTERM);
    tokio::time::sleep(KILL_GRACE).await;
    let _ = killpg(group, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate_process_group(_pid: u32) {}
