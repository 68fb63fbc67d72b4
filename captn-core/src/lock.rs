//! Single-instance run lock.
//!
//! A PID-based lock file guards against two updater processes mutating the
//! same host concurrently. A lock left behind by a dead process is treated
//! as stale and reclaimed; `force` reclaims unconditionally.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::EnvironmentError;

/// Held for the duration of one run; releasing is automatic on drop.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock at `path`. Fails with [`EnvironmentError::LockHeld`]
    /// when a live process holds it, unless `force` is set.
    pub fn acquire(path: &Path, force: bool) -> Result<RunLock, EnvironmentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EnvironmentError::HostAccessDenied(format!(
                    "cannot create lock directory: {e}"
                ))
            })?;
        }

        if path.exists() {
            let holder = read_pid(path);
            match holder {
                Some(pid) if is_process_running(pid) => {
                    if force {
                        warn!(pid, "forcibly taking over lock held by running process");
                    } else {
                        return Err(EnvironmentError::LockHeld { pid });
                    }
                }
                Some(pid) => {
                    debug!(pid, "removing stale lock from dead process");
                }
                None => {
                    debug!("removing unreadable lock file");
                }
            }
            let _ = fs::remove_file(path);
        }

        let mut file = File::create(path).map_err(|e| {
            EnvironmentError::HostAccessDenied(format!("cannot create lock file: {e}"))
        })?;
        write!(file, "{}", std::process::id()).map_err(|e| {
            EnvironmentError::HostAccessDenied(format!("cannot write lock file: {e}"))
        })?;

        Ok(RunLock {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}
