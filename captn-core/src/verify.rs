//! Startup verification of a replacement container.
//!
//! The container must be candidate-stable (running, and healthy when it
//! defines a healthcheck) continuously for `stable_time`, then survive an
//! additional `grace_period`. Bad observations reset the stability window
//! during the first phase and fail verification during the grace phase.
//! `max_wait` bounds the whole protocol.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::VerificationConfig;
use crate::docker::{ContainerDriver, ContainerStatus, HealthState, RuntimeState};
use crate::errors::ExecError;

fn candidate_stable(state: &RuntimeState) -> bool {
    state.status == ContainerStatus::Running
        && !matches!(
            state.health,
            Some(HealthState::Unhealthy) | Some(HealthState::Starting)
        )
}

/// Observe `name_or_id` until stable or failed.
pub async fn verify_stable(
    driver: &dyn ContainerDriver,
    name_or_id: &str,
    cfg: &VerificationConfig,
    dry_run: bool,
) -> Result<(), ExecError> {
    if dry_run {
        info!(container = name_or_id, "would verify container startup");
        return Ok(());
    }

    info!(container = name_or_id, "verifying container startup");
    let deadline = Instant::now() + cfg.max_wait;
    let mut stable_since: Option<Instant> = None;
    let mut baseline_restarts: Option<i64> = None;
    let mut last_state: Option<RuntimeState> = None;

    // Phase 1: reach a full stable window.
    loop {
        if Instant::now() >= deadline {
            return Err(ExecError::DidNotStabilize {
                reason: format!(
                    "no {}s stable window within {}s",
                    cfg.stable_time.as_secs(),
                    cfg.max_wait.as_secs()
                ),
                last_state: last_state
                    .as_ref()
                    .map(RuntimeState::describe)
                    .unwrap_or_else(|| "never observed".to_string()),
            });
        }

        let state = driver.observe(name_or_id).await?;
        let restarted = match baseline_restarts {
            Some(previous) => state.restart_count > previous,
            None => false,
        };
        baseline_restarts = Some(state.restart_count);

        if candidate_stable(&state) && !restarted {
            let since = stable_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= cfg.stable_time {
                debug!(container = name_or_id, "stable window reached");
                last_state = Some(state);
                break;
            }
        } else {
            // A restart under the configured policy resets the window, it is
            // never terminal here.
            debug!(
                container = name_or_id,
                state = %state.describe(),
                "stability window reset"
            );
            stable_since = None;
        }
        last_state = Some(state);

        tokio::time::sleep(cfg.check_interval).await;
    }

    // Phase 2: any regression during the grace period is a failure.
    let grace_end = Instant::now() + cfg.grace_period;
    while Instant::now() < grace_end {
        if Instant::now() >= deadline {
            return Err(ExecError::DidNotStabilize {
                reason: format!("max wait of {}s expired during grace period", cfg.max_wait.as_secs()),
                last_state: last_state
                    .as_ref()
                    .map(RuntimeState::describe)
                    .unwrap_or_default(),
            });
        }

        let state = driver.observe(name_or_id).await?;
        let restarted = baseline_restarts
            .map(|previous| state.restart_count > previous)
            .unwrap_or(false);
        if !candidate_stable(&state) || restarted {
            return Err(ExecError::DidNotStabilize {
                reason: "regressed during grace period".to_string(),
                last_state: state.describe(),
            });
        }
        last_state = Some(state);
        tokio::time::sleep(cfg.check_interval).await;
    }

    info!(container = name_or_id, "container verified stable");
    Ok(())
}
