//! Per-container update execution.
//!
//! Walks a plan step by step through an explicit state machine:
//! pre-hook, pull, stop-old, start-new, verify, post-hook, commit, with
//! failure transitions into rollback. The old container survives under a
//! timestamped backup name until the prune policy removes it; a failed step
//! restores it under its original name and restart policy. Dry-run simulates
//! every daemon mutation while still invoking hooks.

use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::VerificationConfig;
use crate::docker::spec::replacement_spec;
use crate::docker::{ContainerDetails, ContainerDriver, RestartPolicySetting};
use crate::env_filter::EnvFilter;
use crate::errors::DriverError;
use crate::hooks::{HookKind, HookOutcome, HookRunner};
use crate::plan::{Step, UpdatePlan};
use crate::registry::CredentialStore;
use crate::report::{FinalState, StepReport, StepResult, UpdateOutcome};
use crate::verify::verify_stable;
use crate::CancelFlag;

/// Name infix marking containers kept as update backups.
pub const BACKUP_INFIX: &str = "_bak_cu_";

const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const ROLLBACK_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Backup container name: `<original>_bak_cu_<YYYYMMDD_HHMMSS>`, local time.
pub fn backup_name(original: &str, now: chrono::DateTime<Local>) -> String {
    format!("{original}{BACKUP_INFIX}{}", now.format("%Y%m%d_%H%M%S"))
}

/// States of the per-step machine. Dry-run and cancellation decisions sit on
/// the transitions between these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
enum ExecState {
    Init,
    Pre,
    Pull,
    StopOld,
    StartNew,
    Verify,
    Post,
    Commit,
    Rollback,
}

/// How one step left the machine.
enum StepDisposition {
    Committed,
    /// Aborted before any daemon mutation; prior commits stand.
    SkippedNoChanges(String),
    AbortedNoChanges(String),
    RolledBack(String),
    /// Rollback itself failed; the container is left under its backup name.
    Inconsistent(String),
}

/// Drives the state machine for one container at a time.
pub struct UpdateExecutor<'a> {
    pub driver: &'a dyn ContainerDriver,
    pub hooks: &'a HookRunner,
    pub env_filter: &'a EnvFilter,
    pub credentials: &'a CredentialStore,
    pub verification: VerificationConfig,
    pub delay_between_updates: Duration,
    pub dry_run: bool,
    pub cancel: CancelFlag,
}

struct StepScratch {
    backup_name: String,
    renamed: bool,
    new_id: Option<String>,
    pull_reference: String,
    hooks: Vec<HookOutcome>,
    warnings: Vec<String>,
    rollback_reason: String,
}

impl<'a> UpdateExecutor<'a> {
    /// Execute the whole plan for one container.
    pub async fn execute(&self, container: &ContainerDetails, plan: &UpdatePlan) -> UpdateOutcome {
        let started = Instant::now();
        let total = plan.steps.len();
        let mut current = container.clone();
        let mut steps: Vec<StepReport> = Vec::with_capacity(total);
        let mut applied = 0usize;
        let mut final_state = FinalState::Updated;
        let mut reason: Option<String> = None;

        for (index, step) in plan.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                reason = Some("run cancelled before remaining steps".to_string());
                if applied == 0 {
                    final_state = FinalState::Aborted;
                }
                break;
            }

            let action = if self.dry_run { "Would apply" } else { "Applying" };
            info!(
                container = %plan.container_name,
                step = index + 1,
                of = total,
                target = %step.target.tag,
                kind = %step.diff_kind,
                "{action} update step"
            );

            let (report, disposition) = self.run_step(&current, plan, step).await;
            steps.push(report);

            match disposition {
                StepDisposition::Committed => {
                    applied += 1;
                    if !self.dry_run {
                        match self.driver.inspect(&plan.container_name).await {
                            Ok(refreshed) => current = refreshed,
                            Err(e) => {
                                warn!(error = %e, "could not refresh container after commit");
                                reason = Some(format!("refresh after commit failed: {e}"));
                                break;
                            }
                        }
                    }
                    let remaining = index + 1 < total;
                    if remaining && !self.delay_between_updates.is_zero() {
                        info!(
                            delay_s = self.delay_between_updates.as_secs(),
                            "waiting before the next step of the progressive plan"
                        );
                        if !self.dry_run {
                            tokio::time::sleep(self.delay_between_updates).await;
                        }
                    }
                }
                StepDisposition::SkippedNoChanges(why) => {
                    if applied == 0 {
                        final_state = FinalState::Skipped;
                    }
                    reason = Some(why);
                    break;
                }
                StepDisposition::AbortedNoChanges(why) => {
                    if applied == 0 {
                        final_state = FinalState::Aborted;
                    }
                    reason = Some(why);
                    break;
                }
                StepDisposition::RolledBack(why) => {
                    final_state = FinalState::RolledBack;
                    reason = Some(why);
                    break;
                }
                StepDisposition::Inconsistent(why) => {
                    final_state = FinalState::AbortedInconsistent;
                    reason = Some(why);
                    error!(
                        container = %plan.container_name,
                        "rollback failed; container left under its backup name, manual intervention required"
                    );
                    break;
                }
            }
        }

        UpdateOutcome {
            container: plan.container_name.clone(),
            image: plan.image.pull_base(),
            rule: plan.rule_name.clone(),
            final_state,
            reason,
            plan_size: total,
            steps_applied: applied,
            steps,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_step(
        &self,
        current: &ContainerDetails,
        plan: &UpdatePlan,
        step: &Step,
    ) -> (StepReport, StepDisposition) {
        let started = Instant::now();
        let mut scratch = StepScratch {
            backup_name: backup_name(&plan.container_name, Local::now()),
            renamed: false,
            new_id: None,
            pull_reference: plan
                .image
                .pull_reference(&step.target.tag, step.target.digest.as_deref()),
            hooks: Vec::new(),
            warnings: Vec::new(),
            rollback_reason: String::new(),
        };

        let mut state = ExecState::Init;
        let disposition = loop {
            state = match state {
                ExecState::Init => {
                    debug!(
                        container = %plan.container_name,
                        target = %scratch.pull_reference,
                        backup = %scratch.backup_name,
                        "step initialized"
                    );
                    ExecState::Pre
                }

                ExecState::Pre => {
                    let outcome = self.hooks.run(HookKind::Pre, &plan.container_name).await;
                    let failed = outcome.invoked && !outcome.success;
                    let exit = outcome.exit_code;
                    scratch.hooks.push(outcome);
                    if failed {
                        if self.dry_run {
                            scratch
                                .warnings
                                .push("pre-hook failed during dry-run (ignored)".to_string());
                            ExecState::Pull
                        } else if self.hooks.continue_on_pre_failure() {
                            scratch
                                .warnings
                                .push(format!("HookFailed(pre): exit {exit:?}, continuing"));
                            ExecState::Pull
                        } else {
                            break StepDisposition::SkippedNoChanges(format!(
                                "HookFailed(pre): exit {exit:?}"
                            ));
                        }
                    } else {
                        ExecState::Pull
                    }
                }

                ExecState::Pull => {
                    // Authoritative minimum-age re-check: the tag may have
                    // moved between planning and pulling.
                    if let Some(pushed_at) = step.target.pushed_at {
                        let age = (chrono::Utc::now() - pushed_at)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        let min_age = Duration::from_secs(plan.min_image_age_secs);
                        if age < min_age {
                            break StepDisposition::SkippedNoChanges(format!(
                                "ImageTooYoung: {}s old, {}s required",
                                age.as_secs(),
                                min_age.as_secs()
                            ));
                        }
                    }

                    if self.dry_run {
                        info!(reference = %scratch.pull_reference, "would pull image");
                        ExecState::StopOld
                    } else {
                        let creds = self
                            .credentials
                            .lookup(&plan.image.registry, &plan.image.repository);
                        match self.driver.pull_image(&scratch.pull_reference, creds).await {
                            Ok(()) => ExecState::StopOld,
                            Err(e) => {
                                break StepDisposition::AbortedNoChanges(format!(
                                    "ImagePullFailed: {e}"
                                ));
                            }
                        }
                    }
                }

                ExecState::StopOld => {
                    if self.dry_run {
                        info!(
                            container = %plan.container_name,
                            backup = %scratch.backup_name,
                            "would rename and stop the running container"
                        );
                        ExecState::StartNew
                    } else {
                        match self.driver.rename(&current.id, &scratch.backup_name).await {
                            Ok(()) => {
                                scratch.renamed = true;
                            }
                            Err(e) => {
                                break StepDisposition::AbortedNoChanges(format!(
                                    "rename to backup failed: {e}"
                                ));
                            }
                        }
                        if let Err(e) = self
                            .driver
                            .set_restart_policy(&current.id, &RestartPolicySetting::none())
                            .await
                        {
                            scratch.rollback_reason = format!("restart policy override failed: {e}");
                            ExecState::Rollback
                        } else if let Err(e) = self.driver.stop(&current.id, STOP_TIMEOUT).await {
                            scratch.rollback_reason = format!("stop of old container failed: {e}");
                            ExecState::Rollback
                        } else {
                            ExecState::StartNew
                        }
                    }
                }

                ExecState::StartNew => {
                    if self.dry_run {
                        info!(
                            container = %plan.container_name,
                            image = %scratch.pull_reference,
                            "would create and start the replacement container"
                        );
                        ExecState::Verify
                    } else {
                        // The image env is required for the preserved vs
                        // inherited partition; proceeding without it would
                        // pin every old variable.
                        match self.driver.inspect_image(&scratch.pull_reference).await {
                            Ok(image_details) => {
                                let spec = replacement_spec(
                                    current,
                                    &image_details,
                                    &scratch.pull_reference,
                                    self.env_filter,
                                    chrono::Utc::now(),
                                );
                                match self.driver.create_container(&spec).await {
                                    Ok(id) => {
                                        scratch.new_id = Some(id.clone());
                                        match self.driver.start(&id).await {
                                            Ok(()) => ExecState::Verify,
                                            Err(e) => {
                                                scratch.rollback_reason =
                                                    format!("StartFailed: {e}");
                                                ExecState::Rollback
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        scratch.rollback_reason =
                                            format!("StartFailed: create: {e}");
                                        ExecState::Rollback
                                    }
                                }
                            }
                            Err(e) => {
                                scratch.rollback_reason = format!(
                                    "StartFailed: inspect of pulled image: {e}"
                                );
                                ExecState::Rollback
                            }
                        }
                    }
                }

                ExecState::Verify => {
                    match verify_stable(
                        self.driver,
                        &plan.container_name,
                        &self.verification,
                        self.dry_run,
                    )
                    .await
                    {
                        Ok(()) => ExecState::Post,
                        Err(e) => {
                            scratch.rollback_reason = e.to_string();
                            ExecState::Rollback
                        }
                    }
                }

                ExecState::Post => {
                    let outcome = self.hooks.run(HookKind::Post, &plan.container_name).await;
                    let failed = outcome.invoked && !outcome.success;
                    let exit = outcome.exit_code;
                    scratch.hooks.push(outcome);
                    if failed {
                        if self.dry_run {
                            scratch
                                .warnings
                                .push("post-hook failed during dry-run (ignored)".to_string());
                            ExecState::Commit
                        } else if self.hooks.rollback_on_post_failure() {
                            scratch.rollback_reason = format!("HookFailed(post): exit {exit:?}");
                            ExecState::Rollback
                        } else {
                            scratch
                                .warnings
                                .push(format!("HookFailed(post): exit {exit:?}, committed anyway"));
                            ExecState::Commit
                        }
                    } else {
                        ExecState::Commit
                    }
                }

                ExecState::Commit => {
                    info!(
                        container = %plan.container_name,
                        target = %step.target.tag,
                        "{}",
                        if self.dry_run {
                            "would have replaced container"
                        } else {
                            "container replaced"
                        }
                    );
                    break StepDisposition::Committed;
                }

                ExecState::Rollback => {
                    let why = scratch.rollback_reason.clone();
                    match self.rollback(current, &scratch).await {
                        Ok(()) => break StepDisposition::RolledBack(why),
                        Err(e) => {
                            break StepDisposition::Inconsistent(format!(
                                "RollbackFailed after '{why}': {e}"
                            ));
                        }
                    }
                }
            };
        };

        let result = match &disposition {
            StepDisposition::Committed => StepResult::Committed,
            StepDisposition::SkippedNoChanges(_) => StepResult::Skipped,
            StepDisposition::AbortedNoChanges(_) => StepResult::Aborted,
            StepDisposition::RolledBack(_) => StepResult::RolledBack,
            StepDisposition::Inconsistent(_) => StepResult::Inconsistent,
        };
        let error = match &disposition {
            StepDisposition::Committed => None,
            StepDisposition::SkippedNoChanges(why)
            | StepDisposition::AbortedNoChanges(why)
            | StepDisposition::RolledBack(why)
            | StepDisposition::Inconsistent(why) => Some(why.clone()),
        };

        (
            StepReport {
                target_tag: step.target.tag.clone(),
                diff_kind: step.diff_kind,
                result,
                error,
                warnings: scratch.warnings.clone(),
                hooks: scratch.hooks.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
            disposition,
        )
    }

    /// Undo a failed step: remove the replacement, restore the backup under
    /// its original name and restart policy, start it, and re-verify
    /// best-effort. Hook scripts are not re-run here.
    async fn rollback(
        &self,
        original: &ContainerDetails,
        scratch: &StepScratch,
    ) -> Result<(), DriverError> {
        info!(container = %original.name, "rolling back");

        if let Some(new_id) = &scratch.new_id {
            if let Err(e) = self.driver.stop(new_id, ROLLBACK_STOP_TIMEOUT).await {
                debug!(error = %e, "stopping replacement during rollback");
            }
            match self.driver.remove(new_id, true).await {
                Ok(()) | Err(DriverError::ContainerNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if scratch.renamed {
            self.driver.rename(&original.id, &original.name).await?;
            self.driver
                .set_restart_policy(&original.id, &original.restart_policy)
                .await?;
        }

        let running = self
            .driver
            .observe(&original.id)
            .await
            .map(|state| state.status == crate::docker::ContainerStatus::Running)
            .unwrap_or(false);
        if !running {
            self.driver.start(&original.id).await?;
        }

        if let Err(e) = verify_stable(self.driver, &original.id, &self.verification, false).await {
            warn!(
                container = %original.name,
                error = %e,
                "restored container did not re-verify cleanly"
            );
        }

        info!(container = %original.name, "rollback successful");
        Ok(())
    }
}
