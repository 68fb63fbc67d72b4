//! Structured per-run reporting.
//!
//! The run report is the value handed to the notification sink; it contains
//! every container considered, each with its final state and reason, plus
//! per-step timings, trimmed hook output and registry statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::hooks::HookOutcome;
use crate::registry::RegistryStats;
use crate::version::DiffKind;

/// Maximum hook output carried per step; the rest is trimmed.
const HOOK_OUTPUT_LIMIT: usize = 4000;

/// Terminal state of one container's update processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalState {
    Updated,
    Noop,
    Skipped,
    RolledBack,
    Aborted,
    AbortedInconsistent,
}

/// How a single step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepResult {
    Committed,
    Skipped,
    Aborted,
    RolledBack,
    Inconsistent,
}

/// Record of one executed (or simulated) step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub target_tag: String,
    pub diff_kind: DiffKind,
    pub result: StepResult,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub hooks: Vec<HookOutcome>,
    pub duration_ms: u64,
}

/// Outcome for one container.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub container: String,
    pub image: String,
    pub rule: String,
    pub final_state: FinalState,
    pub reason: Option<String>,
    pub plan_size: usize,
    pub steps_applied: usize,
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
}

impl UpdateOutcome {
    /// Outcome for a container that never reached execution.
    pub fn skipped(container: &str, image: &str, rule: &str, reason: String) -> UpdateOutcome {
        UpdateOutcome {
            container: container.to_string(),
            image: image.to_string(),
            rule: rule.to_string(),
            final_state: FinalState::Skipped,
            reason: Some(reason),
            plan_size: 0,
            steps_applied: 0,
            steps: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Outcome for a container with nothing to do.
    pub fn noop(container: &str, image: &str, rule: &str, reason: String) -> UpdateOutcome {
        UpdateOutcome {
            reason: Some(reason),
            final_state: FinalState::Noop,
            ..UpdateOutcome::skipped(container, image, rule, String::new())
        }
    }
}

/// Summary of the post-run prune pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneSummary {
    pub backup_containers_removed: usize,
    pub images_removed: usize,
    pub errors: Vec<String>,
}

/// The complete run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub outcomes: Vec<UpdateOutcome>,
    pub prune: Option<PruneSummary>,
    pub registry_stats: RegistryStats,
}

impl RunReport {
    pub fn updated_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.final_state == FinalState::Updated)
            .count()
    }

    pub fn has_inconsistent_containers(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.final_state == FinalState::AbortedInconsistent)
    }
}

/// Collects outcomes while a run progresses.
pub struct ReportBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    cancelled: bool,
    outcomes: Vec<UpdateOutcome>,
    prune: Option<PruneSummary>,
}

impl ReportBuilder {
    pub fn new(dry_run: bool) -> ReportBuilder {
        ReportBuilder {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            cancelled: false,
            outcomes: Vec::new(),
            prune: None,
        }
    }

    pub fn add_outcome(&mut self, mut outcome: UpdateOutcome) {
        for step in &mut outcome.steps {
            for hook in &mut step.hooks {
                if hook.output.len() > HOOK_OUTPUT_LIMIT {
                    let mut cut = HOOK_OUTPUT_LIMIT;
                    while !hook.output.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    hook.output.truncate(cut);
                    hook.output.push_str("… [trimmed]");
                }
            }
        }
        self.outcomes.push(outcome);
    }

    pub fn set_prune(&mut self, prune: PruneSummary) {
        self.prune = Some(prune);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn finish(self, registry_stats: RegistryStats) -> RunReport {
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            cancelled: self.cancelled,
            outcomes: self.outcomes,
            prune: self.prune,
            registry_stats,
        }
    }
}
