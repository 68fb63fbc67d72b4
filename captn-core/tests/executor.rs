//! End-to-end executor tests against the scripted driver: commit paths,
//! rollback atomicity, hook failure policies and dry-run behavior.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use captn_core::config::{Config, VerificationConfig};
use captn_core::env_filter::EnvFilter;
use captn_core::executor::UpdateExecutor;
use captn_core::hooks::HookRunner;
use captn_core::plan::{Step, UpdatePlan};
use captn_core::registry::{Candidate, CredentialStore, ImageRef};
use captn_core::report::{FinalState, StepResult};
use captn_core::testing::{container_details, exited_state, running_state, MockAction, MockDriver};
use captn_core::version::{DiffKind, Version};
use captn_core::CancelFlag;

fn fast_verification() -> VerificationConfig {
    VerificationConfig {
        max_wait: Duration::from_millis(400),
        stable_time: Duration::from_millis(30),
        check_interval: Duration::from_millis(10),
        grace_period: Duration::from_millis(30),
    }
}

fn candidate(tag: &str, digest: &str, hours_old: i64) -> Candidate {
    Candidate {
        tag: tag.to_string(),
        version: Version::parse(tag),
        digest: Some(digest.to_string()),
        pushed_at: Some(Utc::now() - chrono::Duration::hours(hours_old)),
    }
}

fn single_step_plan(image: &str, current: &str, target: Candidate, kind: DiffKind) -> UpdatePlan {
    UpdatePlan {
        container_name: "web".to_string(),
        image: ImageRef::parse(&format!("{image}:{current}")).unwrap(),
        current_tag: current.to_string(),
        rule_name: "patch_only".to_string(),
        progressive: true,
        min_image_age_secs: 3 * 3600,
        steps: vec![Step {
            target,
            diff_kind: kind,
        }],
    }
}

struct Harness {
    driver: Arc<MockDriver>,
    config: Config,
    env_filter: EnvFilter,
    credentials: CredentialStore,
    cancel: CancelFlag,
}

impl Harness {
    fn new() -> Harness {
        let driver = Arc::new(MockDriver::new());
        driver.add_container(container_details("web", "web:2.3.0", "sha256:old"));
        Harness {
            driver,
            config: Config::default(),
            env_filter: EnvFilter::default(),
            credentials: CredentialStore::default(),
            cancel: CancelFlag::default(),
        }
    }

    fn executor<'a>(&'a self, hooks: &'a HookRunner, dry_run: bool) -> UpdateExecutor<'a> {
        UpdateExecutor {
            driver: self.driver.as_ref(),
            hooks,
            env_filter: &self.env_filter,
            credentials: &self.credentials,
            verification: fast_verification(),
            delay_between_updates: Duration::ZERO,
            dry_run,
            cancel: self.cancel.clone(),
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_successful_update_commits_and_keeps_backup() {
    let harness = Harness::new();
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::Updated);
    assert_eq!(outcome.steps_applied, 1);
    assert_eq!(outcome.steps[0].result, StepResult::Committed);

    // The replacement runs under the original name with the pinned image.
    let replacement = harness.driver.container("web").unwrap();
    assert_eq!(replacement.image_ref, "web@sha256:new");

    // The old container survives, exited, under a backup name.
    let names = harness.driver.container_names();
    let backup = names.iter().find(|n| n.starts_with("web_bak_cu_")).unwrap();
    let backup_details = harness.driver.container(backup).unwrap();
    assert_eq!(
        backup_details.state.status,
        captn_core::docker::ContainerStatus::Exited
    );
    // Its restart policy was overridden so it stays down.
    assert_eq!(backup_details.restart_policy.name, "no");
}

// =============================================================================
// Rollback (scenario: verification failure)
// =============================================================================

#[tokio::test]
async fn test_verification_failure_rolls_back() {
    let harness = Harness::new();
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    // After START_NEW the replacement oscillates between running and exited,
    // never accumulating a stable window.
    let mut states = Vec::new();
    for _ in 0..60 {
        states.push(running_state());
        states.push(exited_state());
    }
    harness.driver.script_observations("web", states);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::RolledBack);
    assert_eq!(outcome.steps_applied, 0);
    assert!(outcome.reason.as_deref().unwrap().contains("stabilize"));

    // The original container is back under its original name, running its
    // original image, with its restart policy restored.
    let restored = harness.driver.container("web").unwrap();
    assert_eq!(restored.image_ref, "web:2.3.0");
    assert_eq!(restored.restart_policy.name, "unless-stopped");
    assert_eq!(
        restored.state.status,
        captn_core::docker::ContainerStatus::Running
    );

    // Rollback atomicity: no half-configured replacement, no leftover
    // backup.
    let names = harness.driver.container_names();
    assert_eq!(names, vec!["web".to_string()]);
}

#[tokio::test]
async fn test_start_failure_rolls_back() {
    let harness = Harness::new();
    harness.driver.fail_on("create", "scripted create failure");
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::RolledBack);
    let restored = harness.driver.container("web").unwrap();
    assert_eq!(restored.image_ref, "web:2.3.0");
    assert_eq!(
        restored.state.status,
        captn_core::docker::ContainerStatus::Running
    );
}

#[tokio::test]
async fn test_image_inspect_failure_after_pull_rolls_back() {
    let harness = Harness::new();
    // The pull succeeds but inspecting the pulled image does not, so the
    // env partition cannot be computed and the step rolls back.
    harness
        .driver
        .fail_on("inspect_image:web@sha256:new", "daemon glitch");
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::RolledBack);
    assert!(outcome
        .reason
        .as_deref()
        .unwrap()
        .contains("inspect of pulled image"));
    let restored = harness.driver.container("web").unwrap();
    assert_eq!(restored.image_ref, "web:2.3.0");
    assert_eq!(restored.restart_policy.name, "unless-stopped");
    assert_eq!(
        restored.state.status,
        captn_core::docker::ContainerStatus::Running
    );
}

#[tokio::test]
async fn test_failed_rollback_is_reported_inconsistent() {
    let harness = Harness::new();
    // Verification will fail, and restarting the original during rollback
    // fails too.
    harness.driver.fail_on("start:id-web", "daemon glitch");
    let mut states = Vec::new();
    for _ in 0..60 {
        states.push(running_state());
        states.push(exited_state());
    }
    harness.driver.script_observations("web", states);

    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::AbortedInconsistent);
    assert!(outcome
        .reason
        .as_deref()
        .unwrap()
        .contains("RollbackFailed"));
}

// =============================================================================
// Hook failure policies
// =============================================================================

#[tokio::test]
async fn test_pre_hook_failure_aborts_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "pre.sh", "exit 3");

    let mut harness = Harness::new();
    harness.config.pre_scripts.enabled = true;
    harness.config.pre_scripts.scripts_directory = dir.path().to_path_buf();
    harness.config.pre_scripts.continue_on_failure = false;
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::Skipped);
    assert!(outcome.reason.as_deref().unwrap().contains("HookFailed(pre)"));
    // No daemon mutation happened.
    assert!(harness.driver.actions().is_empty());
}

#[tokio::test]
async fn test_post_hook_failure_without_rollback_commits_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "post.sh", "exit 17");

    let mut harness = Harness::new();
    harness.config.post_scripts.enabled = true;
    harness.config.post_scripts.scripts_directory = dir.path().to_path_buf();
    harness.config.post_scripts.rollback_on_failure = false;
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::Updated);
    assert_eq!(outcome.steps_applied, 1);
    let step = &outcome.steps[0];
    assert!(step
        .warnings
        .iter()
        .any(|w| w.contains("HookFailed(post)")));
    let post = step.hooks.iter().find(|h| h.kind == "post").unwrap();
    assert_eq!(post.exit_code, Some(17));

    // The prior container remains as a backup.
    let names = harness.driver.container_names();
    assert!(names.iter().any(|n| n.starts_with("web_bak_cu_")));
    assert_eq!(harness.driver.container("web").unwrap().image_ref, "web@sha256:new");
}

#[tokio::test]
async fn test_post_hook_failure_with_rollback_enabled_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "post.sh", "exit 1");

    let mut harness = Harness::new();
    harness.config.post_scripts.enabled = true;
    harness.config.post_scripts.scripts_directory = dir.path().to_path_buf();
    harness.config.post_scripts.rollback_on_failure = true;
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::RolledBack);
    assert_eq!(harness.driver.container("web").unwrap().image_ref, "web:2.3.0");
}

// =============================================================================
// Dry run
// =============================================================================

#[tokio::test]
async fn test_dry_run_never_mutates_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    // Hooks run in dry-run mode with CAPTN_DRY_RUN=true and their failures
    // never cause rollback, because nothing has been changed.
    write_script(dir.path(), "pre.sh", "test \"$CAPTN_DRY_RUN\" = true || exit 9\nexit 1");
    write_script(dir.path(), "post.sh", "exit 1");

    let mut harness = Harness::new();
    harness.config.pre_scripts.enabled = true;
    harness.config.pre_scripts.scripts_directory = dir.path().to_path_buf();
    harness.config.post_scripts.enabled = true;
    harness.config.post_scripts.scripts_directory = dir.path().to_path_buf();
    let hooks = HookRunner::new(&harness.config, true);
    let executor = harness.executor(&hooks, true);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::Updated);
    assert!(harness.driver.actions().is_empty());
    // Both hooks were genuinely invoked.
    let step = &outcome.steps[0];
    assert_eq!(step.hooks.len(), 2);
    assert!(step.hooks.iter().all(|h| h.invoked));
    // The pre hook exited 1 because CAPTN_DRY_RUN was true, not 9.
    assert_eq!(step.hooks[0].exit_code, Some(1));
}

// =============================================================================
// Progressive plans and guards
// =============================================================================

#[tokio::test]
async fn test_progressive_failure_preserves_earlier_commits() {
    let harness = Harness::new();
    // Step two's image cannot be pulled.
    harness
        .driver
        .fail_on("pull:web@sha256:c2", "scripted pull failure");
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();

    let mut plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:c1", 48), DiffKind::Patch);
    plan.steps.push(Step {
        target: candidate("2.3.2", "sha256:c2", 48),
        diff_kind: DiffKind::Patch,
    });

    let outcome = executor.execute(&details, &plan).await;

    // The first step's commit stands; the second aborted before changes.
    assert_eq!(outcome.steps_applied, 1);
    assert_eq!(outcome.final_state, FinalState::Updated);
    assert!(outcome
        .reason
        .as_deref()
        .unwrap()
        .contains("ImagePullFailed"));
    assert_eq!(harness.driver.container("web").unwrap().image_ref, "web@sha256:c1");
}

#[tokio::test]
async fn test_min_age_recheck_at_pull_time() {
    let harness = Harness::new();
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();

    // Planned earlier, but the tag now appears pushed 10 minutes ago.
    let mut young = candidate("2.3.1", "sha256:new", 0);
    young.pushed_at = Some(Utc::now() - chrono::Duration::minutes(10));
    let plan = single_step_plan("web", "2.3.0", young, DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::Skipped);
    assert!(outcome.reason.as_deref().unwrap().contains("ImageTooYoung"));
    assert!(harness.driver.actions().is_empty());
}

#[tokio::test]
async fn test_cancellation_abandons_plan_before_first_step() {
    let harness = Harness::new();
    harness.cancel.cancel();
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    let outcome = executor.execute(&details, &plan).await;

    assert_eq!(outcome.final_state, FinalState::Aborted);
    assert!(outcome.reason.as_deref().unwrap().contains("cancelled"));
    assert!(harness.driver.actions().is_empty());
}

#[tokio::test]
async fn test_daemon_actions_follow_the_documented_order() {
    let harness = Harness::new();
    let hooks = HookRunner::new(&harness.config, false);
    let executor = harness.executor(&hooks, false);
    let details = harness.driver.container("web").unwrap();
    let plan = single_step_plan("web", "2.3.0", candidate("2.3.1", "sha256:new", 48), DiffKind::Patch);

    executor.execute(&details, &plan).await;

    let actions = harness.driver.actions();
    // pull, rename old to backup, override restart policy, stop old,
    // create new, start new.
    assert!(matches!(&actions[0], MockAction::Pull(r) if r == "web@sha256:new"));
    assert!(matches!(&actions[1], MockAction::Rename(from, to) if from == "web" && to.starts_with("web_bak_cu_")));
    assert!(matches!(&actions[2], MockAction::SetRestartPolicy(_, policy) if policy == "no"));
    assert!(matches!(&actions[3], MockAction::Stop(_)));
    assert!(matches!(&actions[4], MockAction::Create(name) if name == "web"));
    assert!(matches!(&actions[5], MockAction::Start(name) if name == "web"));
}
