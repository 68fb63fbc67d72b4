//! Run coordination: discovery, rule resolution, grouped registry fetches,
//! sequential execution, prune and report assembly.
//!
//! Container mutations are strictly sequential; registry discovery for
//! distinct image references runs concurrently under a small semaphore.
//! Cancellation (SIGTERM or the global run timeout) is observed between
//! steps and containers; the step in flight always completes through commit
//! or rollback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use glob::Pattern;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::docker::{ContainerDriver, ContainerSummary};
use crate::env_filter::EnvFilter;
use crate::errors::{ConfigError, DriverError, EnvironmentError, RegistryError};
use crate::executor::UpdateExecutor;
use crate::hooks::HookRunner;
use crate::lock::RunLock;
use crate::pattern::TagPattern;
use crate::plan::{plan_update, SkipReason};
use crate::registry::{Candidate, CredentialStore, ImageRef, RegistryClient};
use crate::report::{ReportBuilder, RunReport, UpdateOutcome};
use crate::rules::RuleSet;
use crate::{self_update, CancelFlag, RULE_LABEL};

/// Concurrent registry fetches per run.
const REGISTRY_CONCURRENCY: usize = 4;

/// Cross-cutting failures that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Daemon(#[from] DriverError),
}

/// Per-invocation options from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub force_lock: bool,
    /// Name globs, OR-semantics; exact match when a filter has no wildcard.
    pub name_filters: Vec<String>,
    pub lock_path: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            dry_run: true,
            force_lock: false,
            name_filters: Vec::new(),
            lock_path: PathBuf::from("/tmp/captn.lock"),
        }
    }
}

struct Target {
    summary: ContainerSummary,
    image: ImageRef,
    rule_name: String,
}

/// One deferred self-update, applied at the very end of the run.
struct DeferredSelfUpdate {
    container_name: String,
    image_reference: String,
}

/// Drives one complete run.
pub struct Coordinator {
    cfg: Config,
    rules: RuleSet,
    credentials: CredentialStore,
    registry: RegistryClient,
    driver: Arc<dyn ContainerDriver>,
    cancel: CancelFlag,
}

impl Coordinator {
    pub fn new(cfg: Config, driver: Arc<dyn ContainerDriver>) -> Result<Coordinator, ConfigError> {
        let rules = cfg.rule_set()?;
        let credentials = CredentialStore::load(&cfg.registry_auth)?;
        let registry = RegistryClient::new(
            cfg.docker.clone(),
            cfg.ghcr.clone(),
            CredentialStore::load(&cfg.registry_auth)?,
        );
        Ok(Coordinator {
            cfg,
            rules,
            credentials,
            registry,
            driver,
            cancel: CancelFlag::default(),
        })
    }

    /// Flag shared with signal handlers; setting it cancels the run at the
    /// next suspension point.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Execute one run and assemble the report.
    pub async fn run(&self, opts: &RunOptions) -> Result<RunReport, RunError> {
        self.cancel.reset();
        let _lock = RunLock::acquire(&opts.lock_path, opts.force_lock)?;
        let mut builder = ReportBuilder::new(opts.dry_run);

        // The global timeout rides the same cancellation flag as SIGTERM:
        // the step in flight completes, the rest of the run is abandoned.
        let watchdog = {
            let cancel = self.cancel.clone();
            let max_run_time = self.cfg.update.max_run_time;
            tokio::spawn(async move {
                tokio::time::sleep(max_run_time).await;
                warn!("global run timeout reached, cancelling run");
                cancel.cancel();
            })
        };

        let env_filter = EnvFilter::from_settings(&self.cfg.env_filtering)
            .map_err(|e| ConfigError::Invalid(vec![e]))?;
        let hooks = HookRunner::new(&self.cfg, opts.dry_run);

        let targets = self.discover_targets(opts, &mut builder).await?;
        let candidates = self.fetch_candidate_lists(&targets).await;

        let mut deferred: Option<DeferredSelfUpdate> = None;

        for target in &targets {
            if self.cancel.is_cancelled() {
                builder.mark_cancelled();
                info!("run cancelled, abandoning remaining containers");
                break;
            }
            let outcome = self
                .process_container(target, &candidates, &hooks, &env_filter, opts, &mut deferred)
                .await;
            builder.add_outcome(outcome);
        }

        if let Some(pending) = deferred {
            info!(container = %pending.container_name, "handling deferred self-update");
            if let Err(e) = self_update::spawn_helper(
                self.driver.as_ref(),
                &pending.container_name,
                &pending.image_reference,
                self.cfg.self_update.remove_helper_container,
                opts.dry_run,
            )
            .await
            {
                warn!(error = %e, "failed to create self-update helper container");
            }
        }

        let prune = crate::prune::run_prune(
            self.driver.as_ref(),
            &self.cfg.prune,
            opts.dry_run,
            chrono::Local::now(),
        )
        .await;
        builder.set_prune(prune);

        watchdog.abort();
        if self.cancel.is_cancelled() {
            builder.mark_cancelled();
        }
        Ok(builder.finish(self.registry.stats()))
    }

    /// Enumerate containers, apply the name filter, drop unrecognizable
    /// image references, resolve rules, and sort by name for deterministic
    /// ordering.
    async fn discover_targets(
        &self,
        opts: &RunOptions,
        builder: &mut ReportBuilder,
    ) -> Result<Vec<Target>, RunError> {
        let listed = self.driver.list_containers(false).await?;
        debug!(total = listed.len(), "containers before filtering");

        let mut targets = Vec::new();
        for summary in listed {
            if !name_matches(&summary.name, &opts.name_filters) {
                continue;
            }
            let image = match ImageRef::parse(&summary.image) {
                Some(image) => image,
                None => {
                    debug!(
                        container = %summary.name,
                        image = %summary.image,
                        "dropping container with unrecognizable image reference"
                    );
                    continue;
                }
            };

            let rule_name = self.resolve_rule_name(&summary, &image);
            let (rule, effective) = self.rules.resolve(&rule_name);
            if effective != rule_name {
                warn!(
                    container = %summary.name,
                    requested = %rule_name,
                    "assigned rule not found, falling back to 'default'"
                );
            }
            if !rule.allow.any() {
                info!(
                    container = %summary.name,
                    rule = effective,
                    "skipping container, assigned rule does not allow any updates"
                );
                builder.add_outcome(UpdateOutcome::skipped(
                    &summary.name,
                    &summary.image,
                    effective,
                    "rule allows no update kinds".to_string(),
                ));
                continue;
            }

            targets.push(Target {
                summary,
                image,
                rule_name: effective.to_string(),
            });
        }

        targets.sort_by(|a, b| a.summary.name.cmp(&b.summary.name));
        info!(count = targets.len(), "containers selected for processing");
        Ok(targets)
    }

    /// Rule precedence: label override, then by-name assignment, then
    /// by-image glob assignment, then `default`.
    fn resolve_rule_name(&self, summary: &ContainerSummary, image: &ImageRef) -> String {
        if let Some(label) = summary.labels.get(RULE_LABEL) {
            return label.clone();
        }
        if let Some(assigned) = self.cfg.assignments_by_name.get(&summary.name) {
            return assigned.clone();
        }
        let repo = image.pull_base();
        for (pattern, assigned) in &self.cfg.assignments_by_image {
            let matched = match Pattern::new(pattern) {
                Ok(compiled) => compiled.matches(&repo),
                Err(_) => pattern == &repo,
            };
            if matched {
                return assigned.clone();
            }
        }
        "default".to_string()
    }

    /// Group targets by image reference and fetch each group's candidate
    /// list once, concurrently under the semaphore.
    async fn fetch_candidate_lists(
        &self,
        targets: &[Target],
    ) -> HashMap<String, Result<Vec<Candidate>, RegistryError>> {
        let mut groups: HashMap<String, (&ImageRef, TagPattern)> = HashMap::new();
        for target in targets {
            let tag = match target.image.tag.as_deref() {
                Some(tag) => tag,
                None => continue,
            };
            let pattern = match TagPattern::induce(tag) {
                Some(pattern) => pattern,
                None => continue,
            };
            groups
                .entry(target.image.group_key())
                .or_insert((&target.image, pattern));
        }

        let semaphore = Arc::new(Semaphore::new(REGISTRY_CONCURRENCY));
        let fetches = groups.into_iter().map(|(key, (image, pattern))| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                debug!(image = %image.repository, "fetching candidate tags");
                let result = self.registry.fetch_candidates(image, &pattern).await;
                (key, result)
            }
        });

        futures::future::join_all(fetches).await.into_iter().collect()
    }

    async fn process_container(
        &self,
        target: &Target,
        candidates: &HashMap<String, Result<Vec<Candidate>, RegistryError>>,
        hooks: &HookRunner,
        env_filter: &EnvFilter,
        opts: &RunOptions,
        deferred: &mut Option<DeferredSelfUpdate>,
    ) -> UpdateOutcome {
        let name = &target.summary.name;
        info!(container = %name, "processing container");

        let details = match self.driver.inspect(&target.summary.id).await {
            Ok(details) => details,
            Err(e) => {
                return UpdateOutcome::skipped(
                    name,
                    &target.summary.image,
                    &target.rule_name,
                    format!("inspect failed: {e}"),
                );
            }
        };
        let local_digests = match self.driver.inspect_image(&details.image_id).await {
            Ok(image) => image.repo_digests,
            Err(e) => {
                debug!(error = %e, "could not inspect local image, digest matching disabled");
                Vec::new()
            }
        };

        let candidate_list = match candidates.get(&target.image.group_key()) {
            Some(Ok(list)) => list.as_slice(),
            Some(Err(e)) => {
                info!(container = %name, error = %e, "registry discovery failed");
                return UpdateOutcome::skipped(
                    name,
                    &target.summary.image,
                    &target.rule_name,
                    format!("{}: {e}", e.kind()),
                );
            }
            None => {
                return UpdateOutcome::skipped(
                    name,
                    &target.summary.image,
                    &target.rule_name,
                    SkipReason::TagNotParseable.to_string(),
                );
            }
        };

        let (rule, _) = self.rules.resolve(&target.rule_name);
        let plan = match plan_update(
            &details,
            &target.image,
            rule,
            &target.rule_name,
            candidate_list,
            &local_digests,
            Utc::now(),
        ) {
            Ok(plan) => plan,
            Err(SkipReason::NoCandidates) => {
                info!(container = %name, "no relevant image updates available");
                return UpdateOutcome::noop(
                    name,
                    &target.summary.image,
                    &target.rule_name,
                    SkipReason::NoCandidates.to_string(),
                );
            }
            Err(reason) => {
                info!(container = %name, %reason, "container skipped");
                return UpdateOutcome::skipped(
                    name,
                    &target.summary.image,
                    &target.rule_name,
                    reason.to_string(),
                );
            }
        };

        // Updating our own container mid-run would kill this process;
        // the final step's image is handed to a helper at the end.
        if self_update::is_self_container(&details.name, &details.id) {
            let last = plan.steps.last().expect("plans are never empty");
            let reference = plan
                .image
                .pull_reference(&last.target.tag, last.target.digest.as_deref());
            info!(
                container = %name,
                target = %reference,
                "self-update detected, deferring to end of run"
            );
            *deferred = Some(DeferredSelfUpdate {
                container_name: details.name.clone(),
                image_reference: reference,
            });
            return UpdateOutcome::skipped(
                name,
                &target.summary.image,
                &target.rule_name,
                "self-update deferred to helper container".to_string(),
            );
        }

        let executor = UpdateExecutor {
            driver: self.driver.as_ref(),
            hooks,
            env_filter,
            credentials: &self.credentials,
            verification: self.cfg.update_verification,
            delay_between_updates: self.cfg.update.delay_between_updates,
            dry_run: opts.dry_run,
            cancel: self.cancel.clone(),
        };
        executor.execute(&details, &plan).await
    }
}

/// OR-set name filtering: globs match with wildcards, bare names match
/// exactly, an empty filter set matches everything.
pub fn name_matches(name: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|filter| {
        if filter.contains(['*', '?', '[']) {
            Pattern::new(filter)
                .map(|p| p.matches(name))
                .unwrap_or(false)
        } else {
            filter == name
        }
    })
}
