//! Update planning: container + rule + candidates -> plan or skip.
//!
//! Pure function of its inputs; all daemon and registry I/O happens before
//! (discovery) or after (execution) this point.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::docker::ContainerDetails;
use crate::registry::{Candidate, ImageRef};
use crate::rules::{select_steps, EvalContext, Rejection, Rule};
use crate::version::{DiffKind, Version};

/// A single candidate-application within a plan.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub target: Candidate,
    pub diff_kind: DiffKind,
}

/// Ordered, non-empty sequence of steps for one container.
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePlan {
    pub container_name: String,
    pub image: ImageRef,
    pub current_tag: String,
    pub rule_name: String,
    pub progressive: bool,
    /// Carried for the executor's authoritative re-check at pull time.
    pub min_image_age_secs: u64,
    pub steps: Vec<Step>,
}

/// Benign per-container skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    TagNotParseable,
    NoCandidates,
    RuleForbidsAll,
    ImageTooYoung,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::TagNotParseable => "TagNotParseable",
            SkipReason::NoCandidates => "NoCandidates",
            SkipReason::RuleForbidsAll => "RuleForbidsAll",
            SkipReason::ImageTooYoung => "ImageTooYoung",
        };
        write!(f, "{text}")
    }
}

/// Turn a container, its rule and the fetched candidates into a plan.
pub fn plan_update(
    container: &ContainerDetails,
    image: &ImageRef,
    rule: &Rule,
    rule_name: &str,
    candidates: &[Candidate],
    local_digests: &[String],
    now: DateTime<Utc>,
) -> Result<UpdatePlan, SkipReason> {
    let current_tag = match image.tag.as_deref() {
        Some(tag) => tag.to_string(),
        None => return Err(SkipReason::TagNotParseable),
    };
    let current_version = Version::parse(&current_tag);

    let ctx = EvalContext {
        current_version: current_version.as_ref(),
        current_tag: &current_tag,
        local_digests,
        now,
    };

    let (admitted, rejected) = select_steps(&ctx, candidates, rule);

    if admitted.is_empty() {
        let too_young = rejected
            .iter()
            .any(|(_, rejection)| *rejection == Rejection::TooYoung);
        if too_young {
            return Err(SkipReason::ImageTooYoung);
        }
        let forbidden = rejected.iter().any(|(_, rejection)| {
            matches!(
                rejection,
                Rejection::KindNotAllowed(_)
                    | Rejection::ConditionsUnmet(_)
                    | Rejection::LagPolicy(_)
            )
        });
        if forbidden {
            return Err(SkipReason::RuleForbidsAll);
        }
        if current_version.is_none() {
            return Err(SkipReason::TagNotParseable);
        }
        return Err(SkipReason::NoCandidates);
    }

    Ok(UpdatePlan {
        container_name: container.name.clone(),
        image: image.clone(),
        current_tag,
        rule_name: rule_name.to_string(),
        progressive: rule.progressive_upgrade,
        min_image_age_secs: rule.min_image_age.as_secs(),
        steps: admitted
            .into_iter()
            .map(|a| Step {
                target: a.candidate.clone(),
                diff_kind: a.kind,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Candidate;
    use crate::rules::RuleSet;
    use crate::testing::container_details;
    use chrono::Duration as ChronoDuration;

    fn candidate(tag: &str, digest: &str, hours_old: i64) -> Candidate {
        Candidate {
            tag: tag.to_string(),
            version: Version::parse(tag),
            digest: Some(digest.to_string()),
            pushed_at: Some(Utc::now() - ChronoDuration::hours(hours_old)),
        }
    }

    #[test]
    fn test_patch_only_single_step_plan() {
        let rules = RuleSet::with_builtins();
        let rule = rules.get("patch_only").unwrap();
        let container = container_details("web", "nginx:1.25.3", "sha256:A");
        let image = ImageRef::parse("nginx:1.25.3").unwrap();
        let candidates = vec![
            candidate("1.26.0", "sha256:C", 10),
            candidate("1.25.4", "sha256:B", 5),
            candidate("1.25.3", "sha256:A", 2),
        ];
        let local = vec!["sha256:A".to_string()];

        let plan = plan_update(
            &container,
            &image,
            rule,
            "patch_only",
            &candidates,
            &local,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].target.tag, "1.25.4");
        assert_eq!(plan.steps[0].diff_kind, DiffKind::Patch);
    }

    #[test]
    fn test_young_image_skips_with_image_too_young() {
        let rules = RuleSet::with_builtins();
        let rule = rules.get("patch_only").unwrap();
        let container = container_details("db", "postgres:15.2", "sha256:A");
        let image = ImageRef::parse("postgres:15.2").unwrap();
        let mut young = candidate("15.3", "sha256:B", 0);
        young.pushed_at = Some(Utc::now() - ChronoDuration::minutes(10));
        let local = vec!["sha256:A".to_string()];

        let err = plan_update(
            &container,
            &image,
            rule,
            "patch_only",
            &[young],
            &local,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, SkipReason::ImageTooYoung);
    }

    #[test]
    fn test_no_forward_candidates_skips() {
        let rules = RuleSet::with_builtins();
        let rule = rules.get("permissive").unwrap();
        let container = container_details("web", "nginx:1.25.3", "sha256:A");
        let image = ImageRef::parse("nginx:1.25.3").unwrap();
        let candidates = vec![candidate("1.25.3", "sha256:A", 48)];
        let local = vec!["sha256:A".to_string()];

        let err = plan_update(
            &container,
            &image,
            rule,
            "permissive",
            &candidates,
            &local,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, SkipReason::NoCandidates);
    }

    #[test]
    fn test_rule_forbidding_everything_skips() {
        let rules = RuleSet::with_builtins();
        let rule = rules.get("strict").unwrap();
        let container = container_details("web", "nginx:1.25.3", "sha256:A");
        let image = ImageRef::parse("nginx:1.25.3").unwrap();
        let candidates = vec![candidate("1.25.4", "sha256:B", 48)];
        let local = vec!["sha256:A".to_string()];

        let err = plan_update(
            &container,
            &image,
            rule,
            "strict",
            &candidates,
            &local,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, SkipReason::RuleForbidsAll);
    }

    #[test]
    fn test_digest_pinned_reference_not_parseable() {
        let rules = RuleSet::with_builtins();
        let rule = rules.get("permissive").unwrap();
        let container = container_details("web", "redis@sha256:abc", "sha256:abc");
        let image = ImageRef::parse("redis@sha256:abc").unwrap();
        let local = vec!["sha256:abc".to_string()];

        let err = plan_update(
            &container,
            &image,
            rule,
            "permissive",
            &[],
            &local,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, SkipReason::TagNotParseable);
    }

    #[test]
    fn test_progressive_chain_is_fully_admissible() {
        // Every step of a progressive plan is itself admissible and ends at
        // the highest admissible candidate.
        let rules = RuleSet::with_builtins();
        let rule = rules.get("relaxed").unwrap();
        let container = container_details("app", "app:1.0.0", "sha256:base");
        let image = ImageRef::parse("app:1.0.0").unwrap();
        let candidates = vec![
            candidate("2.0.0", "sha256:c3", 48),
            candidate("1.1.0", "sha256:c2", 48),
            candidate("1.0.1", "sha256:c1", 48),
            candidate("1.0.0", "sha256:base", 200),
        ];
        let local = vec!["sha256:base".to_string()];

        let plan = plan_update(
            &container,
            &image,
            rule,
            "relaxed",
            &candidates,
            &local,
            Utc::now(),
        )
        .unwrap();
        let tags: Vec<&str> = plan.steps.iter().map(|s| s.target.tag.as_str()).collect();
        assert_eq!(tags, vec!["1.0.1", "1.1.0", "2.0.0"]);
        assert!(plan.progressive);
    }
}
