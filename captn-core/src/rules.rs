//! Rule engine: which update steps a container may take.
//!
//! A rule enumerates permissible step kinds (`allow`), optional co-occurrence
//! conditions, a version-lag policy and a minimum image age. Rules are JSON
//! values in the configuration, overlaid on a fixed set of built-ins; unknown
//! keys are load-time errors.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::duration_str;
use crate::errors::ConfigError;
use crate::registry::Candidate;
use crate::version::{classify, DiffKind, Version};

/// Policy object deciding what kinds of steps a container may take.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
    #[serde(with = "duration_str")]
    pub min_image_age: Duration,
    #[serde(default)]
    pub progressive_upgrade: bool,
    pub allow: AllowSet,
    #[serde(default)]
    pub conditions: BTreeMap<DiffKind, RuleCondition>,
    #[serde(default)]
    pub lag_policy: BTreeMap<DiffKind, u64>,
}

/// Permissible step kinds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllowSet {
    pub major: bool,
    pub minor: bool,
    pub patch: bool,
    pub build: bool,
    pub digest: bool,
}

impl AllowSet {
    pub fn permits(&self, kind: DiffKind) -> bool {
        match kind {
            DiffKind::Major => self.major,
            DiffKind::Minor => self.minor,
            DiffKind::Patch => self.patch,
            DiffKind::Build => self.build,
            DiffKind::Digest => self.digest,
            DiffKind::None | DiffKind::SchemeChange => false,
        }
    }

    pub fn any(&self) -> bool {
        self.major || self.minor || self.patch || self.build || self.digest
    }
}

/// A kind is permitted only when at least one required kind is concurrently
/// available among the candidate set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleCondition {
    pub require: Vec<DiffKind>,
}

/// Built-in rules; names are part of the configuration surface.
const BUILTIN_RULES: &[(&str, &str)] = &[
    (
        "default",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": false,
            "allow": {"major": false, "minor": false, "patch": false, "build": false, "digest": false}
        }"#,
    ),
    (
        "strict",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": false,
            "allow": {"major": false, "minor": false, "patch": false, "build": false, "digest": false}
        }"#,
    ),
    (
        "patch_only",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": true,
            "allow": {"major": false, "minor": false, "patch": true, "build": false, "digest": false}
        }"#,
    ),
    (
        "digest_only",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": false,
            "allow": {"major": false, "minor": false, "patch": false, "build": false, "digest": true}
        }"#,
    ),
    (
        "security_only",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": true,
            "allow": {"major": false, "minor": false, "patch": true, "build": false, "digest": true}
        }"#,
    ),
    (
        "ci_cd",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": true,
            "allow": {"major": false, "minor": true, "patch": true, "build": true, "digest": false},
            "conditions": {"minor": {"require": ["patch"]}}
        }"#,
    ),
    (
        "conservative",
        r#"{
            "minImageAge": "24h",
            "progressiveUpgrade": true,
            "allow": {"major": false, "minor": false, "patch": true, "build": true, "digest": false},
            "lagPolicy": {"major": 1}
        }"#,
    ),
    (
        "relaxed",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": true,
            "allow": {"major": true, "minor": true, "patch": true, "build": true, "digest": true},
            "conditions": {"major": {"require": ["minor", "patch", "build"]}}
        }"#,
    ),
    (
        "permissive",
        r#"{
            "minImageAge": "3h",
            "progressiveUpgrade": true,
            "allow": {"major": true, "minor": true, "patch": true, "build": true, "digest": true}
        }"#,
    ),
];

/// Named rules: built-ins overlaid with configured ones.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: BTreeMap<String, Rule>,
}

impl RuleSet {
    pub fn with_builtins() -> RuleSet {
        let mut rules = BTreeMap::new();
        for (name, source) in BUILTIN_RULES {
            let rule = Self::parse_rule(source)
                .unwrap_or_else(|e| panic!("built-in rule '{name}' must parse: {e}"));
            rules.insert(name.to_string(), rule);
        }
        RuleSet { rules }
    }

    /// Built-ins plus file-configured rules; configured rules win by name.
    pub fn with_overrides(sources: &BTreeMap<String, String>) -> Result<RuleSet, ConfigError> {
        let mut set = Self::with_builtins();
        for (name, source) in sources {
            let rule = Self::parse_rule(source).map_err(|reason| ConfigError::RuleInvalid {
                name: name.clone(),
                reason,
            })?;
            set.rules.insert(name.clone(), rule);
        }
        Ok(set)
    }

    pub fn parse_rule(source: &str) -> Result<Rule, String> {
        serde_json::from_str(source).map_err(|e| e.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    /// Resolve a rule by name, falling back to `default`. Returns the rule
    /// and the effective name actually used.
    pub fn resolve<'a>(&'a self, name: &str) -> (&'a Rule, &'a str) {
        match self.rules.get_key_value(name) {
            Some((key, rule)) => (rule, key.as_str()),
            None => {
                let (key, rule) = self
                    .rules
                    .get_key_value("default")
                    .expect("default rule is built in");
                (rule, key.as_str())
            }
        }
    }
}

/// Why a candidate was rejected for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotAStep,
    TooYoung,
    KindNotAllowed(DiffKind),
    ConditionsUnmet(DiffKind),
    LagPolicy(DiffKind),
}

/// An admissible candidate together with its classified step kind.
#[derive(Debug, Clone)]
pub struct Admissible<'a> {
    pub candidate: &'a Candidate,
    pub kind: DiffKind,
}

/// Everything about the running container the rule engine needs.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub current_version: Option<&'a Version>,
    pub current_tag: &'a str,
    pub local_digests: &'a [String],
    pub now: DateTime<Utc>,
}

impl<'a> EvalContext<'a> {
    /// Step kind from the running container to a candidate, or `None` when
    /// the candidate is not a forward step.
    pub fn step_kind(&self, candidate: &Candidate) -> Option<DiffKind> {
        let kind = match (self.current_version, &candidate.version) {
            (Some(current), Some(version)) => classify(
                current,
                version,
                self.local_digests,
                candidate.digest.as_deref(),
            ),
            // Unparseable reference tag: only the identical tag is
            // comparable, by digest.
            _ if candidate.tag == self.current_tag => {
                match candidate.digest.as_deref() {
                    Some(remote) => {
                        let remote = crate::version::normalize_digest(remote);
                        let known = self
                            .local_digests
                            .iter()
                            .any(|d| crate::version::normalize_digest(d) == remote);
                        if known {
                            DiffKind::None
                        } else {
                            DiffKind::Digest
                        }
                    }
                    None => DiffKind::None,
                }
            }
            _ => DiffKind::None,
        };
        if kind == DiffKind::None {
            None
        } else {
            Some(kind)
        }
    }
}

/// Kinds present among the whole candidate set, unrestricted by `allow`.
fn available_kinds(ctx: &EvalContext<'_>, candidates: &[Candidate]) -> BTreeSet<DiffKind> {
    candidates
        .iter()
        .filter_map(|c| ctx.step_kind(c))
        .collect()
}

fn max_major(candidates: &[Candidate]) -> Option<u64> {
    candidates
        .iter()
        .filter_map(|c| c.version.as_ref())
        .map(|v| v.major())
        .max()
}

fn max_minor_within(candidates: &[Candidate], major: u64) -> Option<u64> {
    candidates
        .iter()
        .filter_map(|c| c.version.as_ref())
        .filter(|v| v.major() == major)
        .map(|v| v.minor())
        .max()
}

/// Evaluate one candidate against a rule.
pub fn evaluate(
    ctx: &EvalContext<'_>,
    candidate: &Candidate,
    candidates: &[Candidate],
    rule: &Rule,
) -> Result<DiffKind, Rejection> {
    let kind = ctx.step_kind(candidate).ok_or(Rejection::NotAStep)?;
    if kind == DiffKind::SchemeChange {
        return Err(Rejection::KindNotAllowed(kind));
    }

    if let Some(pushed_at) = candidate.pushed_at {
        let age = (ctx.now - pushed_at).to_std().unwrap_or(Duration::ZERO);
        if age < rule.min_image_age {
            return Err(Rejection::TooYoung);
        }
    }

    if !rule.allow.permits(kind) {
        return Err(Rejection::KindNotAllowed(kind));
    }

    if let Some(condition) = rule.conditions.get(&kind) {
        let available = available_kinds(ctx, candidates);
        let satisfied = condition.require.iter().any(|k| available.contains(k));
        if !satisfied {
            return Err(Rejection::ConditionsUnmet(kind));
        }
    }

    if let Some(version) = &candidate.version {
        if let Some(lag) = rule.lag_policy.get(&DiffKind::Major) {
            if let Some(max) = max_major(candidates) {
                if version.major() + lag > max {
                    return Err(Rejection::LagPolicy(DiffKind::Major));
                }
            }
        }
        if let Some(lag) = rule.lag_policy.get(&DiffKind::Minor) {
            if let Some(max) = max_minor_within(candidates, version.major()) {
                if version.minor() + lag > max {
                    return Err(Rejection::LagPolicy(DiffKind::Minor));
                }
            }
        }
    }

    Ok(kind)
}

/// Filter the candidate set down to the admissible set, keeping rejection
/// reasons for skip reporting.
pub fn admissible_set<'a>(
    ctx: &EvalContext<'_>,
    candidates: &'a [Candidate],
    rule: &Rule,
) -> (Vec<Admissible<'a>>, Vec<(&'a str, Rejection)>) {
    let mut admitted = Vec::new();
    let mut rejected = Vec::new();
    for candidate in candidates {
        match evaluate(ctx, candidate, candidates, rule) {
            Ok(kind) => admitted.push(Admissible { candidate, kind }),
            Err(rejection) => rejected.push((candidate.tag.as_str(), rejection)),
        }
    }
    // Ascending by version so a progressive chain can step through directly.
    admitted.sort_by(|a, b| match (&a.candidate.version, &b.candidate.version) {
        (Some(va), Some(vb)) => va.compare(vb).unwrap_or(std::cmp::Ordering::Equal),
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => std::cmp::Ordering::Equal,
    });
    (admitted, rejected)
}

/// Select the steps to apply: the whole admissible chain when progressive,
/// otherwise the single highest admissible candidate.
pub fn select_steps<'a>(
    ctx: &EvalContext<'_>,
    candidates: &'a [Candidate],
    rule: &Rule,
) -> (Vec<Admissible<'a>>, Vec<(&'a str, Rejection)>) {
    let (mut admitted, rejected) = admissible_set(ctx, candidates, rule);
    if !rule.progressive_upgrade && admitted.len() > 1 {
        admitted = vec![admitted.pop().expect("non-empty")];
    }
    (admitted, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn candidate(tag: &str, digest: &str, hours_old: i64) -> Candidate {
        Candidate {
            tag: tag.to_string(),
            version: Version::parse(tag),
            digest: Some(digest.to_string()),
            pushed_at: Some(Utc::now() - ChronoDuration::hours(hours_old)),
        }
    }

    fn ctx<'a>(
        current: &'a Option<Version>,
        tag: &'a str,
        local_digests: &'a [String],
    ) -> EvalContext<'a> {
        EvalContext {
            current_version: current.as_ref(),
            current_tag: tag,
            local_digests,
            now: Utc::now(),
        }
    }

    // =========================================================================
    // RuleSet
    // =========================================================================

    #[test]
    fn test_all_builtin_rules_parse() {
        let set = RuleSet::with_builtins();
        for name in [
            "default",
            "strict",
            "patch_only",
            "digest_only",
            "security_only",
            "ci_cd",
            "conservative",
            "relaxed",
            "permissive",
        ] {
            assert!(set.get(name).is_some(), "missing built-in rule {name}");
        }
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let set = RuleSet::with_builtins();
        let (rule, effective) = set.resolve("no_such_rule");
        assert_eq!(effective, "default");
        assert!(!rule.allow.any());
    }

    #[test]
    fn test_override_replaces_builtin() {
        let mut sources = BTreeMap::new();
        sources.insert(
            "default".to_string(),
            r#"{"minImageAge": "1h", "allow": {"patch": true}}"#.to_string(),
        );
        let set = RuleSet::with_overrides(&sources).unwrap();
        assert!(set.get("default").unwrap().allow.patch);
    }

    #[test]
    fn test_unknown_rule_key_rejected() {
        assert!(RuleSet::parse_rule(
            r#"{"minImageAge": "1h", "allow": {"patch": true}, "extra": 1}"#
        )
        .is_err());
        assert!(RuleSet::parse_rule(r#"{"minImageAge": "1h", "allow": {"rollback": true}}"#).is_err());
    }

    // =========================================================================
    // Admissibility (scenario-level)
    // =========================================================================

    #[test]
    fn test_patch_only_allows_patch_skips_minor() {
        // Current nginx:1.25.3@A; 1.25.4 and 1.26.0 published.
        let set = RuleSet::with_builtins();
        let rule = set.get("patch_only").unwrap();
        let current = Version::parse("1.25.3");
        let local = vec!["sha256:A".to_string()];
        let candidates = vec![
            candidate("1.26.0", "sha256:C", 10),
            candidate("1.25.4", "sha256:B", 5),
            candidate("1.25.3", "sha256:A", 2),
        ];
        let c = ctx(&current, "1.25.3", &local);

        let (steps, rejected) = select_steps(&c, &candidates, rule);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].candidate.tag, "1.25.4");
        assert_eq!(steps[0].kind, DiffKind::Patch);
        assert!(rejected
            .iter()
            .any(|(tag, r)| *tag == "1.26.0" && *r == Rejection::KindNotAllowed(DiffKind::Minor)));
    }

    #[test]
    fn test_progressive_chain_with_major_condition() {
        let set = RuleSet::with_builtins();
        let rule = set.get("relaxed").unwrap();
        let current = Version::parse("1.0.0");
        let local = vec!["sha256:base".to_string()];
        let candidates = vec![
            candidate("2.0.0", "sha256:c3", 48),
            candidate("1.1.0", "sha256:c2", 48),
            candidate("1.0.1", "sha256:c1", 48),
        ];
        let c = ctx(&current, "1.0.0", &local);

        let (steps, _) = select_steps(&c, &candidates, rule);
        let tags: Vec<&str> = steps.iter().map(|s| s.candidate.tag.as_str()).collect();
        assert_eq!(tags, vec!["1.0.1", "1.1.0", "2.0.0"]);
    }

    #[test]
    fn test_major_condition_blocks_lone_major() {
        let set = RuleSet::with_builtins();
        let rule = set.get("relaxed").unwrap();
        let current = Version::parse("1.0.0");
        let local = vec!["sha256:base".to_string()];
        let candidates = vec![candidate("2.0.0", "sha256:c3", 48)];
        let c = ctx(&current, "1.0.0", &local);

        let (steps, rejected) = select_steps(&c, &candidates, rule);
        assert!(steps.is_empty());
        assert_eq!(rejected[0].1, Rejection::ConditionsUnmet(DiffKind::Major));
    }

    #[test]
    fn test_min_image_age_defers_young_image() {
        let set = RuleSet::with_builtins();
        let rule = set.get("patch_only").unwrap();
        let current = Version::parse("15.2");
        let local = vec!["sha256:base".to_string()];
        let mut young = candidate("15.3", "sha256:new", 0);
        young.pushed_at = Some(Utc::now() - ChronoDuration::minutes(10));
        let candidates = vec![young];
        let c = ctx(&current, "15.2", &local);

        let (steps, rejected) = select_steps(&c, &candidates, rule);
        assert!(steps.is_empty());
        assert_eq!(rejected[0].1, Rejection::TooYoung);
    }

    #[test]
    fn test_digest_only_update_on_unparseable_tag() {
        let set = RuleSet::with_builtins();
        let rule = set.get("digest_only").unwrap();
        let current: Option<Version> = None;
        let local = vec!["sha256:local".to_string()];
        let candidates = vec![candidate("latest", "sha256:remote", 30)];
        let c = ctx(&current, "latest", &local);

        let (steps, _) = select_steps(&c, &candidates, rule);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, DiffKind::Digest);
    }

    #[test]
    fn test_digest_unchanged_is_not_a_step() {
        let current: Option<Version> = None;
        let local = vec!["sha256:same".to_string()];
        let c = ctx(&current, "latest", &local);
        let same = candidate("latest", "sha256:same", 30);
        assert_eq!(c.step_kind(&same), None);
    }

    #[test]
    fn test_lag_policy_holds_back_latest_major() {
        let set = RuleSet::with_builtins();
        let mut rule = set.get("permissive").unwrap().clone();
        rule.lag_policy.insert(DiffKind::Major, 1);
        let current = Version::parse("1.0.0");
        let local = vec!["sha256:base".to_string()];
        let candidates = vec![
            candidate("3.0.0", "sha256:c3", 48),
            candidate("2.0.0", "sha256:c2", 48),
            candidate("1.1.0", "sha256:c1", 48),
        ];
        let c = ctx(&current, "1.0.0", &local);

        let (steps, rejected) = select_steps(&c, &candidates, &rule);
        let tags: Vec<&str> = steps.iter().map(|s| s.candidate.tag.as_str()).collect();
        // maxMajor is 3, lag 1: majors above 2 are too recent.
        assert_eq!(tags, vec!["1.1.0", "2.0.0"]);
        assert!(rejected
            .iter()
            .any(|(tag, r)| *tag == "3.0.0" && *r == Rejection::LagPolicy(DiffKind::Major)));
    }

    #[test]
    fn test_non_progressive_takes_highest_admissible() {
        let set = RuleSet::with_builtins();
        let mut rule = set.get("permissive").unwrap().clone();
        rule.progressive_upgrade = false;
        let current = Version::parse("1.0.0");
        let local = vec!["sha256:base".to_string()];
        let candidates = vec![
            candidate("1.2.0", "sha256:c2", 48),
            candidate("1.1.0", "sha256:c1", 48),
        ];
        let c = ctx(&current, "1.0.0", &local);

        let (steps, _) = select_steps(&c, &candidates, &rule);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].candidate.tag, "1.2.0");
    }

    // =========================================================================
    // Monotonicity
    // =========================================================================

    #[test]
    fn test_more_permissive_rule_never_shrinks_admissible_set() {
        let set = RuleSet::with_builtins();
        let base = set.get("patch_only").unwrap().clone();
        let mut wider = base.clone();
        wider.allow.minor = true;
        wider.min_image_age = Duration::from_secs(0);

        let current = Version::parse("1.0.0");
        let local = vec!["sha256:base".to_string()];
        let candidates = vec![
            candidate("1.1.0", "sha256:c2", 2),
            candidate("1.0.1", "sha256:c1", 48),
        ];
        let c = ctx(&current, "1.0.0", &local);

        let (narrow, _) = admissible_set(&c, &candidates, &base);
        let (wide, _) = admissible_set(&c, &candidates, &wider);
        for step in &narrow {
            assert!(wide
                .iter()
                .any(|w| w.candidate.tag == step.candidate.tag));
        }
        assert!(wide.len() >= narrow.len());
    }
}
