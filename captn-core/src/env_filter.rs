//! Environment carry-over between the old container and its replacement.
//!
//! User-set variables survive an update; image-provided defaults come from
//! the new image. Shell-style globs decide exclusions and unconditional
//! preserves, with container-scoped overrides winning over the global sets.

use std::collections::BTreeMap;

use glob::Pattern;
use tracing::debug;

use crate::config::EnvFilterSettings;

/// Compiled env filter for one run.
#[derive(Debug, Default)]
pub struct EnvFilter {
    enabled: bool,
    exclude: Vec<Pattern>,
    preserve: Vec<Pattern>,
    /// Container-name substring (lowercased) -> override sets.
    container_rules: Vec<(String, Vec<Pattern>, Vec<Pattern>)>,
}

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                debug!(pattern = %p, error = %e, "ignoring invalid env pattern");
                None
            }
        })
        .collect()
}

impl EnvFilter {
    pub fn from_settings(settings: &EnvFilterSettings) -> Result<EnvFilter, String> {
        let container_rules = settings
            .container_rules()?
            .into_iter()
            .map(|(name, rules)| {
                (
                    name.to_lowercase(),
                    compile(&rules.exclude),
                    compile(&rules.preserve),
                )
            })
            .collect();
        Ok(EnvFilter {
            enabled: settings.enabled,
            exclude: compile(&settings.exclude_patterns),
            preserve: compile(&settings.preserve_patterns),
            container_rules,
        })
    }

    /// The exclude/preserve sets applicable to a container: the first
    /// container-specific rule whose key is a case-insensitive substring of
    /// the name overrides the global sets.
    fn sets_for(&self, container_name: &str) -> (&[Pattern], &[Pattern]) {
        let lowered = container_name.to_lowercase();
        for (needle, exclude, preserve) in &self.container_rules {
            if lowered.contains(needle) {
                return (exclude, preserve);
            }
        }
        (&self.exclude, &self.preserve)
    }

    /// Partition the old container's environment into the entries that go
    /// into the new container's spec and those inherited from the image.
    ///
    /// - old-only variables are user-set and preserved verbatim;
    /// - variables whose name exists in the image with a different value are
    ///   user overrides and keep the old value;
    /// - variables identical to the image default are inherited: omitted
    ///   from the spec so the new image supplies them;
    /// - excluded variables are dropped unless a preserve pattern matches
    ///   (preserve wins on conflict).
    pub fn filter(
        &self,
        container_name: &str,
        old_env: &[String],
        image_env: &[String],
    ) -> Vec<String> {
        if !self.enabled {
            return old_env.to_vec();
        }

        let image_values: BTreeMap<&str, &str> = image_env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .collect();
        let (exclude, preserve) = self.sets_for(container_name);

        let mut kept = Vec::with_capacity(old_env.len());
        for entry in old_env {
            let (name, value) = entry
                .split_once('=')
                .unwrap_or((entry.as_str(), ""));
            let preserved = preserve.iter().any(|p| p.matches(name));
            let excluded = exclude.iter().any(|p| p.matches(name));
            if excluded && !preserved {
                debug!(container = container_name, variable = name, "dropping env variable");
                continue;
            }
            if !preserved && image_values.get(name) == Some(&value) {
                // Identical to the image default: inherited, not pinned.
                continue;
            }
            kept.push(entry.clone());
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(
        exclude: &[&str],
        preserve: &[&str],
        container_rules: &str,
    ) -> EnvFilterSettings {
        EnvFilterSettings {
            enabled: true,
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
            preserve_patterns: preserve.iter().map(|s| s.to_string()).collect(),
            container_specific_rules: container_rules.to_string(),
        }
    }

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_user_set_variables_survive() {
        let filter = EnvFilter::from_settings(&settings(&[], &[], "")).unwrap();
        let old = env(&["APP_SECRET=abc", "PATH=/usr/bin"]);
        let image = env(&["PATH=/usr/local/bin"]);
        let kept = filter.filter("web", &old, &image);
        assert!(kept.contains(&"APP_SECRET=abc".to_string()));
        // Old value wins over the image default.
        assert!(kept.contains(&"PATH=/usr/bin".to_string()));
    }

    #[test]
    fn test_image_defaults_are_inherited_not_pinned() {
        let filter = EnvFilter::from_settings(&settings(&[], &[], "")).unwrap();
        let old = env(&["NGINX_VERSION=1.25.3", "CUSTOM=1"]);
        let image = env(&["NGINX_VERSION=1.25.3"]);
        let kept = filter.filter("web", &old, &image);
        // The image-provided value is not carried, so a new image can
        // supply its own.
        assert_eq!(kept, env(&["CUSTOM=1"]));
    }

    #[test]
    fn test_preserve_pins_even_image_defaults() {
        let filter =
            EnvFilter::from_settings(&settings(&[], &["NGINX_VERSION"], "")).unwrap();
        let old = env(&["NGINX_VERSION=1.25.3"]);
        let image = env(&["NGINX_VERSION=1.25.3"]);
        let kept = filter.filter("web", &old, &image);
        assert_eq!(kept, env(&["NGINX_VERSION=1.25.3"]));
    }

    #[test]
    fn test_exclude_patterns_drop_variables() {
        let filter = EnvFilter::from_settings(&settings(&["TMP*", "HOSTNAME"], &[], "")).unwrap();
        let old = env(&["TMPDIR=/tmp", "HOSTNAME=old", "KEEP=1"]);
        let kept = filter.filter("web", &old, &[]);
        assert_eq!(kept, env(&["KEEP=1"]));
    }

    #[test]
    fn test_preserve_wins_over_exclude() {
        let filter =
            EnvFilter::from_settings(&settings(&["APP_*"], &["APP_TOKEN"], "")).unwrap();
        let old = env(&["APP_TOKEN=t", "APP_CACHE=x"]);
        let kept = filter.filter("web", &old, &[]);
        assert_eq!(kept, env(&["APP_TOKEN=t"]));
    }

    #[test]
    fn test_container_specific_rules_override_global() {
        let filter = EnvFilter::from_settings(&settings(
            &["GLOBAL*"],
            &[],
            r#"{"Nginx": {"exclude": ["NGINX_*"], "preserve": []}}"#,
        ))
        .unwrap();
        let old = env(&["GLOBAL_X=1", "NGINX_PORT=80"]);
        // Case-insensitive substring match on the container name.
        let kept = filter.filter("prod-nginx-1", &old, &[]);
        assert_eq!(kept, env(&["GLOBAL_X=1"]));
        // Other containers keep using the global sets.
        let kept = filter.filter("redis", &old, &[]);
        assert_eq!(kept, env(&["NGINX_PORT=80"]));
    }

    #[test]
    fn test_disabled_filter_passes_everything() {
        let mut s = settings(&["*"], &[], "");
        s.enabled = false;
        let filter = EnvFilter::from_settings(&s).unwrap();
        let old = env(&["A=1", "B=2"]);
        assert_eq!(filter.filter("web", &old, &[]), old);
    }

    #[test]
    fn test_glob_question_mark_and_class() {
        let filter =
            EnvFilter::from_settings(&settings(&["VAR_?", "OPT_[AB]"], &[], "")).unwrap();
        let old = env(&["VAR_1=x", "VAR_22=y", "OPT_A=z", "OPT_C=w"]);
        let kept = filter.filter("web", &old, &[]);
        assert_eq!(kept, env(&["VAR_22=y", "OPT_C=w"]));
    }
}
