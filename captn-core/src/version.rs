//! Tag version model: scheme detection, ordering and step classification.
//!
//! Tags are parsed into one of three shape classes (`semantic`, `date`,
//! `numeric`). Two versions are only ever ordered within the same scheme;
//! a cross-scheme transition always classifies as [`DiffKind::SchemeChange`].

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Shape class of a parsed tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Semantic,
    Date,
    Numeric,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Semantic => write!(f, "semantic"),
            Scheme::Date => write!(f, "date"),
            Scheme::Numeric => write!(f, "numeric"),
        }
    }
}

/// Classification of the step between two versions of the same image.
///
/// Variants are declared in ascending significance so `Ord` reflects how
/// large a step is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffKind {
    None,
    Digest,
    Build,
    Patch,
    Minor,
    Major,
    SchemeChange,
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffKind::None => write!(f, "none"),
            DiffKind::Digest => write!(f, "digest"),
            DiffKind::Build => write!(f, "build"),
            DiffKind::Patch => write!(f, "patch"),
            DiffKind::Minor => write!(f, "minor"),
            DiffKind::Major => write!(f, "major"),
            DiffKind::SchemeChange => write!(f, "scheme-change"),
        }
    }
}

/// A parsed image tag.
///
/// Ordering uses the numeric components (leading zeros normalized away);
/// the original spelling survives in `raw` so patterns and re-rendering keep
/// the literal form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub scheme: Scheme,
    components: Vec<u64>,
    build: Option<u64>,
    suffix: Option<String>,
    raw: String,
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})([.-])(\d{1,2})([.-])(\d{1,2})$").unwrap())
}

fn semantic_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-(\d+))?(?:-(.+))?$").unwrap()
    })
}

impl Version {
    /// Parse a tag into a version, or `None` when the tag has no recognizable
    /// version shape.
    ///
    /// A leading `v`/`V` is stripped before shape matching. Date shape wins
    /// over semantic when exactly three components fall within plausible
    /// year/month/day bounds. A bare integer is `numeric`. A non-numeric
    /// trailer after `-` is kept as an opaque suffix.
    pub fn parse(tag: &str) -> Option<Version> {
        let raw = tag.to_string();
        let body = tag
            .strip_prefix('v')
            .or_else(|| tag.strip_prefix('V'))
            .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
            .unwrap_or(tag);

        if let Some(caps) = date_regex().captures(body) {
            let year: u64 = caps[1].parse().ok()?;
            let month: u64 = caps[3].parse().ok()?;
            let day: u64 = caps[5].parse().ok()?;
            let same_separator = &caps[2] == &caps[4];
            if same_separator && year >= 1970 && (1..=12).contains(&month) && (1..=31).contains(&day)
            {
                return Some(Version {
                    scheme: Scheme::Date,
                    components: vec![year, month, day],
                    build: None,
                    suffix: None,
                    raw,
                });
            }
        }

        let caps = semantic_regex().captures(body)?;
        let mut components = Vec::new();
        for idx in 1..=3 {
            match caps.get(idx) {
                Some(m) => components.push(m.as_str().parse::<u64>().ok()?),
                None => break,
            }
        }
        let build = match caps.get(4) {
            Some(m) => Some(m.as_str().parse::<u64>().ok()?),
            None => None,
        };
        let suffix = caps.get(5).map(|m| m.as_str().to_string());

        if components.len() == 1 && build.is_none() && suffix.is_none() {
            return Some(Version {
                scheme: Scheme::Numeric,
                components,
                build: None,
                suffix: None,
                raw,
            });
        }

        Some(Version {
            scheme: Scheme::Semantic,
            components,
            build,
            suffix,
            raw,
        })
    }

    /// The tag exactly as it appeared on the registry.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Re-render the parsed form. Identical to [`Version::as_str`]; parsing
    /// the result yields the same scheme and ordering key.
    pub fn render(&self) -> String {
        self.raw.clone()
    }

    /// First numeric component (major for semantic, year for date, the whole
    /// value for numeric).
    pub fn major(&self) -> u64 {
        self.component(0)
    }

    pub fn minor(&self) -> u64 {
        self.component(1)
    }

    fn component(&self, idx: usize) -> u64 {
        self.components.get(idx).copied().unwrap_or(0)
    }

    fn build_or_zero(&self) -> u64 {
        self.build.unwrap_or(0)
    }

    /// Strict ordering within a scheme; `None` when the schemes differ.
    pub fn compare(&self, other: &Version) -> Option<Ordering> {
        if self.scheme != other.scheme {
            return None;
        }
        for idx in 0..3 {
            match self.component(idx).cmp(&other.component(idx)) {
                Ordering::Equal => {}
                unequal => return Some(unequal),
            }
        }
        Some(self.build_or_zero().cmp(&other.build_or_zero()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Strip a `sha256:`-style algorithm prefix or repository prefix from a
/// digest so digests from different sources compare equal.
pub fn normalize_digest(digest: &str) -> &str {
    digest.rsplit(':').next().unwrap_or(digest)
}

/// Classify the step from `old` to `new`, considering image digests for the
/// same-version case.
pub fn classify(
    old: &Version,
    new: &Version,
    old_digests: &[String],
    new_digest: Option<&str>,
) -> DiffKind {
    if old.scheme != new.scheme {
        return DiffKind::SchemeChange;
    }

    match old.compare(new) {
        None => DiffKind::SchemeChange,
        Some(Ordering::Greater) => DiffKind::None,
        Some(Ordering::Equal) => {
            // Zero-filled equality: a slot present on only one side is a
            // build-level difference before any digest comparison.
            if old.components.len() != new.components.len()
                || old.build.is_some() != new.build.is_some()
            {
                return DiffKind::Build;
            }
            match new_digest {
                Some(remote) => {
                    let remote = normalize_digest(remote);
                    let known = old_digests.iter().any(|d| normalize_digest(d) == remote);
                    if known {
                        DiffKind::None
                    } else {
                        DiffKind::Digest
                    }
                }
                None => DiffKind::None,
            }
        }
        Some(Ordering::Less) => match old.scheme {
            Scheme::Date => DiffKind::Patch,
            Scheme::Numeric => {
                let gap = new.component(0) - old.component(0);
                if gap > 10 {
                    DiffKind::Major
                } else if gap > 1 {
                    DiffKind::Minor
                } else {
                    DiffKind::Patch
                }
            }
            Scheme::Semantic => {
                for (idx, kind) in [DiffKind::Major, DiffKind::Minor, DiffKind::Patch]
                    .iter()
                    .enumerate()
                {
                    if old.component(idx) != new.component(idx) {
                        let missing =
                            idx >= old.components.len() || idx >= new.components.len();
                        // A component present on only one side never
                        // classifies higher than build.
                        return if missing { DiffKind::Build } else { *kind };
                    }
                }
                DiffKind::Build
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(tag: &str) -> Version {
        Version::parse(tag).unwrap_or_else(|| panic!("tag should parse: {tag}"))
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_parse_semantic_shapes() {
        assert_eq!(v("1.2.3").scheme, Scheme::Semantic);
        assert_eq!(v("1.25").scheme, Scheme::Semantic);
        assert_eq!(v("1.2.3-4").scheme, Scheme::Semantic);
        assert_eq!(v("v0.107.49").scheme, Scheme::Semantic);
    }

    #[test]
    fn test_parse_numeric_only_for_bare_integer() {
        assert_eq!(v("15").scheme, Scheme::Numeric);
        assert_eq!(v("3-alpine").scheme, Scheme::Semantic);
    }

    #[test]
    fn test_parse_date_with_plausible_bounds() {
        assert_eq!(v("2024.10.08").scheme, Scheme::Date);
        assert_eq!(v("2024-10-08").scheme, Scheme::Date);
        assert_eq!(v("2024.1.5").scheme, Scheme::Date);
        // Year below 1970 is an ordinary semantic version.
        assert_eq!(v("1.25.3").scheme, Scheme::Semantic);
        // Month out of range falls through to semantic.
        assert_eq!(v("2024.13.01").scheme, Scheme::Semantic);
    }

    #[test]
    fn test_parse_opaque_suffix_is_kept() {
        let ver = v("1.25-alpine");
        assert_eq!(ver.scheme, Scheme::Semantic);
        assert_eq!(ver.suffix.as_deref(), Some("alpine"));
        assert_eq!(ver.build, None);
    }

    #[test]
    fn test_parse_numeric_build_suffix() {
        let ver = v("1.2.3-7");
        assert_eq!(ver.build, Some(7));
        // The build component is `-`-separated; a fourth dotted component is
        // not a valid shape.
        assert!(Version::parse("8.0.1.1").is_none());
    }

    #[test]
    fn test_parse_rejects_non_versions() {
        assert!(Version::parse("latest").is_none());
        assert!(Version::parse("ubuntu-kde").is_none());
        assert!(Version::parse("").is_none());
    }

    #[test]
    fn test_render_round_trip_keeps_scheme() {
        for tag in ["v1.2.3", "2024.10.08", "15", "1.25-alpine", "1.2.3-7"] {
            let parsed = v(tag);
            let rendered = parsed.render();
            let reparsed = v(&rendered);
            assert_eq!(parsed.scheme, reparsed.scheme);
            assert_eq!(parsed.compare(&reparsed), Some(Ordering::Equal));
        }
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn test_compare_total_order_within_scheme() {
        let mut tags = vec![v("1.0.1"), v("2.0.0"), v("1.0.0"), v("1.1.0"), v("1.0.0-2")];
        tags.sort_by(|a, b| a.compare(b).unwrap());
        let sorted: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
        assert_eq!(sorted, vec!["1.0.0", "1.0.0-2", "1.0.1", "1.1.0", "2.0.0"]);
    }

    #[test]
    fn test_compare_across_schemes_is_undefined() {
        assert_eq!(v("1.2.3").compare(&v("2024.10.08")), None);
        assert_eq!(v("15").compare(&v("1.2.3")), None);
    }

    #[test]
    fn test_compare_normalizes_leading_zeros() {
        assert_eq!(v("1.02.3").compare(&v("1.2.3")), Some(Ordering::Equal));
    }

    #[test]
    fn test_missing_trailing_components_order_as_zero() {
        assert_eq!(v("1.2").compare(&v("1.2.0")), Some(Ordering::Equal));
        assert_eq!(v("1.2").compare(&v("1.2.1")), Some(Ordering::Less));
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn test_classify_semantic_steps() {
        let digests = vec!["sha256:aaa".to_string()];
        assert_eq!(
            classify(&v("1.0.0"), &v("2.0.0"), &digests, Some("sha256:bbb")),
            DiffKind::Major
        );
        assert_eq!(
            classify(&v("1.0.0"), &v("1.1.0"), &digests, Some("sha256:bbb")),
            DiffKind::Minor
        );
        assert_eq!(
            classify(&v("1.0.0"), &v("1.0.1"), &digests, Some("sha256:bbb")),
            DiffKind::Patch
        );
        assert_eq!(
            classify(&v("1.0.0"), &v("1.0.0-1"), &digests, Some("sha256:bbb")),
            DiffKind::Build
        );
    }

    #[test]
    fn test_classify_equal_version_by_digest() {
        let digests = vec!["sha256:aaa".to_string()];
        assert_eq!(
            classify(&v("1.0.0"), &v("1.0.0"), &digests, Some("sha256:bbb")),
            DiffKind::Digest
        );
        assert_eq!(
            classify(&v("1.0.0"), &v("1.0.0"), &digests, Some("sha256:aaa")),
            DiffKind::None
        );
        // Repository-prefixed digests normalize before comparison.
        assert_eq!(
            classify(
                &v("1.0.0"),
                &v("1.0.0"),
                &vec!["ghcr.io/acme/app@sha256:aaa".to_string()],
                Some("sha256:aaa")
            ),
            DiffKind::None
        );
    }

    #[test]
    fn test_classify_missing_vs_present_is_build() {
        let digests = vec![];
        assert_eq!(
            classify(&v("1.2"), &v("1.2.0"), &digests, Some("sha256:bbb")),
            DiffKind::Build
        );
        assert_eq!(
            classify(&v("1.2"), &v("1.2.1"), &digests, Some("sha256:bbb")),
            DiffKind::Build
        );
    }

    #[test]
    fn test_classify_scheme_change() {
        assert_eq!(
            classify(&v("1.2.3"), &v("2024.10.08"), &[], None),
            DiffKind::SchemeChange
        );
    }

    #[test]
    fn test_classify_date_steps_are_patch() {
        assert_eq!(
            classify(&v("2023.01.05"), &v("2024.10.08"), &[], Some("sha256:bbb")),
            DiffKind::Patch
        );
        assert_eq!(
            classify(&v("2024.10.07"), &v("2024.10.08"), &[], Some("sha256:bbb")),
            DiffKind::Patch
        );
    }

    #[test]
    fn test_classify_numeric_gap_sizing() {
        let d = vec![];
        assert_eq!(classify(&v("15"), &v("16"), &d, None), DiffKind::Patch);
        assert_eq!(classify(&v("15"), &v("18"), &d, None), DiffKind::Minor);
        assert_eq!(classify(&v("15"), &v("40"), &d, None), DiffKind::Major);
    }

    #[test]
    fn test_classify_older_candidate_is_none() {
        assert_eq!(
            classify(&v("2.0.0"), &v("1.9.0"), &[], Some("sha256:bbb")),
            DiffKind::None
        );
    }
}
