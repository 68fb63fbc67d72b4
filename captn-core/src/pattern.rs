//! Tag-pattern induction.
//!
//! From the tag a container currently runs, derive the regular expression
//! that selects comparable remote tags: every digit run becomes `[0-9]+`,
//! everything else stays literal. `nginx:1.25-alpine` therefore matches
//! `1.26-alpine` but not `1.26-slim` or `1.26`.

use regex::Regex;

/// Tag-shape filter induced from a reference tag. Lives for one run.
#[derive(Debug, Clone)]
pub struct TagPattern {
    reference: String,
    regex: Regex,
}

impl TagPattern {
    /// Build the pattern for a reference tag.
    ///
    /// A digitless reference (`latest`, `stable`) induces a purely literal
    /// pattern: the only comparable remote tag is the reference itself, which
    /// is exactly what digest-only update checking needs.
    ///
    /// Returns `None` only for an empty reference.
    pub fn induce(reference: &str) -> Option<TagPattern> {
        if reference.is_empty() {
            return None;
        }

        let mut source = String::from("^");
        let mut in_digit_run = false;
        for ch in reference.chars() {
            if ch.is_ascii_digit() {
                if !in_digit_run {
                    source.push_str("[0-9]+");
                    in_digit_run = true;
                }
            } else {
                source.push_str(&regex::escape(&ch.to_string()));
                in_digit_run = false;
            }
        }
        source.push('$');

        let regex = Regex::new(&source).ok()?;
        Some(TagPattern {
            reference: reference.to_string(),
            regex,
        })
    }

    /// The tag this pattern was induced from.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.regex.is_match(tag)
    }
}
