//! Registry discovery: tag lists, digests and push timestamps.
//!
//! Registry-access variations are a capability with three profiles (Docker
//! Hub, GHCR, generic v2) selected by registry host. Candidates returned to
//! the planner are pattern-filtered, version-sorted descending and truncated
//! at the currently-running tag, so only the current and newer tags reach
//! rule evaluation.

mod auth;
mod generic;
mod hub;
mod retry;
mod v2;

pub use auth::{CredentialStore, Credentials};

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::RegistryEndpoint;
use crate::errors::RegistryError;
use crate::pattern::TagPattern;
use crate::version::Version;

/// A remote tag enriched with digest and push time; an input to planning.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub tag: String,
    /// Parsed version; `None` only for the reference tag itself when it has
    /// no version shape (digest-only flow).
    pub version: Option<Version>,
    pub digest: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Parsed image reference: registry host, repository path and tag/digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference like `nginx:1.25`, `ghcr.io/acme/app:2.0` or
    /// `redis@sha256:...`. Single-segment names resolve to the Docker Hub
    /// `library/` namespace.
    pub fn parse(reference: &str) -> Option<ImageRef> {
        if reference.is_empty() || reference.starts_with("sha256:") {
            return None;
        }

        let (path, digest) = match reference.split_once('@') {
            Some((p, d)) => (p, Some(d.to_string())),
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let (path, tag) = match path.rsplit_once(':') {
            Some((p, t)) if !t.contains('/') => (p, Some(t.to_string())),
            _ => (path, None),
        };

        if path.is_empty() {
            return None;
        }

        let parts: Vec<&str> = path.split('/').collect();
        let (registry, repository) = if parts.len() == 1 {
            ("docker.io".to_string(), format!("library/{}", parts[0]))
        } else if !parts[0].contains('.') && !parts[0].contains(':') {
            ("docker.io".to_string(), path.to_string())
        } else {
            (parts[0].to_string(), parts[1..].join("/"))
        };

        if repository.is_empty() {
            return None;
        }

        Some(ImageRef {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Repository part as written on the host (`nginx`, `ghcr.io/acme/app`),
    /// suitable as the base of a pullable reference.
    pub fn pull_base(&self) -> String {
        if self.registry == "docker.io" {
            match self.repository.strip_prefix("library/") {
                Some(short) => short.to_string(),
                None => self.repository.clone(),
            }
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// Pullable reference for a tag, digest-pinned when the digest is known.
    pub fn pull_reference(&self, tag: &str, digest: Option<&str>) -> String {
        match digest {
            Some(d) => format!("{}@{}", self.pull_base(), ensure_algo_prefix(d)),
            None => format!("{}:{}", self.pull_base(), tag),
        }
    }

    /// Key for grouping containers that share registry work.
    pub fn group_key(&self) -> String {
        format!(
            "{}/{}:{}",
            self.registry,
            self.repository,
            self.tag.as_deref().unwrap_or("")
        )
    }
}

fn ensure_algo_prefix(digest: &str) -> String {
    if digest.contains(':') {
        digest.to_string()
    } else {
        format!("sha256:{digest}")
    }
}

/// Registry protocol profile, selected by host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryProfile {
    Hub,
    Ghcr,
    GenericV2,
}

impl RegistryProfile {
    pub fn for_registry(registry: &str) -> RegistryProfile {
        match registry {
            "docker.io" => RegistryProfile::Hub,
            "ghcr.io" => RegistryProfile::Ghcr,
            _ => RegistryProfile::GenericV2,
        }
    }
}

/// Counters aggregated into the run report.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RegistryStats {
    pub images_queried: u64,
    pub requests: u64,
    pub tags_fetched: u64,
    pub failures: u64,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    requests: AtomicU64,
    tags_fetched: AtomicU64,
    images_queried: AtomicU64,
    failures: AtomicU64,
}

impl StatCounters {
    pub(crate) fn request(&self) {
        self.requests.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn tags(&self, n: u64) {
        self.tags_fetched.fetch_add(n, AtomicOrdering::Relaxed);
    }
}

/// Client over all registry profiles.
pub struct RegistryClient {
    http: reqwest::Client,
    docker: RegistryEndpoint,
    ghcr: RegistryEndpoint,
    credentials: CredentialStore,
    stats: StatCounters,
}

impl RegistryClient {
    pub fn new(
        docker: RegistryEndpoint,
        ghcr: RegistryEndpoint,
        credentials: CredentialStore,
    ) -> RegistryClient {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        RegistryClient {
            http,
            docker,
            ghcr,
            credentials,
            stats: StatCounters::default(),
        }
    }

    /// Fetch the candidate list for an image, filtered by the induced
    /// pattern and ordered newest first.
    pub async fn fetch_candidates(
        &self,
        image: &ImageRef,
        pattern: &TagPattern,
    ) -> Result<Vec<Candidate>, RegistryError> {
        self.stats
            .images_queried
            .fetch_add(1, AtomicOrdering::Relaxed);

        let creds = self
            .credentials
            .lookup(&image.registry, &image.repository);

        let result = match RegistryProfile::for_registry(&image.registry) {
            RegistryProfile::Hub => {
                hub::list_tags(&self.http, &self.docker, image, pattern, creds, &self.stats).await
            }
            RegistryProfile::Ghcr => {
                v2::list_tags_ghcr(&self.http, &self.ghcr, image, pattern, creds, &self.stats)
                    .await
            }
            RegistryProfile::GenericV2 => {
                generic::list_tags(&self.http, image, pattern, creds, &self.stats).await
            }
        };

        match result {
            Ok(raw) => {
                let candidates = finalize_candidates(raw, pattern);
                debug!(
                    image = %image.repository,
                    total = candidates.len(),
                    "candidate tags after filter/sort/truncate"
                );
                Ok(candidates)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, AtomicOrdering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            images_queried: self.stats.images_queried.load(AtomicOrdering::Relaxed),
            requests: self.stats.requests.load(AtomicOrdering::Relaxed),
            tags_fetched: self.stats.tags_fetched.load(AtomicOrdering::Relaxed),
            failures: self.stats.failures.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Pattern-filter, parse, dedup, sort descending and truncate at the
/// reference tag (inclusive).
pub fn finalize_candidates(raw: Vec<Candidate>, pattern: &TagPattern) -> Vec<Candidate> {
    let reference = pattern.reference();
    let mut seen: Vec<Candidate> = Vec::new();

    for mut candidate in raw {
        if !pattern.matches(&candidate.tag) {
            continue;
        }
        candidate.version = Version::parse(&candidate.tag);
        // Unparseable tags are dropped, except the reference tag itself
        // which stays comparable by digest.
        if candidate.version.is_none() && candidate.tag != reference {
            continue;
        }
        seen.push(candidate);
    }

    seen = dedup_candidates(seen);

    seen.sort_by(|a, b| match (&a.version, &b.version) {
        (Some(va), Some(vb)) => va
            .compare(vb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .reverse()
            .then_with(|| b.tag.cmp(&a.tag)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.tag.cmp(&a.tag),
    });

    // Keep the reference tag and everything newer.
    if let Some(idx) = seen.iter().position(|c| c.tag == reference) {
        seen.truncate(idx + 1);
    }

    seen
}

/// Collapse duplicates: the same version with two digests keeps the newer
/// push; the same digest under two versions keeps the lower version with the
/// newer push.
fn dedup_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    use std::cmp::Ordering;

    // Same tag appearing twice (paginated overlap): newest push wins.
    candidates.sort_by(|a, b| a.tag.cmp(&b.tag).then_with(|| b.pushed_at.cmp(&a.pushed_at)));
    candidates.dedup_by(|next, kept| kept.tag == next.tag);

    // Same digest under two parseable versions: keep the lower version,
    // preferring the newer push time when it differs.
    let mut result: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let duplicate = result.iter_mut().find(|kept| {
            kept.digest.is_some() && kept.digest == candidate.digest
        });
        match duplicate {
            Some(kept) => {
                let lower = match (&kept.version, &candidate.version) {
                    (Some(kv), Some(cv)) => cv.compare(kv) == Some(Ordering::Less),
                    (None, Some(_)) => true,
                    _ => false,
                };
                if lower {
                    let pushed_at = kept.pushed_at.max(candidate.pushed_at);
                    *kept = Candidate {
                        pushed_at,
                        ..candidate
                    };
                }
            }
            None => result.push(candidate),
        }
    }
    result
}
