//! Docker Hub tag listing.
//!
//! Hub's repository API returns a paginated JSON listing that already carries
//! push timestamps and digests, so no per-tag manifest requests are needed.

use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::RegistryEndpoint;
use crate::errors::RegistryError;
use crate::pattern::TagPattern;

use super::retry::send_with_retries;
use super::{auth::Credentials, Candidate, ImageRef, StatCounters};

#[derive(Debug, Deserialize)]
struct TagPage {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    tag_last_pushed: Option<String>,
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    images: Vec<TagImage>,
}

#[derive(Debug, Deserialize)]
struct TagImage {
    #[serde(default)]
    digest: Option<String>,
}

impl TagEntry {
    fn into_candidate(self) -> Candidate {
        let digest = self
            .digest
            .or_else(|| self.images.into_iter().find_map(|i| i.digest));
        let pushed_at = self
            .tag_last_pushed
            .or(self.last_updated)
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&chrono::Utc));
        Candidate {
            tag: self.name,
            version: None,
            digest,
            pushed_at,
        }
    }
}

fn with_page_size(url: &str, page_size: u32) -> Result<String, RegistryError> {
    let mut parsed = Url::parse(url).map_err(|e| RegistryError::Protocol(e.to_string()))?;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "page_size")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("page_size", &page_size.to_string());
    Ok(parsed.into())
}

/// Crawl the tag listing, stopping at the page limit, at the page carrying
/// the reference tag, or once a page stops contributing matching tags.
pub(crate) async fn list_tags(
    http: &reqwest::Client,
    cfg: &RegistryEndpoint,
    image: &ImageRef,
    pattern: &TagPattern,
    creds: Option<&Credentials>,
    stats: &StatCounters,
) -> Result<Vec<Candidate>, RegistryError> {
    let mut url = Some(format!(
        "{}/repositories/{}/tags",
        cfg.api_url.trim_end_matches('/'),
        image.repository
    ));
    let mut candidates = Vec::new();
    let mut pages = 0u32;
    let mut matched_any = false;
    let mut total_entries = 0usize;

    while let Some(current) = url.take() {
        if pages >= cfg.page_crawl_limit {
            break;
        }
        pages += 1;

        let paged = with_page_size(&current, cfg.page_size)?;
        let mut request = http.get(&paged);
        if let Some(basic) = creds.and_then(Credentials::basic_header) {
            request = request.header(AUTHORIZATION, basic);
        }

        let response = send_with_retries(request, stats).await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RegistryError::AuthFailed(format!(
                "{status} from {}",
                image.repository
            )));
        }
        if !status.is_success() {
            return Err(RegistryError::Protocol(format!(
                "unexpected status {status} listing tags for {}",
                image.repository
            )));
        }

        let page: TagPage = response
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        stats.tags(page.results.len() as u64);
        total_entries += page.results.len();

        let mut page_matches = 0usize;
        let mut saw_reference = false;
        for entry in page.results {
            if pattern.matches(&entry.name) {
                page_matches += 1;
                saw_reference |= entry.name == pattern.reference();
                candidates.push(entry.into_candidate());
            }
        }

        debug!(
            image = %image.repository,
            page = pages,
            matches = page_matches,
            "docker hub tag page"
        );

        // Hub lists newest first; past the reference tag everything is
        // older than what is running.
        if saw_reference {
            break;
        }
        if page_matches == 0 && matched_any {
            break;
        }
        matched_any |= page_matches > 0;
        url = page.next;
    }

    if total_entries == 0 {
        return Err(RegistryError::TagListEmpty(image.repository.clone()));
    }

    Ok(candidates)
}
