//! Shared OCI distribution plumbing: tag-list pagination and per-tag
//! manifest inspection. Used by the GHCR and generic v2 profiles.

use reqwest::header::{ACCEPT, AUTHORIZATION, LINK};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RegistryEndpoint;
use crate::errors::RegistryError;
use crate::pattern::TagPattern;

use super::retry::send_with_retries;
use super::{auth::Credentials, finalize_candidates, Candidate, ImageRef, StatCounters};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json,\
application/vnd.docker.distribution.manifest.list.v2+json,\
application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Follow the `Link: <...>; rel="next"` pagination of `/tags/list`.
pub(crate) async fn paginate_tag_list(
    http: &reqwest::Client,
    api_url: &str,
    repository: &str,
    page_size: u32,
    page_limit: u32,
    auth_header: Option<&str>,
    stats: &StatCounters,
) -> Result<Vec<String>, RegistryError> {
    let origin = origin_of(api_url)?;
    let mut url = Some(format!(
        "{}/{}/tags/list?n={}",
        api_url.trim_end_matches('/'),
        repository,
        page_size
    ));
    let mut tags = Vec::new();
    let mut pages = 0u32;

    while let Some(current) = url.take() {
        if pages >= page_limit {
            break;
        }
        pages += 1;

        let mut request = http.get(&current);
        if let Some(header) = auth_header {
            request = request.header(AUTHORIZATION, header);
        }
        let response = send_with_retries(request, stats).await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RegistryError::AuthFailed(format!(
                "{status} listing tags for {repository}"
            )));
        }
        if !status.is_success() {
            return Err(RegistryError::Protocol(format!(
                "unexpected status {status} listing tags for {repository}"
            )));
        }

        let next = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link)
            .map(|path| {
                if path.starts_with("http") {
                    path
                } else {
                    format!("{origin}{path}")
                }
            });

        let page: TagList = response
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        let page_tags = page.tags.unwrap_or_default();
        stats.tags(page_tags.len() as u64);
        debug!(repository, page = pages, count = page_tags.len(), "v2 tag page");
        tags.extend(page_tags);

        url = next;
    }

    Ok(tags)
}

fn origin_of(api_url: &str) -> Result<String, RegistryError> {
    let parsed =
        url::Url::parse(api_url).map_err(|e| RegistryError::Protocol(e.to_string()))?;
    let mut origin = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default()
    );
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    Ok(origin)
}

fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let start = part.find('<')? + 1;
        let end = part.find('>')?;
        return Some(part[start..end].to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<ManifestConfig>,
}

#[derive(Debug, Deserialize)]
struct ManifestConfig {
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    created: Option<String>,
}

/// Fetch digest and creation timestamp for one tag.
///
/// The digest comes from the `Docker-Content-Digest` response header; the
/// timestamp from the OCI `created` annotation, the manifest `created`
/// field, or (for single-arch v2 manifests) the config blob.
pub(crate) async fn manifest_details(
    http: &reqwest::Client,
    api_url: &str,
    repository: &str,
    tag: &str,
    auth_header: Option<&str>,
    stats: &StatCounters,
) -> Result<(Option<String>, Option<String>), RegistryError> {
    let url = format!(
        "{}/{}/manifests/{}",
        api_url.trim_end_matches('/'),
        repository,
        tag
    );
    let mut request = http.get(&url).header(ACCEPT, MANIFEST_ACCEPT);
    if let Some(header) = auth_header {
        request = request.header(AUTHORIZATION, header);
    }

    let response = send_with_retries(request, stats).await?;
    let status = response.status();
    if !status.is_success() {
        warn!(repository, tag, %status, "manifest fetch failed");
        return Ok((None, None));
    }

    let digest = response
        .headers()
        .get("Docker-Content-Digest")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let manifest: Manifest = response
        .json()
        .await
        .map_err(|e| RegistryError::Protocol(e.to_string()))?;

    let mut created = manifest
        .annotations
        .get("org.opencontainers.image.created")
        .cloned()
        .or(manifest.created);

    if created.is_none()
        && manifest.media_type.as_deref()
            == Some("application/vnd.docker.distribution.manifest.v2+json")
    {
        if let Some(config_digest) = manifest.config.and_then(|c| c.digest) {
            let blob_url = format!(
                "{}/{}/blobs/{}",
                api_url.trim_end_matches('/'),
                repository,
                config_digest
            );
            let mut blob_request = http.get(&blob_url);
            if let Some(header) = auth_header {
                blob_request = blob_request.header(AUTHORIZATION, header);
            }
            if let Ok(blob_response) = send_with_retries(blob_request, stats).await {
                if blob_response.status().is_success() {
                    if let Ok(blob) = blob_response.json::<ConfigBlob>().await {
                        created = blob.created;
                    }
                }
            }
        }
    }

    Ok((digest, created))
}

/// Shared back half of the GHCR and generic profiles: pattern-filter, sort
/// and truncate the tag list, then enrich the survivors with manifest data.
pub(crate) async fn candidates_with_details(
    http: &reqwest::Client,
    api_url: &str,
    image: &ImageRef,
    pattern: &TagPattern,
    tags: Vec<String>,
    auth_header: Option<&str>,
    stats: &StatCounters,
) -> Result<Vec<Candidate>, RegistryError> {
    if tags.is_empty() {
        return Err(RegistryError::TagListEmpty(image.repository.clone()));
    }

    let bare: Vec<Candidate> = tags
        .into_iter()
        .map(|tag| Candidate {
            tag,
            version: None,
            digest: None,
            pushed_at: None,
        })
        .collect();
    let kept = finalize_candidates(bare, pattern);

    let mut detailed = Vec::with_capacity(kept.len());
    for mut candidate in kept {
        let (digest, created) = manifest_details(
            http,
            api_url,
            &image.repository,
            &candidate.tag,
            auth_header,
            stats,
        )
        .await?;
        candidate.digest = digest;
        candidate.pushed_at = created
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&chrono::Utc));
        detailed.push(candidate);
    }

    Ok(detailed)
}

/// GHCR profile: anonymous (or pre-issued) token from the GHCR token
/// endpoint, then the shared v2 flow.
pub(crate) async fn list_tags_ghcr(
    http: &reqwest::Client,
    cfg: &RegistryEndpoint,
    image: &ImageRef,
    pattern: &TagPattern,
    creds: Option<&Credentials>,
    stats: &StatCounters,
) -> Result<Vec<Candidate>, RegistryError> {
    let auth_header = match creds.and_then(Credentials::bearer_header) {
        Some(header) => header,
        None => {
            let origin = origin_of(&cfg.api_url)?;
            let token = anonymous_token(http, &origin, &image.repository, stats).await?;
            format!("Bearer {token}")
        }
    };

    let tags = paginate_tag_list(
        http,
        &cfg.api_url,
        &image.repository,
        cfg.page_size,
        cfg.page_crawl_limit,
        Some(&auth_header),
        stats,
    )
    .await?;

    candidates_with_details(
        http,
        &cfg.api_url,
        image,
        pattern,
        tags,
        Some(&auth_header),
        stats,
    )
    .await
}

async fn anonymous_token(
    http: &reqwest::Client,
    origin: &str,
    repository: &str,
    stats: &StatCounters,
) -> Result<String, RegistryError> {
    #[derive(Deserialize)]
    struct Token {
        token: Option<String>,
    }

    let request = http.get(format!("{origin}/token")).query(&[(
        "scope",
        format!("repository:{repository}:pull"),
    )]);
    let response = send_with_retries(request, stats).await?;
    if !response.status().is_success() {
        return Err(RegistryError::AuthFailed(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }
    let parsed: Token = response
        .json()
        .await
        .map_err(|e| RegistryError::Protocol(e.to_string()))?;
    parsed
        .token
        .ok_or_else(|| RegistryError::AuthFailed("no token received".to_string()))
}
