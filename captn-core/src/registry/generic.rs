//! Generic v2 registry profile.
//!
//! Differs from GHCR only in token acquisition: the first request is sent
//! anonymously (or with configured basic credentials) and a bearer challenge
//! in the 401 response is answered transparently.

use reqwest::header::WWW_AUTHENTICATE;

use crate::errors::RegistryError;
use crate::pattern::TagPattern;

use super::auth::{parse_bearer_challenge, token_for_challenge, Credentials};
use super::retry::send_with_retries;
use super::v2::{candidates_with_details, paginate_tag_list};
use super::{Candidate, ImageRef, StatCounters};

pub(crate) async fn list_tags(
    http: &reqwest::Client,
    image: &ImageRef,
    pattern: &TagPattern,
    creds: Option<&Credentials>,
    stats: &StatCounters,
) -> Result<Vec<Candidate>, RegistryError> {
    let api_url = format!("https://{}/v2", image.registry);
    let auth_header = resolve_auth(http, &api_url, image, creds, stats).await?;

    let tags = paginate_tag_list(
        http,
        &api_url,
        &image.repository,
        100,
        1000,
        auth_header.as_deref(),
        stats,
    )
    .await?;

    candidates_with_details(
        http,
        &api_url,
        image,
        pattern,
        tags,
        auth_header.as_deref(),
        stats,
    )
    .await
}

/// Probe the registry once; on a bearer challenge, acquire a token scoped to
/// this repository. Basic credentials are used directly when no challenge is
/// issued.
async fn resolve_auth(
    http: &reqwest::Client,
    api_url: &str,
    image: &ImageRef,
    creds: Option<&Credentials>,
    stats: &StatCounters,
) -> Result<Option<String>, RegistryError> {
    if let Some(bearer) = creds.and_then(Credentials::bearer_header) {
        return Ok(Some(bearer));
    }

    let probe_url = format!(
        "{}/{}/tags/list?n=1",
        api_url.trim_end_matches('/'),
        image.repository
    );
    let mut request = http.get(&probe_url);
    if let Some(basic) = creds.and_then(Credentials::basic_header) {
        request = request.header(reqwest::header::AUTHORIZATION, basic);
    }
    let response = send_with_retries(request, stats).await?;

    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        // Anonymous or basic access is already sufficient.
        return Ok(creds.and_then(Credentials::basic_header));
    }

    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer_challenge)
        .ok_or_else(|| {
            RegistryError::AuthFailed(format!(
                "401 without bearer challenge from {}",
                image.registry
            ))
        })?;

    let fallback_scope = format!("repository:{}:pull", image.repository);
    let token = token_for_challenge(http, &challenge, &fallback_scope, creds).await?;
    Ok(Some(format!("Bearer {token}")))
}
