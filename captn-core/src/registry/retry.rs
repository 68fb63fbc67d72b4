//! Bounded retry with exponential backoff for registry requests.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::errors::RegistryError;

use super::StatCounters;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Send a request, retrying on 5xx/429 and transport errors with exponential
/// backoff. Non-retryable statuses are returned to the caller untouched.
pub(crate) async fn send_with_retries(
    builder: RequestBuilder,
    stats: &StatCounters,
) -> Result<Response, RegistryError> {
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=MAX_ATTEMPTS {
        let request = builder
            .try_clone()
            .ok_or_else(|| RegistryError::Protocol("request body not replayable".to_string()))?;
        stats.request();

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let retryable =
                    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                if !retryable {
                    return Ok(response);
                }
                if attempt == MAX_ATTEMPTS {
                    return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                        RegistryError::RateLimited(format!("{status} after {attempt} attempts"))
                    } else {
                        RegistryError::Unreachable(format!("{status} after {attempt} attempts"))
                    });
                }
                debug!(%status, attempt, "retrying registry request");
            }
            Err(e) => {
                if attempt == MAX_ATTEMPTS {
                    return Err(RegistryError::Unreachable(e.to_string()));
                }
                debug!(error = %e, attempt, "retrying registry request");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }

    unreachable!("retry loop always returns within MAX_ATTEMPTS")
}
