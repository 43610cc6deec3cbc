//! Shared JSON-over-HTTP call with retry and backoff.
//!
//! Used by the remote embedding providers and the reranker:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately, not retryable
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! When retries run out the error is still marked retryable, so the
//! ingest orchestrator may retry the whole batch later.

use std::time::Duration;

use ragweave_core::{Error, Result};
use serde_json::Value;

pub(crate) fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}

/// POST `body` to `url` and return the decoded JSON response.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    max_retries: u32,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::warn!(provider, attempt, delay_secs = delay.as_secs(), "retrying request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| Error::provider_fatal(provider, format!("invalid JSON: {e}")));
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(Error::provider(
                        provider,
                        format!("API error {status}: {body_text}"),
                    ));
                    continue;
                }

                return Err(Error::provider_fatal(
                    provider,
                    format!("API error {status}: {body_text}"),
                ));
            }
            Err(e) => {
                last_err = Some(Error::provider(
                    provider,
                    format!("request to {url} failed: {e}"),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::provider(provider, "request failed after retries")))
}
