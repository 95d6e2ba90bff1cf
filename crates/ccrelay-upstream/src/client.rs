//! The upstream Messages call with the first-party-CLI header set and the
//! retry policy: one forced token refresh on 401, exponential backoff on
//! 429/529 and network failures.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use ccrelay_auth::authority::TokenAuthority;
use ccrelay_auth::AuthError;

use crate::{Result, UpstreamError};

pub const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages?beta=true";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BETA: &str =
    "oauth-2025-04-20,interleaved-thinking-2025-05-14,claude-code-20250219";
const USER_AGENT: &str = "claude-cli/2.1.2 (external, cli)";

/// Retries after the initial attempt for transient failures
/// (429/529/network), with 2 s / 4 s / 8 s backoff between them.
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct UpstreamClient {
    http: reqwest::Client,
    authority: Arc<TokenAuthority>,
    url: String,
}

impl UpstreamClient {
    pub fn new(authority: Arc<TokenAuthority>) -> Self {
        Self::with_url(authority, MESSAGES_URL.to_string())
    }

    pub fn with_url(authority: Arc<TokenAuthority>, url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            authority,
            url,
        }
    }

    /// POST a prepared (translated and decorated) body. Returns the raw
    /// response so streaming callers can consume the body incrementally.
    pub async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let mut retries: u32 = 0;
        let mut refreshed = false;

        loop {
            let token = self.access_token()?;
            let result = self
                .http
                .post(&self.url)
                .header("authorization", format!("Bearer {token}"))
                .header("anthropic-beta", ANTHROPIC_BETA)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("user-agent", USER_AGENT)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if retries >= MAX_RETRIES {
                        return Err(UpstreamError::Http(e));
                    }
                    retries += 1;
                    let delay = backoff(retries);
                    warn!(error = %e, retries, ?delay, "upstream network error, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = resp.status().as_u16();

            if status == 401 {
                // Lazy refresh: the 401 is the expiry signal. One refresh,
                // one retry; a second 401 surfaces to the caller.
                if !refreshed {
                    refreshed = true;
                    match self.authority.force_refresh().await {
                        Ok(_) => {
                            info!("access token refreshed after upstream 401");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "token refresh failed, surfacing 401");
                        }
                    }
                }
                let message = resp.text().await.unwrap_or_default();
                return Err(UpstreamError::Unauthorized { message });
            }

            if status == 429 || status == 529 {
                if retries >= MAX_RETRIES {
                    let message = resp.text().await.unwrap_or_default();
                    return Err(UpstreamError::Api { status, message });
                }
                retries += 1;
                let delay = retry_after(&resp).unwrap_or_else(|| backoff(retries));
                warn!(status, retries, ?delay, "upstream throttled, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            if !resp.status().is_success() {
                let message = resp.text().await.unwrap_or_default();
                warn!(status, body = %message, "upstream API error");
                return Err(UpstreamError::Api { status, message });
            }

            return Ok(resp);
        }
    }

    fn access_token(&self) -> Result<String> {
        self.authority.access_token().map_err(|e| match e {
            AuthError::NotAuthenticated => UpstreamError::NotAuthenticated,
            other => UpstreamError::Api {
                status: 500,
                message: other.to_string(),
            },
        })
    }
}

/// 2 s, 4 s, 8 s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(3))
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
