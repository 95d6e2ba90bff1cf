//! Anthropic OAuth wire: the token endpoint (refresh and
//! authorization-code grants) and the PKCE login URL the external flow
//! starts from.

use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::CredentialRecord;
use crate::{AuthError, Result};

pub const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
/// Console-hosted alternative to [`AUTHORIZE_URL`]; both accept the same
/// client id and PKCE parameters.
pub const AUTHORIZE_URL_CONSOLE: &str = "https://console.anthropic.com/oauth/authorize";
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
pub const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Fallback when the token response omits `expires_in` (1 hour).
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// A PKCE verifier/challenge pair (S256).
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a fresh PKCE pair from system randomness.
pub fn pkce_pair() -> Result<PkcePair> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes).map_err(|_| AuthError::Pkce)?;
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let challenge =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    Ok(PkcePair {
        verifier,
        challenge,
    })
}

/// Build the authorization URL the user opens in a browser. The callback
/// page displays a code the user pastes back into the login flow.
pub fn authorize_url(pkce: &PkcePair) -> String {
    format!(
        "{AUTHORIZE_URL}?code=true&client_id={CLIENT_ID}&response_type=code\
         &redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        urlencoding::encode(REDIRECT_URI),
        urlencoding::encode(SCOPES),
        pkce.challenge,
        pkce.verifier,
    )
}

pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
}

impl Default for OAuthClient {
    fn default() -> Self {
        Self::new(TOKEN_URL.to_string())
    }
}

impl OAuthClient {
    pub fn new(token_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url,
        }
    }

    /// Exchange a refresh token for a fresh credential triple.
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialRecord> {
        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": CLIENT_ID,
            "refresh_token": refresh_token,
        });
        self.grant(payload, refresh_token).await
    }

    /// Exchange a pasted authorization code (the login flow). The callback
    /// page renders the code as `code#state`; accept either form.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<CredentialRecord> {
        let (code, state) = match code.split_once('#') {
            Some((c, s)) => (c, Some(s)),
            None => (code, None),
        };
        let mut payload = serde_json::json!({
            "grant_type": "authorization_code",
            "client_id": CLIENT_ID,
            "code": code,
            "redirect_uri": REDIRECT_URI,
            "code_verifier": verifier,
        });
        if let Some(state) = state {
            payload["state"] = serde_json::Value::String(state.to_string());
        }
        self.grant(payload, "").await
    }

    async fn grant(
        &self,
        payload: serde_json::Value,
        fallback_refresh: &str,
    ) -> Result<CredentialRecord> {
        let resp = self
            .http
            .post(&self.token_url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected(format!("HTTP {status}: {body}")));
        }

        let token: TokenResponse = resp.json().await?;
        debug!(expires_in = token.expires_in, "OAuth grant succeeded");

        let now_ms = chrono::Utc::now().timestamp_millis();
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(CredentialRecord {
            access: token.access_token,
            refresh: token
                .refresh_token
                .unwrap_or_else(|| fallback_refresh.to_string()),
            expires_at: now_ms + (expires_in as i64) * 1000,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}
