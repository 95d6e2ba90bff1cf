pub mod authority;
pub mod oauth;
pub mod store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authenticated — run `ccrelay login` first")]
    NotAuthenticated,

    #[error("token refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("OAuth HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("credential parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("PKCE generation failed")]
    Pkce,
}

pub type Result<T> = std::result::Result<T, AuthError>;
