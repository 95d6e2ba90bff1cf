pub mod client;
pub mod sse;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("not authenticated")]
    NotAuthenticated,

    /// 401 that survived the forced refresh — the caller surfaces it.
    #[error("upstream rejected credentials: {message}")]
    Unauthorized { message: String },

    #[error("upstream API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("upstream HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
