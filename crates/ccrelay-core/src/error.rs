use thiserror::Error;

/// Error kinds the proxy distinguishes on the request path.
///
/// Each variant maps to a short client-facing code and an HTTP status.
/// Streaming handlers never surface these as HTTP errors once a stream is
/// open; they render the error inside the stream instead.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not authenticated — no credential on disk")]
    NotAuthenticated,

    #[error("OAuth refresh rejected: {0}")]
    RefreshFailed(String),

    #[error("upstream transient failure ({status}): {message}")]
    UpstreamTransient { status: u16, message: String },

    #[error("upstream error ({status}): {message}")]
    UpstreamFatal { status: u16, message: String },

    #[error("bad request: {field}: {message}")]
    BadRequest { field: String, message: String },

    #[error("request rejected: {reason}")]
    Throttled { reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Short error code string carried in client-facing error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotAuthenticated => "not_authenticated",
            RelayError::RefreshFailed(_) => "refresh_failed",
            RelayError::UpstreamTransient { .. } => "upstream_transient",
            RelayError::UpstreamFatal { .. } => "upstream_error",
            RelayError::BadRequest { .. } => "invalid_request_error",
            RelayError::Throttled { .. } => "throttled",
            RelayError::Cancelled => "cancelled",
            RelayError::Config(_) => "config_error",
            RelayError::Io(_) => "io_error",
            RelayError::Serialization(_) => "serialization_error",
        }
    }

    /// HTTP status for non-streaming error responses.
    pub fn status(&self) -> u16 {
        match self {
            RelayError::NotAuthenticated => 401,
            RelayError::RefreshFailed(_) => 401,
            RelayError::UpstreamTransient { status, .. } => *status,
            RelayError::UpstreamFatal { .. } => 500,
            RelayError::BadRequest { .. } => 400,
            RelayError::Throttled { .. } => 429,
            RelayError::Cancelled => 499,
            RelayError::Config(_) => 500,
            RelayError::Io(_) => 500,
            RelayError::Serialization(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
