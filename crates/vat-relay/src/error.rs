//! Error types for relay operations

/// Errors from relay and broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid value for parameter: {0}")]
    InvalidParameter(String),

    #[error("provider rejected the access credential after refresh ({status}): {body}")]
    UpstreamAuthFailed { status: u16, body: String },

    #[error("provider returned {status}: {body}")]
    UpstreamError { status: u16, body: String },

    #[error("provider timed out after {0}s")]
    UpstreamTimeout(u64),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("endpoint configuration error: {0}")]
    Config(String),

    #[error("internal relay error: {0}")]
    Internal(String),

    #[error(transparent)]
    Auth(#[from] hmrc_auth::Error),
}

impl Error {
    /// Whether the client has to start a new authorization flow to recover.
    pub fn restart_authorization(&self) -> bool {
        match self {
            Error::Auth(inner) => inner.restart_authorization(),
            _ => false,
        }
    }

    /// Provider status and body, when the failure came from a provider response.
    pub fn upstream_response(&self) -> Option<(u16, &str)> {
        match self {
            Error::UpstreamAuthFailed { status, body } | Error::UpstreamError { status, body } => {
                Some((*status, body.as_str()))
            }
            Error::Auth(hmrc_auth::Error::RefreshRejected { status, body }) => {
                Some((*status, body.as_str()))
            }
            Error::Auth(hmrc_auth::Error::TokenExchangeFailed {
                status: Some(status),
                body,
            }) => Some((*status, body.as_str())),
            _ => None,
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;
