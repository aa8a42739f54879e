//! Error types for authorization and session operations

/// Errors from authorization, token endpoint and session codec operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("provider denied authorization: {0}")]
    ProviderDeniedAuthorization(String),

    #[error("invalid or expired state")]
    InvalidOrExpiredState,

    #[error("token exchange failed (status {status:?}): {body}")]
    TokenExchangeFailed { status: Option<u16>, body: String },

    #[error("refresh credential rejected (status {status}): {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("session token is tampered or invalid")]
    TamperedOrInvalidToken,

    #[error("session token has outlived its maximum lifetime")]
    SessionExpired,

    #[error("token endpoint timed out after {0}s")]
    UpstreamTimeout(u64),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("session encoding failed: {0}")]
    Encoding(String),
}

impl Error {
    /// Whether the client has to start a new authorization flow to recover.
    pub fn restart_authorization(&self) -> bool {
        matches!(
            self,
            Error::ProviderDeniedAuthorization(_)
                | Error::InvalidOrExpiredState
                | Error::RefreshRejected { .. }
                | Error::TamperedOrInvalidToken
                | Error::SessionExpired
        )
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
