//! HTTP error responses
//!
//! Every failure leaves the gateway as `{"error": ..., "details": ...}`.
//! `details` carries the provider's body verbatim, parsed as JSON when it
//! is JSON. Errors that can only be fixed by logging in again also set
//! `"reauthorize": true`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors returned by gateway handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("session token required")]
    MissingSession,

    #[error("{0}")]
    BadRequest(String),

    /// A relay or auth failure, with a short description of what was attempted
    #[error("{context}: {source}")]
    Relay {
        context: &'static str,
        #[source]
        source: vat_relay::Error,
    },
}

impl ApiError {
    pub fn relay(context: &'static str, source: impl Into<vat_relay::Error>) -> Self {
        ApiError::Relay {
            context,
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingSession => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Relay { source, .. } => relay_status(source),
        }
    }

    fn reauthorize(&self) -> bool {
        match self {
            ApiError::MissingSession => true,
            ApiError::BadRequest(_) => false,
            ApiError::Relay { source, .. } => source.restart_authorization(),
        }
    }

    fn body(&self) -> serde_json::Value {
        let mut body = match self {
            ApiError::MissingSession | ApiError::BadRequest(_) => {
                serde_json::json!({ "error": self.to_string() })
            }
            ApiError::Relay { context, source } => {
                let details = match source.upstream_response() {
                    Some((_, provider_body)) => provider_details(provider_body),
                    None => serde_json::Value::String(source.to_string()),
                };
                serde_json::json!({ "error": context, "details": details })
            }
        };
        if self.reauthorize() {
            body["reauthorize"] = serde_json::Value::Bool(true);
        }
        body
    }
}

fn relay_status(error: &vat_relay::Error) -> StatusCode {
    use hmrc_auth::Error as Auth;
    use vat_relay::Error as Relay;

    match error {
        Relay::UnknownOperation(_) | Relay::Config(_) | Relay::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Relay::MissingParameter(_) | Relay::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        Relay::UpstreamAuthFailed { .. } => StatusCode::UNAUTHORIZED,
        Relay::UpstreamError { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Relay::UpstreamTimeout(_) | Relay::Auth(Auth::UpstreamTimeout(_)) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        Relay::Http(_) | Relay::Auth(Auth::Http(_) | Auth::TokenExchangeFailed { .. }) => {
            StatusCode::BAD_GATEWAY
        }
        Relay::Auth(Auth::ProviderDeniedAuthorization(_) | Auth::InvalidOrExpiredState) => {
            StatusCode::BAD_REQUEST
        }
        Relay::Auth(
            Auth::TamperedOrInvalidToken | Auth::SessionExpired | Auth::RefreshRejected { .. },
        ) => StatusCode::UNAUTHORIZED,
        Relay::Auth(Auth::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Relay::Auth(Auth::Encoding(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Provider body as JSON when it parses, otherwise as a string.
fn provider_details(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_owned()))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), axum::Json(self.body())).into_response()
    }
}
