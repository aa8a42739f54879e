//! Classification of provider responses
//!
//! The relay only refreshes on a 401 that points at the access credential
//! itself. HMRC reports those as `INVALID_CREDENTIALS` or with an OAuth
//! `invalid_token` challenge; a bare 401 with no body is treated the same.
//! Any other 401 (for example a client-not-subscribed error) and every other
//! non-2xx status is passed through untouched.

/// Patterns that mark a 401 as an expired or invalid access credential.
const CREDENTIAL_PATTERNS: &[&str] = &[
    "invalid_credentials",
    "invalid_token",
    "expired",
    "invalid bearer token",
];

/// What the relay should do with a provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx, returned to the caller.
    Success,
    /// The access credential was rejected; a refresh may help.
    CredentialRejected,
    /// Any other failure, passed through as `UpstreamError`.
    Failure,
}

/// Classify a provider response by status, `WWW-Authenticate` header and body.
pub fn classify_response(status: u16, www_authenticate: Option<&str>, body: &str) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 if credential_rejection(www_authenticate, body) => ResponseClass::CredentialRejected,
        _ => ResponseClass::Failure,
    }
}

fn credential_rejection(www_authenticate: Option<&str>, body: &str) -> bool {
    if body.trim().is_empty() {
        return true;
    }
    let header = www_authenticate.unwrap_or_default().to_lowercase();
    let body = body.to_lowercase();
    CREDENTIAL_PATTERNS
        .iter()
        .any(|p| header.contains(p) || body.contains(p))
}
