//! OAuth token endpoint client
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (callback completion)
//! 2. Refresh-token grant (session refresh)
//!
//! Both POST a form-encoded body carrying the client credentials. Every call
//! carries the configured timeout, reported as `UpstreamTimeout`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. HMRC rotates
/// refresh tokens, but a refresh response without one keeps the prior value.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// Client for the provider's token endpoint.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    config: Arc<ProviderConfig>,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, config: Arc<ProviderConfig>) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Any failure, including a response without a refresh token, is
    /// reported as `TokenExchangeFailed` with the provider's status and body.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        let response = self
            .post(
                Grant::AuthorizationCode,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.expose().as_str()),
                    ("redirect_uri", self.config.redirect_uri.as_str()),
                ],
            )
            .await?;

        if response.refresh_token.is_none() {
            return Err(Error::TokenExchangeFailed {
                status: None,
                body: "token response is missing refresh_token".into(),
            });
        }
        Ok(response)
    }

    /// Obtain a new access token with a refresh token.
    ///
    /// 400/401/403 mean the refresh token was revoked, expired or already
    /// rotated out, and map to `RefreshRejected`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.post(
            Grant::RefreshToken,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose().as_str()),
            ],
        )
        .await
    }

    async fn post(&self, grant: Grant, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(form)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(grant, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(grant, e))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), ?grant, "token endpoint returned an error");
            return Err(match (grant, status.as_u16()) {
                (Grant::RefreshToken, code @ (400 | 401 | 403)) => {
                    Error::RefreshRejected { status: code, body }
                }
                (_, code) => Error::TokenExchangeFailed {
                    status: Some(code),
                    body,
                },
            });
        }

        serde_json::from_str::<TokenResponse>(&body).map_err(|e| Error::TokenExchangeFailed {
            status: Some(status.as_u16()),
            body: format!("invalid token response ({e}): {body}"),
        })
    }

    fn transport_error(&self, grant: Grant, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            return Error::UpstreamTimeout(self.config.timeout.as_secs());
        }
        match grant {
            Grant::AuthorizationCode => Error::TokenExchangeFailed {
                status: None,
                body: format!("token exchange request failed: {e}"),
            },
            Grant::RefreshToken => Error::Http(format!("token refresh request failed: {e}")),
        }
    }
}
