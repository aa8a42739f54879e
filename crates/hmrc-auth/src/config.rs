//! HMRC OAuth endpoints and client configuration
//!
//! The client id, redirect URI and scope identify the registered application
//! and are safe to log. The client secret is only ever held in a `Secret`.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use url::Url;

/// Default scope for the VAT (MTD) API.
pub const DEFAULT_SCOPE: &str = "read:vat write:vat";

/// Media type HMRC uses for content negotiation on API version 1.0.
pub const HMRC_ACCEPT: &str = "application/vnd.hmrc.1.0+json";

/// Default lifetime of a pending authorization (state identifier).
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(600);

/// HMRC deployment the gateway talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    /// Base URL of the HMRC API for this environment.
    pub fn api_base_url(self) -> &'static str {
        match self {
            Environment::Sandbox => "https://test-api.service.hmrc.gov.uk",
            Environment::Production => "https://api.service.hmrc.gov.uk",
        }
    }

    /// Consent page the user is sent to.
    pub fn authorize_url(self) -> &'static str {
        match self {
            Environment::Sandbox => "https://test-api.service.hmrc.gov.uk/oauth/authorize",
            Environment::Production => "https://api.service.hmrc.gov.uk/oauth/authorize",
        }
    }

    /// Token endpoint for code exchange and refresh.
    pub fn token_url(self) -> &'static str {
        match self {
            Environment::Sandbox => "https://test-api.service.hmrc.gov.uk/oauth/token",
            Environment::Production => "https://api.service.hmrc.gov.uk/oauth/token",
        }
    }
}

/// Registered OAuth client settings passed to the initiator and token client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub authorize_url: Url,
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub scope: String,
    /// Upper bound for every call to the token endpoint.
    pub timeout: Duration,
}
