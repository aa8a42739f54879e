//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The HMRC client secret and the session signing key are loaded from
//! `HMRC_CLIENT_SECRET` / `SESSION_SIGNING_KEY` or from files named in the
//! config, never stored in the TOML directly to avoid leaking secrets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use hmrc_auth::{Environment, ProviderConfig};
use serde::Deserialize;
use url::Url;

/// Minimum signing key length in bytes (HMAC-SHA256 block security).
pub const MIN_SIGNING_KEY_LEN: usize = 32;

const CLIENT_SECRET_ENV: &str = "HMRC_CLIENT_SECRET";
const SIGNING_KEY_ENV: &str = "SESSION_SIGNING_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub hmrc: HmrcConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Path template overrides keyed by operation name
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Where the OAuth callback sends the browser afterwards
    #[serde(default = "default_post_login_redirect")]
    pub post_login_redirect: String,
}

/// HMRC application registration and endpoints
#[derive(Debug, Deserialize)]
pub struct HmrcConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Overrides the environment's API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to HMRC_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Session and state lifetimes
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub state_ttl_secs: u64,
    pub refresh_margin_secs: u64,
    pub session_ttl_secs: u64,
    pub refresh_reuse_secs: u64,
    pub sweep_interval_secs: u64,
    #[serde(skip)]
    pub signing_key: Option<Secret<Vec<u8>>>,
    /// Path to a file containing the signing key (alternative to SESSION_SIGNING_KEY)
    pub signing_key_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: 600,
            refresh_margin_secs: 60,
            session_ttl_secs: 86_400,
            refresh_reuse_secs: 60,
            sweep_interval_secs: 60,
            signing_key: None,
            signing_key_file: None,
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_post_login_redirect() -> String {
    "/".into()
}

fn default_scope() -> String {
    hmrc_auth::config::DEFAULT_SCOPE.into()
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order, for both the client secret and signing key:
    /// 1. env var (`HMRC_CLIENT_SECRET`, `SESSION_SIGNING_KEY`)
    /// 2. `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.hmrc.api_base_url()?;
        config.hmrc.authorize_url()?;
        config.hmrc.token_url()?;

        if config.hmrc.client_id.trim().is_empty() {
            return Err(common::Error::Config("hmrc.client_id must not be empty".into()));
        }
        if config.hmrc.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        for (name, value) in [
            ("state_ttl_secs", config.session.state_ttl_secs),
            ("session_ttl_secs", config.session.session_ttl_secs),
            ("sweep_interval_secs", config.session.sweep_interval_secs),
            ("refresh_reuse_secs", config.session.refresh_reuse_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "session.{name} must be greater than 0"
                )));
            }
        }
        // Waiters queued behind a slow refresh must still find its result.
        if config.session.refresh_reuse_secs < config.hmrc.timeout_secs {
            return Err(common::Error::Config(format!(
                "session.refresh_reuse_secs ({}) must be at least hmrc.timeout_secs ({})",
                config.session.refresh_reuse_secs, config.hmrc.timeout_secs
            )));
        }

        let client_secret =
            resolve_secret(CLIENT_SECRET_ENV, config.hmrc.client_secret_file.as_deref())?
                .ok_or_else(|| {
                    common::Error::MissingSecret(format!(
                        "{CLIENT_SECRET_ENV} or hmrc.client_secret_file"
                    ))
                })?;
        config.hmrc.client_secret = Some(Secret::new(client_secret));

        let signing_key =
            resolve_secret(SIGNING_KEY_ENV, config.session.signing_key_file.as_deref())?
                .ok_or_else(|| {
                    common::Error::MissingSecret(format!(
                        "{SIGNING_KEY_ENV} or session.signing_key_file"
                    ))
                })?;
        if signing_key.len() < MIN_SIGNING_KEY_LEN {
            return Err(common::Error::Config(format!(
                "session signing key must be at least {MIN_SIGNING_KEY_LEN} bytes"
            )));
        }
        config.session.signing_key = Some(Secret::new(signing_key.into_bytes()));

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("vat-gateway.toml")
    }

    /// Provider settings for the authorization and token components.
    pub fn provider_config(&self) -> common::Result<ProviderConfig> {
        let client_secret = self
            .hmrc
            .client_secret
            .clone()
            .ok_or_else(|| common::Error::MissingSecret(CLIENT_SECRET_ENV.into()))?;
        Ok(ProviderConfig {
            authorize_url: self.hmrc.authorize_url()?,
            token_url: self.hmrc.token_url()?,
            client_id: self.hmrc.client_id.clone(),
            client_secret,
            redirect_uri: self.hmrc.redirect_uri.clone(),
            scope: self.hmrc.scope.clone(),
            timeout: Duration::from_secs(self.hmrc.timeout_secs),
        })
    }
}

impl HmrcConfig {
    pub fn api_base_url(&self) -> common::Result<Url> {
        http_url(
            "base_url",
            self.base_url
                .as_deref()
                .unwrap_or(self.environment.api_base_url()),
        )
    }

    pub fn authorize_url(&self) -> common::Result<Url> {
        http_url(
            "authorize_url",
            self.authorize_url
                .as_deref()
                .unwrap_or(self.environment.authorize_url()),
        )
    }

    pub fn token_url(&self) -> common::Result<Url> {
        http_url(
            "token_url",
            self.token_url
                .as_deref()
                .unwrap_or(self.environment.token_url()),
        )
    }
}

impl SessionConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn refresh_reuse(&self) -> Duration {
        Duration::from_secs(self.refresh_reuse_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn http_url(field: &str, value: &str) -> common::Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| common::Error::Config(format!("{field} is not a valid URL ({e}): {value}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(url)
}

/// Env var first, then file. Empty values count as unset.
fn resolve_secret(env: &str, file: Option<&Path>) -> common::Result<Option<String>> {
    if let Some(value) = std::env::var(env).ok().filter(|v| !v.trim().is_empty()) {
        return Ok(Some(value));
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let value = std::fs::read_to_string(file).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", file.display()))
    })?;
    let value = value.trim().to_owned();
    Ok((!value.is_empty()).then_some(value))
}
