//! Test fixtures: an in-process HMRC stand-in serving both the token
//! endpoint and the VAT API

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use common::Secret;
use hmrc_auth::{Clock, ProviderConfig, SessionCodec, SessionToken};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use url::Url;

pub(crate) const NOW: u64 = 1_760_000_000_000;

pub(crate) const OBLIGATIONS_BODY: &str =
    r#"{"obligations":[{"periodKey":"18A1","start":"2024-01-01","end":"2024-03-31","status":"O"}]}"#;

pub(crate) const INVALID_CREDENTIALS_BODY: &str =
    r#"{"code":"INVALID_CREDENTIALS","message":"Invalid Authentication information provided"}"#;

/// Provider config whose endpoints live under `base`.
pub(crate) fn provider_config(base: &str) -> ProviderConfig {
    ProviderConfig {
        authorize_url: Url::parse(&format!("{base}/oauth/authorize")).unwrap(),
        token_url: Url::parse(&format!("{base}/oauth/token")).unwrap(),
        client_id: "client-abc".into(),
        client_secret: Secret::new("shh".into()),
        redirect_uri: "https://vat.example.com/api/auth/callback".into(),
        scope: "read:vat write:vat".into(),
        timeout: Duration::from_secs(5),
    }
}

pub(crate) fn signing_key() -> Secret<Vec<u8>> {
    Secret::new(vec![7u8; 32])
}

pub(crate) fn codec(clock: Arc<dyn Clock>) -> Arc<SessionCodec> {
    Arc::new(SessionCodec::new(
        signing_key(),
        Duration::from_secs(86_400),
        clock,
    ))
}

/// Session for GB123456789 holding `access`/`refresh`, expiring at `expires_at`.
pub(crate) fn session(access: &str, refresh: &str, expires_at: u64) -> SessionToken {
    SessionToken {
        account_ref: Some("GB123456789".into()),
        access_credential: access.into(),
        refresh_credential: refresh.into(),
        access_expires_at: expires_at,
        issued_at: NOW,
    }
}

/// A request the VAT API received.
#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) authorization: Option<String>,
    pub(crate) accept: Option<String>,
    pub(crate) body: String,
}

#[derive(Clone, Default)]
struct ProviderState {
    token_calls: Arc<AtomicUsize>,
    token_forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    refresh_status: Arc<AtomicU16>,
    refresh_delay_ms: Arc<AtomicU64>,
    omit_rotation: Arc<AtomicBool>,
    accepted: Arc<Mutex<HashSet<String>>>,
    reject_all: Arc<AtomicBool>,
    api_reply: Arc<Mutex<Option<(u16, String)>>>,
    api_delay_ms: Arc<AtomicU64>,
    api_completed: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

/// HMRC stand-in bound to an ephemeral localhost port.
///
/// The token endpoint mints `at_fresh_{n}` / `rt_fresh_{n}` on its n-th call
/// and the API accepts exactly the access credentials it has minted or been
/// told to accept. Anything else gets a 401 `INVALID_CREDENTIALS`.
pub(crate) struct MockProvider {
    pub(crate) url: String,
    state: ProviderState,
    _server: tokio::task::JoinHandle<()>,
}

impl MockProvider {
    pub(crate) async fn start() -> Self {
        let state = ProviderState::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new()
            .route("/oauth/token", axum::routing::post(token_handler))
            .fallback(api_handler)
            .with_state(state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url,
            state,
            _server: server,
        }
    }

    pub(crate) fn base_url(&self) -> Url {
        Url::parse(&self.url).unwrap()
    }

    pub(crate) async fn accept(&self, access: &str) {
        self.state.accepted.lock().await.insert(access.to_owned());
    }

    /// Reject every access credential, including freshly minted ones.
    pub(crate) fn reject_all_credentials(&self) {
        self.state.reject_all.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn reply_with(&self, status: u16, body: &str) {
        *self.state.api_reply.lock().await = Some((status, body.to_owned()));
    }

    pub(crate) fn delay_api(&self, delay: Duration) {
        self.state
            .api_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn reject_refresh(&self, status: u16) {
        self.state.refresh_status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn delay_refresh(&self, delay: Duration) {
        self.state
            .refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer refreshes without a `refresh_token` field.
    pub(crate) fn omit_rotation(&self) {
        self.state.omit_rotation.store(true, Ordering::SeqCst);
    }

    /// API requests whose handler ran to completion.
    pub(crate) fn api_completions(&self) -> usize {
        self.state.api_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn token_forms(&self) -> Vec<HashMap<String, String>> {
        self.state.token_forms.lock().await.clone()
    }

    pub(crate) async fn requests(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().await.clone()
    }

    pub(crate) async fn last_request(&self) -> SeenRequest {
        self.requests().await.pop().expect("no API request received")
    }
}

async fn token_handler(
    State(state): State<ProviderState>,
    axum::Form(form): axum::Form<HashMap<String, String>>,
) -> Response {
    let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    state.token_forms.lock().await.push(form);

    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let status = state.refresh_status.load(Ordering::SeqCst);
    if status != 0 {
        return (
            StatusCode::from_u16(status).unwrap(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            r#"{"error":"invalid_grant","error_description":"refresh token is invalid"}"#,
        )
            .into_response();
    }

    let access = format!("at_fresh_{n}");
    state.accepted.lock().await.insert(access.clone());
    let mut body = serde_json::json!({
        "access_token": access,
        "expires_in": 14_400,
        "token_type": "bearer",
        "scope": "read:vat write:vat",
    });
    if !state.omit_rotation.load(Ordering::SeqCst) {
        body["refresh_token"] = serde_json::Value::String(format!("rt_fresh_{n}"));
    }
    (StatusCode::OK, axum::Json(body)).into_response()
}

async fn api_handler(
    State(state): State<ProviderState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let header = |name: axum::http::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    let seen = SeenRequest {
        method,
        path: uri.path().to_owned(),
        query: uri.query().map(str::to_owned),
        authorization: header(axum::http::header::AUTHORIZATION),
        accept: header(axum::http::header::ACCEPT),
        body,
    };
    let bearer = seen
        .authorization
        .as_deref()
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned();
    let is_post = seen.method == Method::POST;
    state.seen.lock().await.push(seen);

    let delay = state.api_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    state.api_completed.fetch_add(1, Ordering::SeqCst);

    let accepted = !state.reject_all.load(Ordering::SeqCst)
        && state.accepted.lock().await.contains(&bearer);
    if !accepted {
        return (
            StatusCode::UNAUTHORIZED,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            INVALID_CREDENTIALS_BODY,
        )
            .into_response();
    }

    let (status, body) = match state.api_reply.lock().await.clone() {
        Some(reply) => reply,
        None if is_post => (201, r#"{"processingDate":"2024-05-01T10:00:00.000Z"}"#.into()),
        None => (200, OBLIGATIONS_BODY.into()),
    };
    (
        StatusCode::from_u16(status).unwrap(),
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
