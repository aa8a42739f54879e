//! In-process HMRC stand-in for router tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub(crate) const OBLIGATIONS_BODY: &str =
    r#"{"obligations":[{"periodKey":"18A1","start":"2024-01-01","end":"2024-03-31","status":"O"}]}"#;

#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) authorization: Option<String>,
    pub(crate) body: String,
}

#[derive(Clone)]
struct HmrcState {
    token_calls: Arc<AtomicUsize>,
    expires_in: Arc<AtomicU64>,
    fail_tokens: Arc<AtomicBool>,
    accepted: Arc<Mutex<HashSet<String>>>,
    api_reply: Arc<Mutex<Option<(u16, String)>>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

/// Token endpoint at `/oauth/token` minting `at_{n}` / `rt_{n}`, plus a VAT
/// API that accepts only minted access credentials.
pub(crate) struct MockHmrc {
    pub(crate) url: String,
    state: HmrcState,
    _server: tokio::task::JoinHandle<()>,
}

impl MockHmrc {
    pub(crate) async fn start() -> Self {
        let state = HmrcState {
            token_calls: Arc::new(AtomicUsize::new(0)),
            expires_in: Arc::new(AtomicU64::new(14_400)),
            fail_tokens: Arc::new(AtomicBool::new(false)),
            accepted: Arc::default(),
            api_reply: Arc::default(),
            seen: Arc::default(),
        };
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

    /// Lifetime, in seconds, of access credentials minted from now on.
    pub(crate) fn set_expires_in(&self, secs: u64) {
        self.state.expires_in.store(secs, Ordering::SeqCst);
    }

    pub(crate) fn fail_token_requests(&self) {
        self.state.fail_tokens.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn reply_with(&self, status: u16, body: &str) {
        *self.state.api_reply.lock().await = Some((status, body.to_owned()));
    }

    pub(crate) fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn requests(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().await.clone()
    }
}

async fn token_handler(
    State(state): State<HmrcState>,
    axum::Form(_form): axum::Form<HashMap<String, String>>,
) -> Response {
    let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if state.fail_tokens.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "invalid_grant" })),
        )
            .into_response();
    }

    let access = format!("at_{n}");
    state.accepted.lock().await.insert(access.clone());
    axum::Json(serde_json::json!({
        "access_token": access,
        "refresh_token": format!("rt_{n}"),
        "expires_in": state.expires_in.load(Ordering::SeqCst),
        "token_type": "bearer",
    }))
    .into_response()
}

async fn api_handler(
    State(state): State<HmrcState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let bearer = authorization
        .as_deref()
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned();
    state.seen.lock().await.push(SeenRequest {
        path: uri.path().to_owned(),
        query: uri.query().map(str::to_owned),
        authorization,
        body,
    });

    if !state.accepted.lock().await.contains(&bearer) {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "code": "INVALID_CREDENTIALS",
                "message": "Invalid Authentication information provided",
            })),
        )
            .into_response();
    }

    let (status, body) = state
        .api_reply
        .lock()
        .await
        .clone()
        .unwrap_or_else(|| (200, OBLIGATIONS_BODY.to_owned()));
    (
        StatusCode::from_u16(status).unwrap(),
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
