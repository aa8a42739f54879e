//! Test fixtures: provider config and an in-process token endpoint

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::Secret;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use url::Url;

use crate::config::ProviderConfig;

pub(crate) fn test_config() -> ProviderConfig {
    config_for("https://test-api.service.hmrc.gov.uk")
}

/// Provider config whose endpoints live under `base`.
pub(crate) fn config_for(base: &str) -> ProviderConfig {
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

/// Scripted reply from the mock token endpoint.
#[derive(Clone)]
pub(crate) enum TokenReply {
    Tokens {
        access: String,
        refresh: Option<String>,
        expires_in: u64,
    },
    Error {
        status: u16,
        body: String,
    },
    Delayed(Duration),
}

impl TokenReply {
    pub(crate) fn tokens(access: &str, refresh: Option<&str>, expires_in: u64) -> Self {
        TokenReply::Tokens {
            access: access.into(),
            refresh: refresh.map(str::to_owned),
            expires_in,
        }
    }

    pub(crate) fn error(status: u16, body: &str) -> Self {
        TokenReply::Error {
            status,
            body: body.into(),
        }
    }
}

#[derive(Clone)]
struct EndpointState {
    replies: Arc<Mutex<VecDeque<TokenReply>>>,
    forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    calls: Arc<AtomicUsize>,
}

/// Token endpoint bound to an ephemeral localhost port.
///
/// Replies are consumed in order; the last one repeats.
pub(crate) struct MockTokenEndpoint {
    pub(crate) url: String,
    state: EndpointState,
    _server: tokio::task::JoinHandle<()>,
}

impl MockTokenEndpoint {
    pub(crate) async fn start(replies: Vec<TokenReply>) -> Self {
        let state = EndpointState {
            replies: Arc::new(Mutex::new(replies.into())),
            forms: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = axum::Router::new()
            .route("/oauth/token", axum::routing::post(token_handler))
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

    pub(crate) fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn last_form(&self) -> Option<HashMap<String, String>> {
        self.state.forms.lock().await.last().cloned()
    }
}

async fn token_handler(
    State(state): State<EndpointState>,
    axum::Form(form): axum::Form<HashMap<String, String>>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    state.forms.lock().await.push(form);

    let reply = {
        let mut replies = state.replies.lock().await;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    };

    match reply {
        Some(TokenReply::Tokens {
            access,
            refresh,
            expires_in,
        }) => {
            let mut body = serde_json::json!({
                "access_token": access,
                "expires_in": expires_in,
                "token_type": "bearer",
            });
            if let Some(refresh) = refresh {
                body["refresh_token"] = serde_json::Value::String(refresh);
            }
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Some(TokenReply::Error { status, body }) => (
            StatusCode::from_u16(status).unwrap(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Some(TokenReply::Delayed(delay)) => {
            tokio::time::sleep(delay).await;
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({
                    "access_token": "at_late",
                    "refresh_token": "rt_late",
                    "expires_in": 3600,
                })),
            )
                .into_response()
        }
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
