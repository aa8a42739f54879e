//! Relay dispatch state machine
//!
//! Pure transition function plus the driver that performs the I/O each
//! action implies. One relay call walks
//!
//! ```text
//! Dispatch -> [PreemptiveRefresh] -> Send -> [RefreshAfterRejection -> Send] -> Done | Failed
//! ```
//!
//! `Send` remembers whether a refresh already happened during the call. A
//! credential rejection after any refresh, preemptive or not, fails the call,
//! so there is at most one refresh and at most two provider requests.

use std::sync::Arc;
use std::time::Duration;

use hmrc_auth::config::HMRC_ACCEPT;
use hmrc_auth::{Clock, IssuedSession, SessionToken};
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::{ResponseClass, classify_response};
use crate::endpoints::{ACCOUNT_PLACEHOLDER, EndpointRegistry, Params};
use crate::error::{Error, Result};
use crate::refresh::TokenRefresher;

/// States of a single relay call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Operation resolved, nothing sent yet
    Dispatch,
    /// Access credential expired before the first request
    PreemptiveRefresh,
    /// Request in flight
    Send { refreshed: bool },
    /// Provider rejected the credential, refreshing before the retry
    RefreshAfterRejection,
    Done,
    Failed,
}

/// Inputs that drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    Start { expired: bool },
    Refreshed,
    Response(ResponseClass),
}

/// How a relay call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Credential rejected again after a refresh
    AuthFailed,
    /// Any other non-2xx response
    Upstream,
}

/// Work the driver performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    Refresh,
    Send,
    Complete,
    Reject(Rejection),
    None,
}

/// Transition function. Pure: no I/O.
pub fn advance(state: RelayState, event: RelayEvent) -> (RelayState, RelayAction) {
    match (state, event) {
        // --- Dispatch ---
        (RelayState::Dispatch, RelayEvent::Start { expired: true }) => {
            (RelayState::PreemptiveRefresh, RelayAction::Refresh)
        }
        (RelayState::Dispatch, RelayEvent::Start { expired: false }) => {
            (RelayState::Send { refreshed: false }, RelayAction::Send)
        }

        // --- Refreshing ---
        (RelayState::PreemptiveRefresh | RelayState::RefreshAfterRejection, RelayEvent::Refreshed) => {
            (RelayState::Send { refreshed: true }, RelayAction::Send)
        }

        // --- Send ---
        (RelayState::Send { .. }, RelayEvent::Response(ResponseClass::Success)) => {
            (RelayState::Done, RelayAction::Complete)
        }
        (
            RelayState::Send { refreshed: false },
            RelayEvent::Response(ResponseClass::CredentialRejected),
        ) => (RelayState::RefreshAfterRejection, RelayAction::Refresh),
        (
            RelayState::Send { refreshed: true },
            RelayEvent::Response(ResponseClass::CredentialRejected),
        ) => (RelayState::Failed, RelayAction::Reject(Rejection::AuthFailed)),
        (RelayState::Send { .. }, RelayEvent::Response(ResponseClass::Failure)) => {
            (RelayState::Failed, RelayAction::Reject(Rejection::Upstream))
        }

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, RelayAction::None),
    }
}

/// Successful provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: String,
}

/// Result of a relay call plus any session minted along the way.
///
/// `refreshed` is set whenever a refresh succeeded, even if the call then
/// failed: the old session's refresh credential has been rotated out and the
/// client must switch to the new one.
#[derive(Debug)]
pub struct RelayOutcome {
    pub result: Result<RelayResponse>,
    pub refreshed: Option<IssuedSession>,
}

impl RelayOutcome {
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            result: Err(error),
            refreshed: None,
        }
    }
}

/// Forwards logical operations to the provider on behalf of a session.
pub struct RelayDispatcher {
    http: reqwest::Client,
    base_url: Url,
    registry: Arc<EndpointRegistry>,
    refresher: Arc<TokenRefresher>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    refresh_margin: Duration,
}

impl RelayDispatcher {
    /// `refresh_margin` treats a credential expiring that soon as already
    /// expired.
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        registry: Arc<EndpointRegistry>,
        refresher: Arc<TokenRefresher>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            registry,
            refresher,
            clock,
            timeout,
            refresh_margin,
        }
    }

    /// Relay `operation` for the account in `session`.
    ///
    /// The account reference always comes from the session; a caller-supplied
    /// `vrn` parameter is ignored. Template resolution happens before any
    /// provider call, so unknown operations and missing parameters never
    /// trigger a refresh.
    pub async fn dispatch(
        &self,
        operation: &str,
        params: &Params,
        payload: Option<&serde_json::Value>,
        session: SessionToken,
    ) -> RelayOutcome {
        let (method, url) = match self.resolve(operation, params, payload, &session) {
            Ok(resolved) => resolved,
            Err(e) => return RelayOutcome::failed(e),
        };

        let mut refreshed = None;
        let result = self
            .run(operation, &method, &url, payload, session, &mut refreshed)
            .await;
        RelayOutcome { result, refreshed }
    }

    fn resolve(
        &self,
        operation: &str,
        params: &Params,
        payload: Option<&serde_json::Value>,
        session: &SessionToken,
    ) -> Result<(Method, Url)> {
        let template = self.registry.get(operation)?;
        let mut resolved = params.clone();
        resolved.remove(ACCOUNT_PLACEHOLDER);
        if template.placeholders().any(|p| p == ACCOUNT_PLACEHOLDER) {
            let account = session
                .account_ref
                .as_deref()
                .ok_or_else(|| Error::MissingParameter(ACCOUNT_PLACEHOLDER.into()))?;
            resolved.insert(ACCOUNT_PLACEHOLDER.into(), account.to_owned());
        }
        if template.method == Method::POST && payload.is_none() {
            return Err(Error::MissingParameter("body".into()));
        }
        let url = template.resolve(&self.base_url, &resolved)?;
        Ok((template.method.clone(), url))
    }

    async fn run(
        &self,
        operation: &str,
        method: &Method,
        url: &Url,
        payload: Option<&serde_json::Value>,
        mut session: SessionToken,
        refreshed: &mut Option<IssuedSession>,
    ) -> Result<RelayResponse> {
        let expired = session.access_expired(self.clock.now_millis(), self.refresh_margin);
        let mut state = RelayState::Dispatch;
        let mut event = RelayEvent::Start { expired };
        let mut last_response: Option<(u16, String)> = None;

        loop {
            let (next, action) = advance(state, event);
            debug!(operation, from = ?state, to = ?next, ?action, "relay transition");
            state = next;

            event = match action {
                RelayAction::Refresh => {
                    let issued = self
                        .refresher
                        .refresh(&session)
                        .await
                        .map_err(token_transport_error)?;
                    session = issued.token.clone();
                    *refreshed = Some(issued);
                    RelayEvent::Refreshed
                }
                RelayAction::Send => {
                    let (status, challenge, body) = self
                        .send(method, url, payload, &session.access_credential)
                        .await?;
                    let class = classify_response(status, challenge.as_deref(), &body);
                    debug!(operation, status, ?class, "provider responded");
                    last_response = Some((status, body));
                    RelayEvent::Response(class)
                }
                RelayAction::Complete => {
                    let (status, body) = take_response(&mut last_response, state)?;
                    return Ok(RelayResponse { status, body });
                }
                RelayAction::Reject(rejection) => {
                    let (status, body) = take_response(&mut last_response, state)?;
                    return Err(match rejection {
                        Rejection::AuthFailed => {
                            warn!(operation, status, "credential rejected after refresh");
                            record_upstream_error("auth_failed");
                            Error::UpstreamAuthFailed { status, body }
                        }
                        Rejection::Upstream => {
                            info!(operation, status, "provider returned an error");
                            record_upstream_error("status");
                            Error::UpstreamError { status, body }
                        }
                    });
                }
                RelayAction::None => {
                    return Err(Error::Internal(format!(
                        "relay stalled in state {state:?} on event {event:?}"
                    )));
                }
            };
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        payload: Option<&serde_json::Value>,
        access_credential: &str,
    ) -> Result<(u16, Option<String>, String)> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(access_credential)
            .header(ACCEPT, HMRC_ACCEPT)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout);
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        // Detached so a dropped caller cannot cut a submission off mid-flight.
        let exchange = tokio::spawn(async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, challenge, body))
        });
        exchange
            .await
            .map_err(|e| Error::Internal(format!("provider exchange task failed: {e}")))?
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            record_upstream_error("timeout");
            Error::UpstreamTimeout(self.timeout.as_secs())
        } else {
            record_upstream_error("connection");
            Error::Http(format!("provider request failed: {e}"))
        }
    }
}

/// Token endpoint transport failures surface as the relay's own kinds.
fn token_transport_error(e: Error) -> Error {
    match e {
        Error::Auth(hmrc_auth::Error::UpstreamTimeout(secs)) => Error::UpstreamTimeout(secs),
        Error::Auth(hmrc_auth::Error::Http(msg)) => Error::Http(msg),
        other => other,
    }
}

fn take_response(last: &mut Option<(u16, String)>, state: RelayState) -> Result<(u16, String)> {
    last.take()
        .ok_or_else(|| Error::Internal(format!("no provider response in state {state:?}")))
}

fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("relay_upstream_errors_total", "error_type" => error_type).increment(1);
}
