//! HTTP handlers for the authorization flow and the VAT operations
//!
//! `/api/auth/*` drives the broker's login, callback, refresh and
//! introspection operations. `/api/vat/*` maps each route onto a relay
//! operation, taking the session from `Authorization: Bearer <token>`.
//! Whenever the relay mints a new session the response carries it in
//! `x-session-token`, on failures too, since the old one can no longer
//! be refreshed.

use std::collections::HashMap;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{info, warn};
use vat_relay::{Params, RelayOutcome};

use crate::AppState;
use crate::error::ApiError;

pub const SESSION_HEADER: &str = "x-session-token";

/// Fields a VAT return must carry before it is sent to HMRC.
const RETURN_FIELDS: &[&str] = &[
    "periodKey",
    "vatDueSales",
    "vatDueAcquisitions",
    "totalVatDue",
    "vatReclaimedCurrPeriod",
    "netVatDue",
    "totalValueSalesExVAT",
    "totalValuePurchasesExVAT",
    "totalValueGoodsSuppliedExVAT",
    "totalAcquisitionsExVAT",
    "finalised",
];

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/login", get(login))
        .route("/api/auth/callback", get(callback))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/me", get(me))
        .route("/api/vat/obligations", get(obligations))
        .route("/api/vat/returns", post(submit_return))
        .route("/api/vat/returns/{periodKey}", get(view_return))
        .route("/api/vat/liabilities", get(liabilities))
        .route("/api/vat/payments", get(payments))
        .route("/api/vat/penalties", get(penalties))
        .route(
            "/api/vat/financial-details/{chargeReference}",
            get(financial_details),
        )
}

// --- auth ---

#[derive(Debug, Deserialize)]
struct LoginQuery {
    vrn: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, ApiError> {
    let request = state
        .broker
        .initiate_authorization(query.vrn.as_deref())
        .await
        .map_err(|e| ApiError::relay("failed to start authorization", e))?;
    Ok(Json(serde_json::json!({
        "authUrl": request.authorization_url,
        "state": request.state_id,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let result = state
        .broker
        .complete_authorization(
            query.code.as_deref().unwrap_or_default(),
            query.state.as_deref().unwrap_or_default(),
            query.error.as_deref(),
        )
        .await;

    match result {
        Ok(issued) => Ok(Redirect::to(&post_login_location(
            &state.post_login_redirect,
            &[("token", issued.encoded.as_str()), ("status", "success")],
        ))
        .into_response()),
        Err(
            e @ vat_relay::Error::Auth(
                hmrc_auth::Error::ProviderDeniedAuthorization(_)
                | hmrc_auth::Error::InvalidOrExpiredState,
            ),
        ) => Err(ApiError::relay("authorization rejected", e)),
        Err(e) => {
            warn!(error = %e, "authorization callback failed");
            Ok(Redirect::to(&post_login_location(
                &state.post_login_redirect,
                &[("status", "error"), ("message", "Authentication failed")],
            ))
            .into_response())
        }
    }
}

fn post_login_location(base: &str, pairs: &[(&str, &str)]) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    token: Option<String>,
}

async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Response, ApiError> {
    let token = request
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or(ApiError::MissingSession)?;
    let issued = state
        .broker
        .refresh_session(&token)
        .await
        .map_err(|e| ApiError::relay("token refresh failed", e))?;
    Ok(Json(serde_json::json!({ "token": issued.encoded })).into_response())
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let session = bearer_token(&headers)?;
    let summary = state
        .broker
        .describe_session(session)
        .map_err(|e| ApiError::relay("invalid session", e))?;
    Ok(Json(serde_json::json!({
        "vrn": summary.account_ref,
        "expiresAt": summary.access_expires_at,
        "expired": summary.expired,
        "authenticated": true,
    }))
    .into_response())
}

/// Session token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::MissingSession)
}

// --- vat ---

/// Copy the named, non-blank query values into relay parameters.
fn pick(query: &HashMap<String, String>, names: &[&str]) -> Params {
    names
        .iter()
        .filter_map(|name| {
            query
                .get(*name)
                .filter(|v| !v.is_empty())
                .map(|v| ((*name).to_owned(), v.clone()))
        })
        .collect()
}

async fn obligations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = pick(&query, &["from", "to", "status"]);
    relay(&state, &headers, "obligations", params, None, "failed to fetch VAT obligations").await
}

async fn submit_return(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(vat_return): Json<serde_json::Value>,
) -> Response {
    if let Err(e) = bearer_token(&headers) {
        return e.into_response();
    }
    if let Some(field) = RETURN_FIELDS
        .iter()
        .find(|field| vat_return.get(**field).is_none_or(serde_json::Value::is_null))
    {
        return ApiError::BadRequest(format!("Missing required field: {field}")).into_response();
    }

    let mut response = relay(
        &state,
        &headers,
        "submitReturn",
        Params::new(),
        Some(&vat_return),
        "failed to submit VAT return",
    )
    .await;
    if response.status().is_success() {
        *response.status_mut() = StatusCode::CREATED;
    }
    response
}

async fn view_return(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(period_key): Path<String>,
) -> Response {
    let params = Params::from([("periodKey".to_owned(), period_key)]);
    relay(&state, &headers, "viewReturn", params, None, "failed to fetch VAT return").await
}

async fn liabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = pick(&query, &["from", "to"]);
    relay(&state, &headers, "liabilities", params, None, "failed to fetch VAT liabilities").await
}

async fn payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = pick(&query, &["from", "to"]);
    relay(&state, &headers, "payments", params, None, "failed to fetch VAT payments").await
}

async fn penalties(State(state): State<AppState>, headers: HeaderMap) -> Response {
    relay(
        &state,
        &headers,
        "penalties",
        Params::new(),
        None,
        "failed to fetch VAT penalties",
    )
    .await
}

async fn financial_details(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(charge_reference): Path<String>,
) -> Response {
    let params = Params::from([("penaltyChargeReference".to_owned(), charge_reference)]);
    relay(
        &state,
        &headers,
        "financialDetails",
        params,
        None,
        "failed to fetch financial details",
    )
    .await
}

/// Dispatch one operation and turn the outcome into a response.
///
/// The provider's status and body are passed through unchanged on success.
async fn relay(
    state: &AppState,
    headers: &HeaderMap,
    operation: &'static str,
    params: Params,
    payload: Option<&serde_json::Value>,
    context: &'static str,
) -> Response {
    let session = match bearer_token(headers) {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let RelayOutcome { result, refreshed } = state
        .broker
        .dispatch(operation, &params, payload, session)
        .await;

    let mut response = match result {
        Ok(reply) => {
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                reply.body,
            )
                .into_response()
        }
        Err(e) => {
            warn!(operation, error = %e, "VAT operation failed");
            ApiError::relay(context, e).into_response()
        }
    };

    if let Some(issued) = refreshed {
        match HeaderValue::from_str(&issued.encoded) {
            Ok(value) => {
                info!(operation, "returning refreshed session");
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            Err(e) => warn!(operation, error = %e, "refreshed session is not a valid header value"),
        }
    }
    response
}
