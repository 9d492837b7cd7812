//! JSON HTTP API: `GET {prefix}/info` and `POST {prefix}/claim`.
//!
//! Route composition, CORS and `X-Forwarded-For` handling live in
//! [`crate::run`]; this module only holds the request/response shapes and
//! the handlers that turn a [`ClaimError`] into the matching one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use faucet_core::{Alerter, Bank, ClaimError, Faucet, FaucetDb};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Per-deployment HTTP concerns that sit alongside the faucet itself:
/// whether to trust `X-Forwarded-For` when recovering the caller's address.
pub struct AppState<B, D, A> {
    pub faucet: Arc<Faucet<B, D, A>>,
    pub use_fwd_addr: bool,
}

// Written by hand rather than derived: `#[derive(Clone)]` would require
// `B`, `D`, `A` themselves to be `Clone`, which none of the concrete
// collaborators are (nor need to be) — only the `Arc` around them is.
impl<B, D, A> Clone for AppState<B, D, A> {
    fn clone(&self) -> Self {
        AppState {
            faucet: self.faucet.clone(),
            use_fwd_addr: self.use_fwd_addr,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ClaimRequest {
    #[serde(default)]
    pub recipient: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimSucceeded {
    pub amount: f64,
    pub txid: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimRejected {
    #[serde(rename = "rejectReason")]
    pub reject_reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct Info {
    #[serde(rename = "addressVersions", skip_serializing_if = "Option::is_none")]
    pub address_versions: Option<Vec<u32>>,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RequestError {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct InvalidRequest {
    #[serde(rename = "requestErrors")]
    pub request_errors: Vec<RequestError>,
}

#[derive(Debug, Serialize)]
pub struct RequestFailed {
    pub error: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ServiceUnavailable {
    pub error: &'static str,
}

/// Maps a [`ClaimError`] to the matching JSON body and status code,
/// logging the underlying cause for variants that don't expose it to the
/// client (a wallet failure or an internal error is never detailed in the
/// response body, only in the logs).
fn error_response(context: &str, err: ClaimError) -> Response {
    match err {
        ClaimError::Send(e) => {
            tracing::error!(error = %e, context, "failed to send coins");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(RequestFailed { error: "FailedToSend" })).into_response()
        }
        ClaimError::MustWait(until) => {
            let rounded = round_to_second(until);
            (
                StatusCode::FORBIDDEN,
                Json(ClaimRejected { reject_reason: "MustWait", wait: Some(rounded) }),
            )
                .into_response()
        }
        ClaimError::ServiceUnavailable(e) => {
            tracing::error!(error = %e, context, "service unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ServiceUnavailable { error: "ServiceUnavailable" }),
            )
                .into_response()
        }
        ClaimError::InvalidToken => (
            StatusCode::FORBIDDEN,
            Json(ClaimRejected { reject_reason: "InvalidToken", wait: None }),
        )
            .into_response(),
        ClaimError::InvalidRecipient => (
            StatusCode::BAD_REQUEST,
            Json(InvalidRequest {
                request_errors: vec![RequestError { error: "InvalidValue", parameter: Some("recipient") }],
            }),
        )
            .into_response(),
        ClaimError::Paused => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ServiceUnavailable { error: "ServicePaused" }),
        )
            .into_response(),
        ClaimError::NoFunds => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ServiceUnavailable { error: "NoFunds" }),
        )
            .into_response(),
        ClaimError::InvalidClientAddress(e) => {
            tracing::error!(error = %e, context, "could not parse caller address");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(RequestFailed { error: "InternalError" })).into_response()
        }
        ClaimError::Cancelled => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(ServiceUnavailable { error: "Cancelled" })).into_response()
        }
    }
}

fn round_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = t.timestamp_subsec_nanos();
    let rounded = t - chrono::Duration::nanoseconds(nanos as i64);
    if nanos >= 500_000_000 {
        rounded + chrono::Duration::seconds(1)
    } else {
        rounded
    }
}

fn effective_client_addr(
    use_fwd_addr: bool,
    headers: &HeaderMap,
    connect_info: SocketAddr,
) -> String {
    if use_fwd_addr {
        if let Some(v) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            let mut last = None;
            for part in v.split(',') {
                let part = part.trim();
                if !part.is_empty() {
                    last = Some(part.to_string());
                }
            }
            if let Some(addr) = last {
                return addr;
            }
        }
    }
    connect_info.to_string()
}

pub fn routes<B, D, A>() -> Router<AppState<B, D, A>>
where
    B: Bank + 'static,
    D: FaucetDb + 'static,
    A: Alerter + 'static,
{
    Router::new()
        .route(
            "/info",
            get(get_info::<B, D, A>).options(|| async { options_response("GET,OPTIONS") }),
        )
        .route(
            "/claim",
            post(post_claim::<B, D, A>).options(|| async { options_response("OPTIONS,POST") }),
        )
}

fn options_response(allow: &'static str) -> Response {
    let mut res = StatusCode::OK.into_response();
    res.headers_mut()
        .insert("Allow", allow.parse().expect("static Allow header value"));
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn round_to_second_rounds_half_up() {
        let t = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.499Z").unwrap().with_timezone(&Utc);
        assert_eq!(round_to_second(t).timestamp_subsec_nanos(), 0);
        assert_eq!(round_to_second(t).timestamp(), t.timestamp());

        let t = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        assert_eq!(round_to_second(t).timestamp(), t.timestamp() + 1);
    }

    #[test]
    fn effective_client_addr_ignores_forwarded_header_when_disabled() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("203.0.113.9"));
        let connect: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(effective_client_addr(false, &headers, connect), connect.to_string());
    }

    #[test]
    fn effective_client_addr_takes_the_last_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("203.0.113.9, 198.51.100.2"));
        let connect: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(effective_client_addr(true, &headers, connect), "198.51.100.2");
    }

    #[test]
    fn effective_client_addr_falls_back_without_a_forwarded_header() {
        let headers = HeaderMap::new();
        let connect: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(effective_client_addr(true, &headers, connect), connect.to_string());
    }

    #[test]
    fn must_wait_maps_to_403_with_rounded_wait() {
        let until = Utc::now();
        let res = error_response("claim", ClaimError::MustWait(until));
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn no_funds_maps_to_503() {
        let res = error_response("claim", ClaimError::NoFunds);
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn invalid_recipient_maps_to_400() {
        let res = error_response("claim", ClaimError::InvalidRecipient);
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}

#[instrument(skip_all)]
pub async fn get_info<B, D, A>(
    State(state): State<AppState<B, D, A>>,
    ConnectInfo(connect_info): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response
where
    B: Bank,
    D: FaucetDb,
    A: Alerter,
{
    let client = effective_client_addr(state.use_fwd_addr, &headers, connect_info);

    // A fresh token per request; nothing outside this handler trips it
    // today (axum/hyper don't surface client-disconnect as a token we can
    // forward), but the faucet and its collaborators honor it end to end.
    let cancel = CancellationToken::new();
    let amount = match state.faucet.amount(&cancel).await {
        Ok(a) => a,
        Err(e) => return error_response("failed to get giveaway amount", e),
    };
    let token = match state.faucet.token(&client) {
        Ok(t) => t,
        Err(e) => return error_response("failed to generate token", e.into()),
    };
    let wait = match state.faucet.wait_time(&client) {
        Ok(w) => w,
        Err(e) => return error_response("failed to get wait time", e.into()),
    };

    let address_versions = state.faucet.address_versions();
    let info = Info {
        address_versions: if address_versions.is_empty() {
            None
        } else {
            Some(address_versions.to_vec())
        },
        amount,
        token,
        wait: wait.map(round_to_second),
    };
    let mut res = (StatusCode::OK, Json(info)).into_response();
    res.headers_mut()
        .insert("Allow", "GET,OPTIONS".parse().expect("static Allow header value"));
    res
}

#[instrument(skip_all)]
pub async fn post_claim<B, D, A>(
    State(state): State<AppState<B, D, A>>,
    ConnectInfo(connect_info): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    B: Bank,
    D: FaucetDb,
    A: Alerter,
{
    let client = effective_client_addr(state.use_fwd_addr, &headers, connect_info);

    if let Some(ct) = headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        let mime = ct.split(';').next().unwrap_or("").trim();
        if !mime.is_empty() && mime != "application/json" {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Request media type must be application/json",
            )
                .into_response();
        }
    }

    let request: ClaimRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            use serde_json::error::Category;
            let res = match e.classify() {
                Category::Syntax | Category::Eof => InvalidRequest {
                    request_errors: vec![RequestError { error: "InvalidFormat", parameter: None }],
                },
                Category::Data => InvalidRequest {
                    request_errors: vec![RequestError { error: "InvalidValue", parameter: None }],
                },
                Category::Io => {
                    tracing::error!(error = %e, "failed to receive /claim POST request body");
                    let mut res = (StatusCode::INTERNAL_SERVER_ERROR, Json(RequestFailed { error: "InternalError" }))
                        .into_response();
                    res.headers_mut()
                        .insert("Allow", "OPTIONS,POST".parse().expect("static Allow header value"));
                    return res;
                }
            };
            let mut response = (StatusCode::BAD_REQUEST, Json(res)).into_response();
            response
                .headers_mut()
                .insert("Allow", "OPTIONS,POST".parse().expect("static Allow header value"));
            return response;
        }
    };

    let mut res = if request.recipient.is_empty() {
        (
            StatusCode::BAD_REQUEST,
            Json(InvalidRequest {
                request_errors: vec![RequestError { error: "MissingValue", parameter: Some("recipient") }],
            }),
        )
            .into_response()
    } else {
        let cancel = CancellationToken::new();
        match state
            .faucet
            .claim(&client, &request.recipient, &request.token, &cancel)
            .await
        {
            Ok((amount, txid)) => {
                (StatusCode::OK, Json(ClaimSucceeded { amount, txid })).into_response()
            }
            Err(e) => error_response("failed to send coins", e),
        }
    };
    res.headers_mut()
        .insert("Allow", "OPTIONS,POST".parse().expect("static Allow header value"));
    res
}
