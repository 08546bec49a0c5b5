//! HTTP request handlers for the gateway.
//!
//! Five routes: the raw byte stream, the player page, the hash lookup,
//! the landing page and a liveness ping. The stream and player paths share
//! the same spine (parse ids, lease a worker, fetch the message, extract
//! the descriptor, check the fingerprint) and differ only in what they do
//! with the result.

use std::net::SocketAddr;

use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use common::{FileInfo, HashInfo, parse_channel_id, parse_message_id, readable_size, verify_hash};

use crate::access::{GateOutcome, GateRequest, cookie_value};
use crate::config::{AUTH_COOKIE, PAGE_CACHE_MAX_AGE_SECS};
use crate::helpers::{RangeOutcome, format_duration_secs, parse_range, sanitize_filename};
use crate::state::AppState;
use crate::stream::{FileStream, TelegramFetcher};
use crate::telegram::{self, LookupError};
use crate::templates::{HomePage, WatchPage};
use crate::workers::WorkerLease;

type HandlerError = (StatusCode, String);

#[derive(Deserialize)]
pub struct StreamQuery {
    /// `d=1` (or `d=true`) forces a download disposition.
    d: Option<String>,
}

#[derive(Deserialize)]
pub struct WatchQuery {
    hash: Option<String>,
    uuid: Option<String>,
    redirect: Option<String>,
}

// ============================================================================
// Raw stream
// ============================================================================

pub async fn stream_file(
    State(state): State<AppState>,
    Path((channel_id, message_id, hash)): Path<(String, String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    match serve_stream(&state, &channel_id, &message_id, &hash, &query, &headers).await {
        Ok(response) => response,
        Err((status, message)) => (status, message).into_response(),
    }
}

async fn serve_stream(
    state: &AppState,
    channel_id: &str,
    message_id: &str,
    hash: &str,
    query: &StreamQuery,
    headers: &HeaderMap,
) -> Result<Response, HandlerError> {
    let (channel_id, message_id) =
        parse_ids(channel_id, message_id, Some(state.cfg.db_channel_id))?;
    let force_download = matches!(
        query.d.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("True")
    );

    let (lease, file) = lookup_file(state, channel_id, message_id).await?;

    if !verify_hash(&file, hash) {
        error!(channel_id, message_id, hash, "hash mismatch");
        return Err((StatusCode::FORBIDDEN, "Invalid hash".to_string()));
    }

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let (status, start, end) = match parse_range(range_header, file.size) {
        RangeOutcome::Full => (StatusCode::OK, 0, file.size - 1),
        RangeOutcome::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end),
        RangeOutcome::Unsatisfiable => {
            let mut response =
                (StatusCode::RANGE_NOT_SATISFIABLE, "Range not satisfiable").into_response();
            if let Ok(value) = format!("bytes */{}", file.size).parse() {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
    };

    info!(
        channel_id,
        message_id,
        start,
        end,
        size = file.size,
        file_name = %file.file_name,
        "serving stream"
    );

    let content_length = if file.size == 0 { 0 } else { end - start + 1 };
    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, content_length)
        .header(
            header::CONTENT_TYPE,
            if file.mime_type.is_empty() {
                "application/octet-stream"
            } else {
                file.mime_type.as_str()
            },
        );
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{}", file.size),
        );
    }
    if force_download {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                sanitize_filename(&file.file_name)
            ),
        );
    }

    let body = if file.size == 0 {
        Body::empty()
    } else {
        // The fetcher owns the lease: it is released when the body stream
        // is dropped, whether the stream finished or the client vanished.
        Body::from_stream(FileStream::new(file, start, end, TelegramFetcher::new(lease)).into_stream())
    };

    builder
        .body(body)
        .map_err(|e| internal_error("building stream response", e))
}

// ============================================================================
// Player page
// ============================================================================

pub async fn watch_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(query): Query<WatchQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    watch_page(state, None, message_id, query, addr, uri, headers).await
}

pub async fn watch_channel_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
    Query(query): Query<WatchQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    watch_page(state, Some(channel_id), message_id, query, addr, uri, headers).await
}

async fn watch_page(
    state: AppState,
    channel_id: Option<String>,
    message_id: String,
    query: WatchQuery,
    addr: SocketAddr,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let (channel_id, message_id) = match parse_ids(
        channel_id.as_deref().unwrap_or(""),
        &message_id,
        Some(state.cfg.db_channel_id),
    ) {
        Ok(ids) => ids,
        Err((status, message)) => return error_page(&state, status, &message),
    };

    let hash = query.hash.clone().unwrap_or_default();
    let stream_link = format!("/stream/{channel_id}/{message_id}/{hash}");

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    // Media clients get the bytes straight away; the grant gate is only
    // for interactive viewers.
    if user_agent.to_lowercase().contains("vlc") {
        return Redirect::to(&stream_link).into_response();
    }

    let mut just_verified = false;
    let mut set_cookie = None;
    let gate_request = GateRequest {
        client_ip: &client_ip(&headers, addr),
        user_agent,
        host: headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default(),
        request_uri: &uri.to_string(),
        uuid_param: query.uuid.as_deref(),
        cookie: headers
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| cookie_value(raw, AUTH_COOKIE)),
    };
    match state.gate.check(gate_request).await {
        GateOutcome::Redirect(url) => return Redirect::to(&url).into_response(),
        GateOutcome::Pass {
            just_verified: verified,
            set_cookie: cookie,
        } => {
            just_verified = verified;
            set_cookie = cookie;
        }
    }

    // Deep link back into a native player once the viewer passed the gate.
    if query.redirect.as_deref() == Some("vlc") {
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        return Redirect::to(&format!("vlc://{host}{stream_link}")).into_response();
    }

    let (_lease, file) = match lookup_file(&state, channel_id, message_id).await {
        Ok(found) => found,
        Err((status, message)) => return error_page(&state, status, &message),
    };

    if !verify_hash(&file, &hash) {
        error!(channel_id, message_id, hash = %hash, "hash mismatch");
        return error_page(
            &state,
            StatusCode::FORBIDDEN,
            "Invalid hash. Check your URL",
        );
    }

    let page = WatchPage {
        app_name: state.cfg.app_name.clone(),
        title: file.file_name.clone(),
        size: readable_size(file.size),
        download_link: format!("{stream_link}?d=1"),
        stream_link,
        just_verified,
        expire_time: format_duration_secs(state.cfg.jwt_expiration),
    };
    let html = match state.pages.render_watch(&page) {
        Ok(html) => html,
        Err(error) => {
            error!(error = %error, "failed to render watch page");
            return error_page(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to render page",
            );
        }
    };

    let mut response = Html(html).into_response();
    if let Ok(value) = format!("max-age={PAGE_CACHE_MAX_AGE_SECS}").parse() {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
    if let Some(cookie) = set_cookie
        && let Ok(value) = cookie.parse()
    {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

// ============================================================================
// Hash lookup, landing, liveness
// ============================================================================

#[derive(Serialize)]
struct HashResponse {
    data: HashInfo,
    #[serde(rename = "statusCode")]
    status_code: u16,
}

pub async fn hash_info(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
) -> Result<Response, HandlerError> {
    // No fallback here: the hash endpoint needs the channel spelled out.
    let (channel_id, message_id) = parse_ids(&channel_id, &message_id, None)?;
    let (_lease, file) = lookup_file(&state, channel_id, message_id).await?;
    Ok((
        [(
            header::CACHE_CONTROL,
            format!("max-age={PAGE_CACHE_MAX_AGE_SECS}"),
        )],
        Json(HashResponse {
            data: HashInfo {
                hash: common::make_hash(&file),
                message_id,
                channel_id,
            },
            status_code: StatusCode::OK.as_u16(),
        }),
    )
        .into_response())
}

pub async fn landing_page(State(state): State<AppState>) -> Response {
    let default_worker = state.pool.default_worker();
    let bot_link = format!(
        "https://t.me/{}",
        default_worker
            .map(|worker| worker.username.as_str())
            .unwrap_or(&state.cfg.main_channel_username)
    );
    let channel_link = match default_worker {
        Some(worker) => {
            telegram::main_channel_link(&worker.client, state.cfg.main_channel_id).await
        }
        None => None,
    }
    .unwrap_or_else(|| format!("https://t.me/{}", state.cfg.main_channel_username));

    let page = HomePage {
        app_name: state.cfg.app_name.clone(),
        bot_link,
        channel_link,
        commits: state.commits.as_ref().clone(),
    };
    match state.pages.render_home(&page) {
        Ok(html) => (
            [(
                header::CACHE_CONTROL,
                format!("max-age={PAGE_CACHE_MAX_AGE_SECS}"),
            )],
            Html(html),
        )
            .into_response(),
        Err(error) => {
            error!(error = %error, "failed to render landing page");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

pub async fn ping() -> &'static str {
    "pong"
}

// ============================================================================
// Shared spine
// ============================================================================

fn parse_ids(
    channel_id: &str,
    message_id: &str,
    fallback: Option<i64>,
) -> Result<(i64, i32), HandlerError> {
    let message_id = parse_message_id(message_id).map_err(|e| {
        error!(error = %e, "failed to parse message id");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    let channel_id = parse_channel_id(channel_id, fallback).map_err(|e| {
        error!(error = %e, "failed to parse channel id");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    Ok((channel_id, message_id))
}

/// Lease a worker and resolve `(channel, message)` into a file descriptor.
///
/// The lease is returned alongside so the caller can keep the worker for
/// the duration of the response body.
async fn lookup_file(
    state: &AppState,
    channel_id: i64,
    message_id: i32,
) -> Result<(WorkerLease, FileInfo), HandlerError> {
    let lease = state.pool.hire().map_err(|e| {
        error!(error = %e, "failed to hire a worker");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    let message = telegram::fetch_message(lease.client(), channel_id, message_id)
        .await
        .map_err(|e| {
            error!(channel_id, message_id, error = %e, "failed to fetch message");
            (StatusCode::INTERNAL_SERVER_ERROR, lookup_error_text(&e))
        })?;
    let file = telegram::extract_file(&message).map_err(|e| {
        error!(channel_id, message_id, error = %e, "failed to extract media");
        (StatusCode::INTERNAL_SERVER_ERROR, lookup_error_text(&e))
    })?;
    Ok((lease, file))
}

fn lookup_error_text(error: &LookupError) -> String {
    match error {
        LookupError::Rpc(_) => "Upstream platform error. Try again later".to_string(),
        other => format!("{other}. Check your URL"),
    }
}

fn internal_error(context: &str, error: impl std::fmt::Display) -> HandlerError {
    error!(context, error = %error, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "An internal error occurred. Please try again later.".to_string(),
    )
}

fn error_page(state: &AppState, status: StatusCode, message: &str) -> Response {
    match state.pages.render_error(message) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(error) => {
            error!(error = %error, "failed to render error page");
            (status, message.to_string()).into_response()
        }
    }
}

/// Client address for fingerprinting: first `X-Forwarded-For` hop when the
/// gateway sits behind a proxy, else the socket peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let addr: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers, addr), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let addr: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), addr), "10.0.0.1");
    }

    #[test]
    fn test_parse_ids_uses_fallback_channel() {
        let (channel, message) = parse_ids("", "42", Some(1234567890)).unwrap();
        assert_eq!(channel, 1234567890);
        assert_eq!(message, 42);
    }

    #[test]
    fn test_parse_ids_rejects_bad_message() {
        let err = parse_ids("1234567890", "nope", None).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_hash_response_wire_format() {
        let response = HashResponse {
            data: HashInfo {
                hash: "abc123".to_string(),
                message_id: 7,
                channel_id: 1234567890,
            },
            status_code: 200,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["data"]["hash"], "abc123");
        assert_eq!(json["data"]["messageId"], 7);
        assert_eq!(json["data"]["channelId"], 1234567890i64);
    }
}
