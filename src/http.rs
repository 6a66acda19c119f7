use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures::StreamExt;
use rmcp::model::{ClientJsonRpcMessage, ClientRequest, JsonRpcMessage};
use serde_json::{json, Value as JsonValue};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::{Settings, TokenVerifier};
use crate::event_store::StoredEvent;
use crate::session_store::{SessionBundle, SessionStore};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-Id";

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const ERROR_CONNECTION_CLOSED: i64 = -32000;
const ERROR_INVALID_REQUEST: i64 = -32600;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub settings: Settings,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/mcp",
            post(post_mcp)
                .get(get_mcp)
                .delete(delete_mcp)
                .put(method_not_allowed)
                .patch(method_not_allowed)
                .head(head_mcp)
                .options(options_mcp),
        )
        .with_state(state)
}

pub async fn start_http_server(
    state: AppState,
    addr: std::net::SocketAddr,
) -> Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr), String> {
    let router = app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| e.to_string())?;
    let local = listener.local_addr().map_err(|e| e.to_string())?;
    info!(target = "http", ip=%local.ip(), port=local.port(), "proxy_listening");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((handle, local))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    // HeaderMap lookups are case-insensitive, which covers both the
    // `Mcp-Session-Id` and `mcp-session-id` spellings clients use.
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn www_authenticate(settings: &Settings, description: &str) -> String {
    format!(
        "Bearer error=\"invalid_token\", error_description=\"{description}\", resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
        settings.base_url.trim_end_matches('/')
    )
}

fn unauthorized(settings: &Settings, description: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, www_authenticate(settings, description))],
        Json(json!({
            "jsonrpc": "2.0",
            "error": { "code": ERROR_CONNECTION_CLOSED, "message": description },
            "id": null,
        })),
    )
        .into_response()
}

fn rpc_error_response(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": null,
        })),
    )
        .into_response()
}

async fn authenticated_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(String, Arc<SessionBundle>), Response> {
    let token = bearer_token(headers)
        .ok_or_else(|| unauthorized(&state.settings, "Missing access token"))?;
    let auth = state
        .verifier
        .verify(&token)
        .await
        .ok_or_else(|| unauthorized(&state.settings, "Invalid access token"))?;
    let session_id = session_header(headers).ok_or_else(|| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            ERROR_CONNECTION_CLOSED,
            "Missing session",
        )
    })?;
    let bundle = state.sessions.get(&session_id).await.ok_or_else(|| {
        rpc_error_response(
            StatusCode::NOT_FOUND,
            ERROR_CONNECTION_CLOSED,
            "No valid session",
        )
    })?;
    if bundle.client.user_id != auth.user_id {
        return Err(rpc_error_response(
            StatusCode::FORBIDDEN,
            ERROR_INVALID_REQUEST,
            "Session belongs to another user",
        ));
    }
    Ok((session_id, bundle))
}

async fn post_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized(&state.settings, "Missing access token");
    };
    let Some(auth) = state.verifier.verify(&token).await else {
        return unauthorized(&state.settings, "Invalid access token");
    };

    let message: ClientJsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            debug!(target = "http", error = %e, "malformed body");
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                ERROR_INVALID_REQUEST,
                "Malformed JSON-RPC message",
            );
        }
    };
    let is_initialize = matches!(
        &message,
        JsonRpcMessage::Request(r) if matches!(&r.request, ClientRequest::InitializeRequest(_))
    );

    let (session_id, bundle) = match session_header(&headers) {
        Some(session_id) => match state.sessions.get(&session_id).await {
            Some(bundle) if bundle.client.user_id == auth.user_id => (session_id, bundle),
            Some(_) => {
                return rpc_error_response(
                    StatusCode::FORBIDDEN,
                    ERROR_INVALID_REQUEST,
                    "Session belongs to another user",
                )
            }
            None => {
                return rpc_error_response(
                    StatusCode::NOT_FOUND,
                    ERROR_CONNECTION_CLOSED,
                    "No valid session",
                )
            }
        },
        None if is_initialize => {
            let bundle = state.sessions.create(token, auth).await;
            (bundle.client.session_id.clone(), bundle)
        }
        None => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                ERROR_CONNECTION_CLOSED,
                "No valid session",
            )
        }
    };

    match bundle.proxy.handle_message(message).await {
        Some(frame) => (
            StatusCode::OK,
            [(SESSION_HEADER, session_id)],
            Json(frame),
        )
            .into_response(),
        None => (
            StatusCode::ACCEPTED,
            [(SESSION_HEADER, session_id)],
        )
            .into_response(),
    }
}

/// Resumable stream: replay everything after `Last-Event-Id`, then stay live.
async fn get_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (session_id, bundle) = match authenticated_session(&state, &headers).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    bundle.client.touch();
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let replay = bundle.store.replay_after(last_event_id);
    let receiver = bundle.store.subscribe();
    let cursor = replay.last().map(|e| e.event_id).unwrap_or(last_event_id);
    debug!(target = "http", session = %session_id, last_event_id, replayed = replay.len(), "stream_attached");

    let replay_stream = futures::stream::iter(replay.into_iter().map(sse_frame));
    let live_stream = futures::stream::unfold(
        (receiver, cursor),
        |(mut rx, mut seen)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // replayed ids never repeat on the live tail
                        if event.event_id <= seen {
                            continue;
                        }
                        seen = event.event_id;
                        return Some((sse_frame(event), (rx, seen)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target = "http", skipped, "stream_lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );
    let stream = replay_stream
        .chain(live_stream)
        .map(Ok::<SseEvent, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response()
}

fn sse_frame(event: StoredEvent) -> SseEvent {
    SseEvent::default()
        .id(event.event_id.to_string())
        .data(event.payload.to_string())
}

async fn delete_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (session_id, _bundle) = match authenticated_session(&state, &headers).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    state.sessions.remove(&session_id, "client_terminated").await;
    StatusCode::NO_CONTENT.into_response()
}

async fn method_not_allowed() -> Response {
    rpc_error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        ERROR_CONNECTION_CLOSED,
        "Method not allowed.",
    )
}

async fn head_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match bearer_token(&headers) {
        None => (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                www_authenticate(&state.settings, "Missing access token"),
            )],
        )
            .into_response(),
        Some(_) => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn options_mcp() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, POST, DELETE, OPTIONS",
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Authorization, Content-Type, Mcp-Session-Id, Last-Event-ID",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
        .into_response()
}

pub fn parse_frame(body: &[u8]) -> Result<ClientJsonRpcMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

pub fn frame_to_value(frame: &ClientJsonRpcMessage) -> Option<JsonValue> {
    serde_json::to_value(frame).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-123"));
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn session_header_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Mcp-Session-Id", "abc".parse().unwrap());
        assert_eq!(session_header(&headers).as_deref(), Some("abc"));
        let mut headers = HeaderMap::new();
        headers.insert("mcp-session-id", "xyz".parse().unwrap());
        assert_eq!(session_header(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn www_authenticate_carries_resource_metadata() {
        let settings = crate::config::default_settings();
        let value = www_authenticate(&settings, "Missing access token");
        assert!(value.starts_with("Bearer error=\"invalid_token\""));
        assert!(value.contains("/.well-known/oauth-protected-resource"));
    }

    #[test]
    fn initialize_frames_are_recognized() {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0.0.1" }
            }
        });
        let frame = parse_frame(body.to_string().as_bytes()).unwrap();
        assert!(matches!(
            frame,
            JsonRpcMessage::Request(ref r) if matches!(r.request, ClientRequest::InitializeRequest(_))
        ));
    }
}
