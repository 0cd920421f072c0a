use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ticketbridge_core::{CredentialManager, UserCache, UserDirectory};
use ticketbridge_mcp::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, McpDispatcher, McpHandler, McpServerConfig,
};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt as _;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::nsp::{NspApi, NspAuthenticator};
use crate::tools::GatewayHandler;

pub const SERVICE_NAME: &str = "ticketbridge-gateway";
pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<McpDispatcher>,
    pub credentials: CredentialManager,
    pub users: Arc<UserCache>,
    pub directory: Arc<dyn UserDirectory>,
    pub nsp_username: String,
}

/// Wire the NSP client, credential manager, user cache and dispatcher together.
pub fn build_state(cfg: &GatewayConfig) -> anyhow::Result<AppState> {
    let authenticator = Arc::new(NspAuthenticator::new(cfg.nsp.clone())?);
    let credentials = CredentialManager::new(authenticator, cfg.credentials)?;
    let api = NspApi::new(&cfg.nsp, credentials.clone())?;
    let users = Arc::new(UserCache::new(cfg.user_cache));

    let handler: Arc<dyn McpHandler> = Arc::new(GatewayHandler::new(api.clone(), users.clone()));
    let mut server_cfg = McpServerConfig::default_for_binary(SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    server_cfg.session_idle_ttl = cfg.session_idle_ttl;
    server_cfg.max_sessions = cfg.max_sessions;
    server_cfg.instructions = Some(
        "Tools for the NSP service desk: read, search, create and update tickets and look up users."
            .to_string(),
    );

    Ok(AppState {
        dispatcher: Arc::new(McpDispatcher::new(server_cfg, handler)),
        credentials,
        users,
        directory: Arc::new(api),
        nsp_username: cfg.nsp.username.clone(),
    })
}

/// Authenticate in the background, then warm the user cache. The listener
/// does not wait for this.
pub fn spawn_prewarming(state: &AppState, warm_emails: Vec<String>) -> JoinHandle<()> {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = state.credentials.start().await {
            warn!(error = %e, "initial authentication failed; retry scheduled");
            return;
        }
        if warm_emails.is_empty() {
            return;
        }
        let report = state.users.warm(&warm_emails, state.directory.as_ref()).await;
        info!(
            requested = report.requested,
            cached = report.cached,
            "startup cache warm finished"
        );
    })
}

pub fn router(state: AppState, mcp_path: &str) -> Router {
    let api = Router::new()
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/warm", post(cache_warm))
        .route("/prewarming/status", get(prewarming_status))
        .route("/prewarming/start", post(prewarming_start))
        .route("/prewarming/stop", post(prewarming_stop))
        .route("/prewarming/refresh", post(prewarming_refresh))
        .route("/token/status", get(token_status))
        .route("/token/refresh", post(prewarming_refresh));

    Router::new()
        .route("/health", get(health))
        .route(mcp_path, post(mcp_post).delete(mcp_delete).get(mcp_get))
        .nest("/api", api)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request| {
                // Headers and bodies stay out of spans.
                let span = tracing::info_span!(
                    "http.request",
                    http_method = %req.method(),
                    http_path = %req.uri().path(),
                );
                let cx = ticketbridge_otel::remote_parent(req.headers());
                let _ = span.set_parent(cx);
                span
            }),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ApiError {
    success: bool,
    error: String,
}

fn api_error(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            success: false,
            error: error.into(),
        }),
    )
        .into_response()
}

fn ok_data(data: impl Serialize) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn ok_message(message: impl Into<String>, data: Option<Value>) -> Response {
    let mut body = json!({ "success": true, "message": message.into() });
    if let Some(d) = data {
        body["data"] = d;
    }
    Json(body).into_response()
}

async fn health(State(st): State<AppState>) -> Json<Value> {
    let token = st.credentials.token_info().await;
    let status = st.credentials.status().await;
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "authenticated": token.has_token && !token.is_expired,
        "token_info": token,
        "prewarming": {
            "running": status.running,
            "state": status.state,
            "next_refresh_in_seconds": status.schedule.and_then(|s| s.next_refresh_in_seconds),
        },
        "user_cache": st.users.stats().await,
        "mcp_sessions": st.dispatcher.session_count().await,
        "ts": Utc::now().to_rfc3339(),
    }))
}

async fn cache_stats(State(st): State<AppState>) -> Response {
    ok_data(st.users.stats().await)
}

async fn cache_clear(State(st): State<AppState>) -> Response {
    let cleared = st.users.clear().await;
    ok_message(
        format!("cleared {cleared} cached users"),
        Some(json!({ "cleared": cleared })),
    )
}

#[derive(Debug, Deserialize)]
struct WarmRequest {
    #[serde(default)]
    emails: Vec<String>,
}

async fn cache_warm(State(st): State<AppState>, Json(req): Json<WarmRequest>) -> Response {
    if req.emails.iter().all(|e| e.trim().is_empty()) {
        return api_error(StatusCode::BAD_REQUEST, "emails must be a non-empty list");
    }

    let report = st.users.warm(&req.emails, st.directory.as_ref()).await;
    ok_data(json!(report))
}

async fn prewarming_status(State(st): State<AppState>) -> Response {
    ok_data(st.credentials.status().await)
}

async fn prewarming_start(State(st): State<AppState>) -> Response {
    match st.credentials.start().await {
        Ok(()) => ok_message(
            "token prewarming started",
            serde_json::to_value(st.credentials.status().await).ok(),
        ),
        Err(e) => api_error(StatusCode::BAD_GATEWAY, format!("failed to start prewarming: {e}")),
    }
}

async fn prewarming_stop(State(st): State<AppState>) -> Response {
    st.credentials.stop().await;
    ok_message("token prewarming stopped", None)
}

async fn prewarming_refresh(State(st): State<AppState>) -> Response {
    match st.credentials.force_refresh().await {
        Ok(_) => ok_message(
            "token refreshed",
            serde_json::to_value(st.credentials.token_info().await).ok(),
        ),
        Err(e) => api_error(StatusCode::BAD_GATEWAY, format!("token refresh failed: {e}")),
    }
}

async fn token_status(State(st): State<AppState>) -> Response {
    let info = st.credentials.token_info().await;
    let mut data = serde_json::to_value(info).unwrap_or_else(|_| json!({}));
    data["username"] = Value::String(st.nsp_username.clone());
    ok_data(data)
}

async fn mcp_get() -> impl IntoResponse {
    // No server-initiated messages, so no SSE stream.
    (StatusCode::METHOD_NOT_ALLOWED, "sse not supported")
}

async fn mcp_delete(State(st): State<AppState>, headers: HeaderMap) -> Response {
    let Some(sid) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    if st.dispatcher.end_session(sid).await {
        StatusCode::ACCEPTED.into_response()
    } else {
        (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response()
    }
}

async fn mcp_post(State(st): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let msg = match parse_message(&body) {
        Ok(m) => m,
        Err(resp) => return jsonrpc_http_response(&resp, None),
    };

    // Initialize always opens a new session; its id goes back in the header.
    if let JsonRpcMessage::Request(JsonRpcRequest { method, .. }) = &msg
        && method == "initialize"
    {
        let sid = Uuid::new_v4().to_string();
        return match st.dispatcher.handle_message(Some(&sid), msg).await {
            Some(r) => jsonrpc_http_response(&r, Some(&sid)),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    // Clients that skip initialize, or lost their session, are served with
    // the default id handling instead of being rejected.
    let sid = header_str(&headers, SESSION_HEADER);
    match st.dispatcher.handle_message(sid, msg).await {
        Some(r) => jsonrpc_http_response(&r, sid),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Parse one JSON-RPC message, or produce the error response for it.
pub fn parse_message(body: &str) -> Result<JsonRpcMessage, JsonRpcResponse> {
    let val: Value =
        serde_json::from_str(body).map_err(|e| JsonRpcResponse::parse_error(e.to_string()))?;

    if val.is_array() {
        return Err(JsonRpcResponse::invalid_request(
            ticketbridge_mcp::JsonRpcId::Null,
            "batching not supported",
        ));
    }

    serde_json::from_value(val).map_err(|e| {
        JsonRpcResponse::invalid_request(
            ticketbridge_mcp::JsonRpcId::Null,
            format!("invalid request: {e}"),
        )
    })
}

fn jsonrpc_http_response(resp: &JsonRpcResponse, session_id: Option<&str>) -> Response {
    let mut out = Json(resp).into_response();
    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        out.headers_mut().insert(SESSION_HEADER, v);
    }
    out
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_use_null_ids() {
        let resp = parse_message("{not json").expect_err("parse error");
        assert_eq!(resp.id, ticketbridge_mcp::JsonRpcId::Null);
        assert_eq!(
            resp.error.as_ref().map(|e| e.code),
            Some(ticketbridge_mcp::error_codes::PARSE_ERROR)
        );

        let resp = parse_message("[]").expect_err("batch");
        assert_eq!(
            resp.error.as_ref().map(|e| e.code),
            Some(ticketbridge_mcp::error_codes::INVALID_REQUEST)
        );
    }

    #[test]
    fn header_str_ignores_blank_values() {
        let mut h = HeaderMap::new();
        h.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        assert_eq!(header_str(&h, SESSION_HEADER), None);
        h.insert(SESSION_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(header_str(&h, SESSION_HEADER), Some("abc"));
    }
}
