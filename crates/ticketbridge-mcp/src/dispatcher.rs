use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{Instrument as _, debug, info, warn};

use crate::client_identity::{ClientVariant, resolve_client_variant};
use crate::error::HandlerError;
use crate::id_normalize::normalize_response_id;
use crate::jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, error_codes,
};
use crate::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsResult,
    McpServerInfo,
};
use crate::{PROTOCOL_VERSION_2024_11_05, PROTOCOL_VERSION_2025_03_26, PROTOCOL_VERSION_LATEST};

/// Tool surface behind the dispatcher.
#[async_trait]
pub trait McpHandler: Send + Sync {
    /// Static tool catalog. Must not touch the backend.
    async fn list_tools(&self) -> Result<ListToolsResult, HandlerError>;
    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub server_info: McpServerInfo,
    pub instructions: Option<String>,
    pub capabilities: Value,
    pub supported_protocol_versions: Vec<String>,
    /// Bindings unused for this long are dropped.
    pub session_idle_ttl: Duration,
    /// Upper bound on live bindings; the least recently used go first.
    pub max_sessions: usize,
}

pub const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

impl McpServerConfig {
    pub fn default_for_binary(name: &str, version: &str) -> Self {
        Self {
            server_info: McpServerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
            instructions: None,
            capabilities: serde_json::json!({
                "tools": {
                    "listChanged": false
                }
            }),
            supported_protocol_versions: vec![
                PROTOCOL_VERSION_LATEST.to_string(),
                PROTOCOL_VERSION_2025_03_26.to_string(),
                PROTOCOL_VERSION_2024_11_05.to_string(),
            ],
            session_idle_ttl: DEFAULT_SESSION_IDLE_TTL,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    fn negotiate_protocol(&self, requested: Option<&str>) -> String {
        match requested {
            Some(r) if self.supported_protocol_versions.iter().any(|v| v == r) => r.to_string(),
            _ => PROTOCOL_VERSION_LATEST.to_string(),
        }
    }
}

/// Variant resolved for a session at `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBinding {
    pub variant: ClientVariant,
    pub bound_at: DateTime<Utc>,
    pub last_seen: Instant,
}

/// Routes JSON-RPC requests to the handler and fixes up response ids for the
/// client bound to the session.
///
/// Safe to share across concurrent requests; the only mutable state is the
/// session table.
pub struct McpDispatcher {
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    sessions: RwLock<HashMap<String, SessionBinding>>,
}

impl McpDispatcher {
    pub fn new(cfg: McpServerConfig, handler: Arc<dyn McpHandler>) -> Self {
        Self {
            cfg,
            handler,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Handle a single JSON-RPC message.
    ///
    /// Returns `Some(response)` for requests, `None` for notifications or ignored messages.
    pub async fn handle_message(
        &self,
        session_id: Option<&str>,
        msg: JsonRpcMessage,
    ) -> Option<JsonRpcResponse> {
        match msg {
            JsonRpcMessage::Request(req) => Some(self.handle_request(session_id, req).await),
            JsonRpcMessage::Notification(n) => {
                self.handle_notification(session_id, n);
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// Variant bound to `session_id`, or `Unknown` for clients that never
    /// initialized, sent no session id, or went idle past the TTL. A hit
    /// counts as activity.
    pub async fn session_variant(&self, session_id: Option<&str>) -> ClientVariant {
        let Some(sid) = session_id else {
            return ClientVariant::Unknown;
        };
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let Some(binding) = sessions.get_mut(sid) else {
            return ClientVariant::Unknown;
        };
        if now.duration_since(binding.last_seen) > self.cfg.session_idle_ttl {
            sessions.remove(sid);
            debug!(session_id = sid, "mcp session expired");
            return ClientVariant::Unknown;
        }
        binding.last_seen = now;
        binding.variant
    }

    pub async fn session_binding(&self, session_id: &str) -> Option<SessionBinding> {
        self.sessions.read().await.get(session_id).copied()
    }

    /// Drop the binding for a finished session. Returns whether it existed.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "mcp session ended");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn handle_request(&self, session_id: Option<&str>, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.method == "initialize" {
            return self.handle_initialize(session_id, req).await;
        }

        let variant = self.session_variant(session_id).await;
        let resp = self.route(req).await;
        with_normalized_id(resp, variant)
    }

    async fn route(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.jsonrpc != JSONRPC_VERSION {
            return JsonRpcResponse::invalid_request(req.id, "invalid jsonrpc version");
        }

        match req.method.as_str() {
            "ping" => JsonRpcResponse::ok(req.id, serde_json::json!({})),
            "tools/list" => match self.handler.list_tools().await {
                Ok(res) => to_result(req.id, &res),
                Err(e) => handler_error(req.id, &e),
            },
            "tools/call" => {
                let Some(v) = req.params else {
                    return invalid_params(req.id, "missing params".to_string());
                };
                let params = match serde_json::from_value::<CallToolParams>(v) {
                    Ok(p) => p,
                    Err(e) => return invalid_params(req.id, e.to_string()),
                };

                let span = tracing::info_span!("mcp.tools_call", tool = %params.name, id = %req.id);
                match self.handler.call_tool(params).instrument(span).await {
                    Ok(res) => to_result(req.id, &res),
                    Err(e) => {
                        warn!(error = %e, kind = e.kind(), "tool call failed");
                        handler_error(req.id, &e)
                    }
                }
            }
            other => {
                debug!(method = other, "method not found");
                JsonRpcResponse::err(
                    req.id,
                    JsonRpcError {
                        code: error_codes::METHOD_NOT_FOUND,
                        message: "method not found".to_string(),
                        data: Some(serde_json::json!({ "method": other })),
                    },
                )
            }
        }
    }

    async fn handle_initialize(
        &self,
        session_id: Option<&str>,
        req: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let init: InitializeParams = match req.params {
            Some(params) => match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => {
                    return with_normalized_id(
                        invalid_params(req.id, e.to_string()),
                        ClientVariant::Unknown,
                    );
                }
            },
            None => InitializeParams::default(),
        };

        let variant = resolve_client_variant(&init.client_info);
        if req.jsonrpc != JSONRPC_VERSION {
            return with_normalized_id(
                JsonRpcResponse::invalid_request(req.id, "invalid jsonrpc version"),
                variant,
            );
        }

        // Bind before responding: the session id only reaches the client with
        // this response, so every later call observes the binding.
        if let Some(sid) = session_id {
            let binding = SessionBinding {
                variant,
                bound_at: Utc::now(),
                last_seen: Instant::now(),
            };
            let mut sessions = self.sessions.write().await;
            self.reap_sessions(&mut sessions, binding.last_seen);
            if sessions.insert(sid.to_string(), binding).is_some() {
                debug!(session_id = sid, "session re-initialized; binding overwritten");
            }
        }

        info!(
            session_id = session_id.unwrap_or("-"),
            client_name = init.client_info.name.as_deref().unwrap_or("-"),
            agent_name = init.client_info.agent_name.as_deref().unwrap_or("-"),
            channel_id = init.client_info.channel_id.as_deref().unwrap_or("-"),
            variant = variant.as_str(),
            "mcp client initialized"
        );

        let result = InitializeResult {
            protocol_version: self
                .cfg
                .negotiate_protocol(init.protocol_version.as_deref()),
            capabilities: self.cfg.capabilities.clone(),
            server_info: self.cfg.server_info.clone(),
            instructions: self.cfg.instructions.clone(),
        };

        with_normalized_id(to_result(req.id, &result), variant)
    }

    /// Drop idle bindings, then make room for one more under `max_sessions`.
    fn reap_sessions(&self, sessions: &mut HashMap<String, SessionBinding>, now: Instant) {
        let before = sessions.len();
        let ttl = self.cfg.session_idle_ttl;
        sessions.retain(|_, b| now.duration_since(b.last_seen) <= ttl);

        let cap = self.cfg.max_sessions.max(1);
        if sessions.len() >= cap {
            let mut by_use: Vec<(Instant, String)> = sessions
                .iter()
                .map(|(k, b)| (b.last_seen, k.clone()))
                .collect();
            by_use.sort_unstable();
            let excess = sessions.len() + 1 - cap;
            for (_, k) in by_use.into_iter().take(excess) {
                sessions.remove(&k);
            }
        }

        let reaped = before - sessions.len();
        if reaped > 0 {
            info!(reaped, remaining = sessions.len(), "dropped stale mcp sessions");
        }
    }

    fn handle_notification(&self, session_id: Option<&str>, n: JsonRpcNotification) {
        if n.jsonrpc != JSONRPC_VERSION {
            return;
        }
        if n.method == "notifications/initialized" {
            debug!(session_id = session_id.unwrap_or("-"), "client acknowledged initialize");
        } else {
            debug!(method = %n.method, "ignoring notification");
        }
    }
}

fn with_normalized_id(mut resp: JsonRpcResponse, variant: ClientVariant) -> JsonRpcResponse {
    resp.id = normalize_response_id(resp.id, variant);
    resp
}

fn to_result<T: serde::Serialize>(id: JsonRpcId, value: &T) -> JsonRpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => JsonRpcResponse::ok(id, v),
        Err(e) => handler_error(id, &HandlerError::Internal(e.to_string())),
    }
}

fn invalid_params(id: JsonRpcId, detail: String) -> JsonRpcResponse {
    JsonRpcResponse::err(
        id,
        JsonRpcError {
            code: error_codes::INVALID_PARAMS,
            message: "invalid params".to_string(),
            data: Some(serde_json::json!({ "detail": detail })),
        },
    )
}

fn handler_error(id: JsonRpcId, e: &HandlerError) -> JsonRpcResponse {
    JsonRpcResponse::err(id, e.to_jsonrpc_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientInfo, ContentBlock, Tool};

    struct DummyHandler;

    #[async_trait]
    impl McpHandler for DummyHandler {
        async fn list_tools(&self) -> Result<ListToolsResult, HandlerError> {
            Ok(ListToolsResult {
                tools: vec![Tool {
                    name: "echo".to_string(),
                    description: Some("demo".to_string()),
                    input_schema: serde_json::json!({"type":"object"}),
                }],
                next_cursor: None,
            })
        }

        async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult, HandlerError> {
            if params.name == "missing_user" {
                return Err(HandlerError::NotFound("nobody@example.com".to_string()));
            }
            Ok(CallToolResult {
                content: vec![ContentBlock::Text {
                    text: format!("called {}", params.name),
                }],
                structured_content: params.arguments,
                is_error: Some(false),
            })
        }
    }

    fn mk_dispatcher() -> McpDispatcher {
        let cfg = McpServerConfig::default_for_binary("test", "0.0.0");
        McpDispatcher::new(cfg, Arc::new(DummyHandler))
    }

    fn init_request(id: JsonRpcId, info: ClientInfo) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest::new(
            id,
            "initialize",
            Some(serde_json::to_value(InitializeParams::new_default(info)).expect("params")),
        ))
    }

    fn call_request(id: JsonRpcId, tool: &str) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest::new(
            id,
            "tools/call",
            Some(serde_json::json!({ "name": tool, "arguments": {} })),
        ))
    }

    #[tokio::test]
    async fn copilot_session_gets_string_ids() {
        let d = mk_dispatcher();
        let info = ClientInfo {
            channel_id: Some("pva-studio".to_string()),
            ..ClientInfo::default()
        };

        let resp = d
            .handle_message(Some("s1"), init_request(JsonRpcId::String("1".into()), info))
            .await
            .expect("response");
        assert!(resp.error.is_none());
        assert_eq!(resp.id, JsonRpcId::String("1".into()));
        assert_eq!(d.session_variant(Some("s1")).await, ClientVariant::CopilotStudio);

        let resp = d
            .handle_message(Some("s1"), call_request(JsonRpcId::Number(2), "echo"))
            .await
            .expect("response");
        assert!(resp.error.is_none());
        assert_eq!(resp.id, JsonRpcId::String("2".into()));
    }

    #[tokio::test]
    async fn inspector_session_keeps_numeric_ids() {
        let d = mk_dispatcher();
        let resp = d
            .handle_message(
                Some("s2"),
                init_request(JsonRpcId::Number(0), ClientInfo::named("mcp-inspector")),
            )
            .await
            .expect("response");
        assert_eq!(resp.id, JsonRpcId::Number(0));

        let resp = d
            .handle_message(Some("s2"), call_request(JsonRpcId::Number(1), "echo"))
            .await
            .expect("response");
        assert_eq!(resp.id, JsonRpcId::Number(1));
    }

    #[tokio::test]
    async fn initialize_response_uses_freshly_resolved_variant() {
        let d = mk_dispatcher();
        let resp = d
            .handle_message(
                Some("s3"),
                init_request(JsonRpcId::Number(5), ClientInfo::named("Copilot Agent")),
            )
            .await
            .expect("response");
        assert_eq!(resp.id, JsonRpcId::String("5".into()));
        let result = resp.result.expect("result");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION_LATEST);
        assert_eq!(result["serverInfo"]["name"], "test");
    }

    #[tokio::test]
    async fn call_without_initialize_falls_back_to_unknown() {
        let d = mk_dispatcher();
        let resp = d
            .handle_message(None, call_request(JsonRpcId::Number(9), "echo"))
            .await
            .expect("response");
        assert!(resp.error.is_none());
        assert_eq!(resp.id, JsonRpcId::Number(9));

        let resp = d
            .handle_message(Some("never-initialized"), call_request(JsonRpcId::Number(10), "echo"))
            .await
            .expect("response");
        assert_eq!(resp.id, JsonRpcId::Number(10));
    }

    #[tokio::test]
    async fn errors_are_normalized_like_successes() {
        let d = mk_dispatcher();
        d.handle_message(
            Some("s4"),
            init_request(JsonRpcId::Number(1), ClientInfo::named("copilot")),
        )
        .await;

        let unknown = d
            .handle_message(
                Some("s4"),
                JsonRpcMessage::Request(JsonRpcRequest::new(JsonRpcId::Number(3), "resources/list", None)),
            )
            .await
            .expect("response");
        assert_eq!(unknown.error.as_ref().map(|e| e.code), Some(error_codes::METHOD_NOT_FOUND));
        assert_eq!(unknown.id, JsonRpcId::String("3".into()));

        let not_found = d
            .handle_message(Some("s4"), call_request(JsonRpcId::Number(4), "missing_user"))
            .await
            .expect("response");
        assert_eq!(not_found.error.as_ref().map(|e| e.code), Some(error_codes::NOT_FOUND));
        assert_eq!(not_found.id, JsonRpcId::String("4".into()));
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let d = mk_dispatcher();
        let out = d
            .handle_message(
                Some("s5"),
                JsonRpcMessage::Notification(JsonRpcNotification::new(
                    "notifications/initialized",
                    None,
                )),
            )
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn reinitialize_overwrites_and_end_session_removes() {
        let d = mk_dispatcher();
        d.handle_message(
            Some("s6"),
            init_request(JsonRpcId::Number(1), ClientInfo::named("mcp-inspector")),
        )
        .await;
        assert_eq!(d.session_variant(Some("s6")).await, ClientVariant::McpInspector);

        d.handle_message(
            Some("s6"),
            init_request(JsonRpcId::Number(2), ClientInfo::named("copilot studio")),
        )
        .await;
        assert_eq!(d.session_variant(Some("s6")).await, ClientVariant::CopilotStudio);
        assert_eq!(d.session_count().await, 1);

        assert!(d.end_session("s6").await);
        assert!(!d.end_session("s6").await);
        assert_eq!(d.session_variant(Some("s6")).await, ClientVariant::Unknown);
    }

    fn bounded_dispatcher(idle: Duration, max_sessions: usize) -> McpDispatcher {
        let mut cfg = McpServerConfig::default_for_binary("test", "0.0.0");
        cfg.session_idle_ttl = idle;
        cfg.max_sessions = max_sessions;
        McpDispatcher::new(cfg, Arc::new(DummyHandler))
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_dropped_and_activity_keeps_them() {
        let d = bounded_dispatcher(Duration::from_secs(60), 100);
        for sid in ["idle", "busy"] {
            d.handle_message(
                Some(sid),
                init_request(JsonRpcId::Number(1), ClientInfo::named("mcp-inspector")),
            )
            .await;
        }

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(d.session_variant(Some("busy")).await, ClientVariant::McpInspector);
        tokio::time::advance(Duration::from_secs(45)).await;

        assert_eq!(d.session_variant(Some("idle")).await, ClientVariant::Unknown);
        assert_eq!(d.session_variant(Some("busy")).await, ClientVariant::McpInspector);
        assert_eq!(d.session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_sessions_reap_expired_bindings_without_lookups() {
        let d = bounded_dispatcher(Duration::from_secs(60), 100);
        for i in 0..50 {
            let sid = format!("s{i}");
            d.handle_message(Some(&sid), init_request(JsonRpcId::Number(1), ClientInfo::default()))
                .await;
        }
        assert_eq!(d.session_count().await, 50);

        tokio::time::advance(Duration::from_secs(61)).await;
        d.handle_message(Some("fresh"), init_request(JsonRpcId::Number(1), ClientInfo::default()))
            .await;
        assert_eq!(d.session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cap_evicts_least_recently_used() {
        let d = bounded_dispatcher(Duration::from_secs(3600), 3);
        for sid in ["a", "b", "c"] {
            d.handle_message(
                Some(sid),
                init_request(JsonRpcId::Number(1), ClientInfo::named("mcp-inspector")),
            )
            .await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // Touch "a" so "b" becomes the oldest.
        d.session_variant(Some("a")).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        d.handle_message(
            Some("d"),
            init_request(JsonRpcId::Number(1), ClientInfo::named("mcp-inspector")),
        )
        .await;
        assert_eq!(d.session_count().await, 3);
        assert!(d.session_binding("b").await.is_none());
        for sid in ["a", "c", "d"] {
            assert!(d.session_binding(sid).await.is_some(), "{sid}");
        }
    }

    #[tokio::test]
    async fn tools_list_and_bad_params() {
        let d = mk_dispatcher();
        let resp = d
            .handle_message(
                None,
                JsonRpcMessage::Request(JsonRpcRequest::new(JsonRpcId::Number(1), "tools/list", None)),
            )
            .await
            .expect("response");
        let tools = resp.result.expect("result")["tools"].clone();
        assert_eq!(tools[0]["name"], "echo");

        let resp = d
            .handle_message(
                None,
                JsonRpcMessage::Request(JsonRpcRequest::new(JsonRpcId::Number(2), "tools/call", None)),
            )
            .await
            .expect("response");
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn unsupported_protocol_version_negotiates_latest() {
        let d = mk_dispatcher();
        let req = JsonRpcRequest::new(
            JsonRpcId::Number(1),
            "initialize",
            Some(serde_json::json!({ "protocolVersion": "1999-01-01", "clientInfo": {} })),
        );
        let resp = d
            .handle_message(None, JsonRpcMessage::Request(req))
            .await
            .expect("response");
        assert_eq!(resp.result.expect("result")["protocolVersion"], PROTOCOL_VERSION_LATEST);
    }
}
