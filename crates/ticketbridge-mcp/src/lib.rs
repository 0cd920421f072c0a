//! Model Context Protocol (MCP) primitives for the ticketbridge gateway.
//!
//! Covers the JSON-RPC envelope, the handful of MCP payloads the gateway
//! serves (`initialize`, `tools/list`, `tools/call`), and the dispatcher that
//! adapts responses to the quirks of each known client.

mod client_identity;
mod dispatcher;
mod error;
mod id_normalize;
mod jsonrpc;
mod types;

pub use client_identity::{ClientVariant, resolve_client_variant};
pub use dispatcher::{
    DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_IDLE_TTL, McpDispatcher, McpHandler, McpServerConfig,
    SessionBinding,
};
pub use error::HandlerError;
pub use id_normalize::normalize_response_id;
pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, error_codes,
};
pub use types::{
    CallToolParams, CallToolResult, ClientInfo, ContentBlock, InitializeParams, InitializeResult,
    ListToolsResult, McpServerInfo, Tool,
};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

/// Older protocol versions still sent by deployed clients.
pub const PROTOCOL_VERSION_2025_03_26: &str = "2025-03-26";
pub const PROTOCOL_VERSION_2024_11_05: &str = "2024-11-05";
