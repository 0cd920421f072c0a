use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use ticketbridge_core::{CredentialError, LookupError, UserCache};
use ticketbridge_mcp::{
    CallToolParams, CallToolResult, HandlerError, ListToolsResult, McpHandler, Tool,
};
use tracing::{Instrument as _, info};

use crate::nsp::{NspApi, NspError};

const DEFAULT_PAGE_SIZE: u32 = 15;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    GetTickets,
    GetTicketById,
    CreateTicket,
    UpdateTicket,
    SearchEntities,
    GetEntityTypes,
    GetEntityMetadata,
    GetAttachments,
    GetUserByEmail,
}

impl ToolName {
    pub const ALL: [ToolName; 9] = [
        ToolName::GetTickets,
        ToolName::GetTicketById,
        ToolName::CreateTicket,
        ToolName::UpdateTicket,
        ToolName::SearchEntities,
        ToolName::GetEntityTypes,
        ToolName::GetEntityMetadata,
        ToolName::GetAttachments,
        ToolName::GetUserByEmail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::GetTickets => "get_tickets",
            ToolName::GetTicketById => "get_ticket_by_id",
            ToolName::CreateTicket => "create_ticket",
            ToolName::UpdateTicket => "update_ticket",
            ToolName::SearchEntities => "search_entities",
            ToolName::GetEntityTypes => "get_entity_types",
            ToolName::GetEntityMetadata => "get_entity_metadata",
            ToolName::GetAttachments => "get_attachments",
            ToolName::GetUserByEmail => "get_user_by_email",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    fn description(self) -> &'static str {
        match self {
            ToolName::GetTickets => "List tickets, paginated, with optional NSP query filters.",
            ToolName::GetTicketById => "Fetch a single ticket by its numeric id.",
            ToolName::CreateTicket => "Create a ticket with a title and optional description and fields.",
            ToolName::UpdateTicket => "Update fields on an existing ticket.",
            ToolName::SearchEntities => "Free-text search over any NSP entity type.",
            ToolName::GetEntityTypes => "List the entity types NSP exposes.",
            ToolName::GetEntityMetadata => "Describe the fields of an entity type.",
            ToolName::GetAttachments => "List attachments on an entity.",
            ToolName::GetUserByEmail => "Look up a person by email address. Results are cached.",
        }
    }

    fn input_schema(self) -> Value {
        let paging = json!({
            "page": { "type": "integer", "minimum": 1, "default": 1 },
            "page_size": { "type": "integer", "minimum": 1, "maximum": MAX_PAGE_SIZE, "default": DEFAULT_PAGE_SIZE }
        });
        match self {
            ToolName::GetTickets => object_schema(
                with(paging, "filters", json!({ "type": "object", "description": "Extra NSP query fields." })),
                &[],
            ),
            ToolName::GetTicketById => object_schema(
                json!({ "ticket_id": { "type": "integer" } }),
                &["ticket_id"],
            ),
            ToolName::CreateTicket => object_schema(
                json!({
                    "title": { "type": "string", "minLength": 1 },
                    "description": { "type": "string" },
                    "fields": { "type": "object", "description": "Additional NSP ticket fields." }
                }),
                &["title"],
            ),
            ToolName::UpdateTicket => object_schema(
                json!({
                    "ticket_id": { "type": "integer" },
                    "updates": { "type": "object" }
                }),
                &["ticket_id", "updates"],
            ),
            ToolName::SearchEntities => object_schema(
                with(
                    with(paging, "entity_type", json!({ "type": "string" })),
                    "query",
                    json!({ "type": "string" }),
                ),
                &["entity_type", "query"],
            ),
            ToolName::GetEntityTypes => object_schema(json!({}), &[]),
            ToolName::GetEntityMetadata => object_schema(
                json!({ "entity_type": { "type": "string" } }),
                &["entity_type"],
            ),
            ToolName::GetAttachments => object_schema(
                json!({
                    "entity_type": { "type": "string", "default": "Ticket" },
                    "entity_id": { "type": "integer" }
                }),
                &["entity_id"],
            ),
            ToolName::GetUserByEmail => object_schema(
                json!({ "email": { "type": "string", "format": "email" } }),
                &["email"],
            ),
        }
    }
}

fn with(mut props: Value, key: &str, schema: Value) -> Value {
    props[key] = schema;
    props
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

pub fn tool_catalog() -> Vec<Tool> {
    ToolName::ALL
        .into_iter()
        .map(|t| Tool {
            name: t.as_str().to_string(),
            description: Some(t.description().to_string()),
            input_schema: t.input_schema(),
        })
        .collect()
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_entity_type() -> String {
    "Ticket".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetTicketsArgs {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
    #[serde(default)]
    filters: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TicketIdArgs {
    ticket_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateTicketArgs {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fields: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateTicketArgs {
    ticket_id: i64,
    updates: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    entity_type: String,
    query: String,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntityTypeArgs {
    entity_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttachmentsArgs {
    #[serde(default = "default_entity_type")]
    entity_type: String,
    entity_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmailArgs {
    email: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

fn parse_args<T: DeserializeOwned>(args: Option<Value>) -> Result<T, HandlerError> {
    let args = match args {
        None | Some(Value::Null) => json!({}),
        Some(v) => v,
    };
    serde_json::from_value(args).map_err(|e| HandlerError::InvalidArguments(e.to_string()))
}

fn clamp_paging(page: u32, page_size: u32) -> (u32, u32) {
    (page.max(1), page_size.clamp(1, MAX_PAGE_SIZE))
}

fn non_empty(field: &str, value: &str) -> Result<(), HandlerError> {
    if value.trim().is_empty() {
        return Err(HandlerError::InvalidArguments(format!("{field} must not be empty")));
    }
    Ok(())
}

impl From<NspError> for HandlerError {
    fn from(e: NspError) -> Self {
        match e {
            NspError::Credentials(CredentialError::Auth(e)) => {
                HandlerError::AuthenticationFailed(e.to_string())
            }
            NspError::Credentials(e @ CredentialError::InvalidConfig(_)) => {
                HandlerError::Internal(e.to_string())
            }
            NspError::Timeout(d) => HandlerError::UpstreamTimeout(format!("no response within {d:?}")),
            NspError::Status { status, body } if status == reqwest::StatusCode::NOT_FOUND => {
                HandlerError::NotFound(body)
            }
            e @ (NspError::Status { .. } | NspError::Transport(_) | NspError::Decode(_)) => {
                HandlerError::Upstream(e.to_string())
            }
            e @ NspError::Endpoint(_) => HandlerError::Internal(e.to_string()),
        }
    }
}

fn lookup_error(e: LookupError) -> HandlerError {
    match e {
        LookupError::NotFound(email) => HandlerError::NotFound(format!("no user with email {email}")),
        LookupError::Auth(e) => HandlerError::AuthenticationFailed(e.to_string()),
        LookupError::Timeout(d) => HandlerError::UpstreamTimeout(format!("no response within {d:?}")),
        e @ LookupError::Upstream(_) => HandlerError::Upstream(e.to_string()),
    }
}

/// Tool surface: NSP pass-through plus the cached user lookup.
pub struct GatewayHandler {
    api: NspApi,
    users: Arc<UserCache>,
}

impl GatewayHandler {
    pub fn new(api: NspApi, users: Arc<UserCache>) -> Self {
        Self { api, users }
    }

    async fn dispatch(&self, tool: ToolName, args: Option<Value>) -> Result<Value, HandlerError> {
        let value = match tool {
            ToolName::GetTickets => {
                let a: GetTicketsArgs = parse_args(args)?;
                let (page, size) = clamp_paging(a.page, a.page_size);
                self.api
                    .get_tickets(page, size, a.filters.map(Value::Object))
                    .await?
            }
            ToolName::GetTicketById => {
                let a: TicketIdArgs = parse_args(args)?;
                self.api.get_ticket_by_id(a.ticket_id).await?
            }
            ToolName::CreateTicket => {
                let a: CreateTicketArgs = parse_args(args)?;
                non_empty("title", &a.title)?;
                let mut body = a.fields.unwrap_or_default();
                body.insert("Title".to_string(), Value::String(a.title));
                if let Some(d) = a.description {
                    body.insert("Description".to_string(), Value::String(d));
                }
                self.api.create_ticket(Value::Object(body)).await?
            }
            ToolName::UpdateTicket => {
                let a: UpdateTicketArgs = parse_args(args)?;
                if a.updates.is_empty() {
                    return Err(HandlerError::InvalidArguments(
                        "updates must contain at least one field".to_string(),
                    ));
                }
                self.api
                    .update_ticket(a.ticket_id, Value::Object(a.updates))
                    .await?
            }
            ToolName::SearchEntities => {
                let a: SearchArgs = parse_args(args)?;
                non_empty("entity_type", &a.entity_type)?;
                let (page, size) = clamp_paging(a.page, a.page_size);
                self.api
                    .search_entities(&a.entity_type, &a.query, page, size)
                    .await?
            }
            ToolName::GetEntityTypes => {
                let _: NoArgs = parse_args(args)?;
                self.api.get_entity_types().await?
            }
            ToolName::GetEntityMetadata => {
                let a: EntityTypeArgs = parse_args(args)?;
                non_empty("entity_type", &a.entity_type)?;
                self.api.get_entity_metadata(&a.entity_type).await?
            }
            ToolName::GetAttachments => {
                let a: AttachmentsArgs = parse_args(args)?;
                self.api.get_attachments(&a.entity_type, a.entity_id).await?
            }
            ToolName::GetUserByEmail => {
                let a: EmailArgs = parse_args(args)?;
                if !a.email.contains('@') {
                    return Err(HandlerError::InvalidArguments(format!(
                        "not an email address: {}",
                        a.email
                    )));
                }
                self.users
                    .get_or_fetch(&a.email, &self.api)
                    .await
                    .map_err(lookup_error)?
            }
        };
        Ok(value)
    }
}

#[async_trait]
impl McpHandler for GatewayHandler {
    async fn list_tools(&self) -> Result<ListToolsResult, HandlerError> {
        Ok(ListToolsResult {
            tools: tool_catalog(),
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult, HandlerError> {
        let Some(tool) = ToolName::parse(&params.name) else {
            return Err(HandlerError::UnknownTool(params.name));
        };

        let started = std::time::Instant::now();
        let out = self
            .dispatch(tool, params.arguments)
            .instrument(tracing::info_span!("gateway.call_tool", tool = tool.as_str()))
            .await;

        let outcome = if out.is_ok() { "ok" } else { "error" };
        ticketbridge_otel::metrics().record_tool_call(tool.as_str(), outcome);
        info!(
            tool = tool.as_str(),
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call finished"
        );
        out.map(CallToolResult::json)
    }
}
