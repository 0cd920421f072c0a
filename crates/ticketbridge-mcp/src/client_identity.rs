use serde::{Deserialize, Serialize};

use crate::types::ClientInfo;

/// Known MCP client families. Drives response id typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientVariant {
    CopilotStudio,
    McpInspector,
    #[default]
    Unknown,
}

impl ClientVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientVariant::CopilotStudio => "copilot_studio",
            ClientVariant::McpInspector => "mcp_inspector",
            ClientVariant::Unknown => "unknown",
        }
    }
}

const COPILOT_CHANNEL_ID: &str = "pva-studio";
const MCP_INSPECTOR_NAME: &str = "mcp-inspector";
const COPILOT_NAME_KEYWORDS: &[&str] = &["copilot", "customerservice", "customerservicebot"];

/// Lower-cased, trimmed view of the fields the rules look at.
struct Signals {
    name: Option<String>,
    agent_name: Option<String>,
    channel_id: Option<String>,
}

impl Signals {
    fn from_client_info(info: &ClientInfo) -> Self {
        fn fold(v: &Option<String>) -> Option<String> {
            v.as_deref()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
        }
        Self {
            name: fold(&info.name),
            agent_name: fold(&info.agent_name),
            channel_id: fold(&info.channel_id),
        }
    }
}

struct Rule {
    name: &'static str,
    variant: ClientVariant,
    matches: fn(&Signals) -> bool,
}

fn channel_is_copilot(s: &Signals) -> bool {
    s.channel_id.as_deref() == Some(COPILOT_CHANNEL_ID)
}

fn name_is_inspector(s: &Signals) -> bool {
    s.name.as_deref() == Some(MCP_INSPECTOR_NAME)
}

fn name_has_copilot_keyword(s: &Signals) -> bool {
    [s.name.as_deref(), s.agent_name.as_deref()]
        .into_iter()
        .flatten()
        .any(|field| COPILOT_NAME_KEYWORDS.iter().any(|kw| field.contains(kw)))
}

/// Ordered by reliability; the first matching rule decides.
const RULES: &[Rule] = &[
    // Platform-level signal, not user-editable.
    Rule {
        name: "copilot_channel_id",
        variant: ClientVariant::CopilotStudio,
        matches: channel_is_copilot,
    },
    Rule {
        name: "inspector_name",
        variant: ClientVariant::McpInspector,
        matches: name_is_inspector,
    },
    // Legacy heuristic on display names.
    Rule {
        name: "copilot_name_keyword",
        variant: ClientVariant::CopilotStudio,
        matches: name_has_copilot_keyword,
    },
];

/// Classify a client from its `clientInfo`. Total: unmatched input is `Unknown`.
pub fn resolve_client_variant(info: &ClientInfo) -> ClientVariant {
    let signals = Signals::from_client_info(info);
    RULES
        .iter()
        .find(|rule| (rule.matches)(&signals))
        .map(|rule| {
            tracing::debug!(rule = rule.name, variant = rule.variant.as_str(), "client identified");
            rule.variant
        })
        .unwrap_or(ClientVariant::Unknown)
}
