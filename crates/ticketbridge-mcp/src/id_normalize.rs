use crate::client_identity::ClientVariant;
use crate::jsonrpc::JsonRpcId;

/// Adapt a response id to what the client expects. The value never changes,
/// only its JSON representation.
///
/// Copilot Studio rejects numeric ids on responses, so integers are sent back
/// as their decimal string. Every other client gets the id exactly as sent.
pub fn normalize_response_id(id: JsonRpcId, variant: ClientVariant) -> JsonRpcId {
    match (variant, id) {
        (ClientVariant::CopilotStudio, JsonRpcId::Number(n)) => JsonRpcId::String(n.to_string()),
        (_, id) => id,
    }
}
