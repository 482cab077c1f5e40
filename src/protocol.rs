//! JSON-RPC 2.0 envelopes and the agent-host method catalogue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ProtocolError, ToolError};
use crate::session::SessionMode;
use crate::tools::ToolCallStatus;

/// Protocol revision spoken by this runtime.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest host revision still accepted at handshake.
pub const MIN_PROTOCOL_VERSION: u32 = 1;
pub const JSONRPC_VERSION: &str = "2.0";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_SET_MODE: &str = "session/set_mode";
    pub const SESSION_CLOSE: &str = "session/close";
    pub const SESSION_UPDATE: &str = "session/update";
    pub const TOOL_CALL: &str = "tool/call";
    pub const TOOL_RESULT: &str = "tool/result";
    pub const TOOL_PERMISSION: &str = "tool/permission";
    pub const SHUTDOWN: &str = "shutdown";
}

pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const HANDSHAKE_FAILED: i32 = -32001;
    pub const INVALID_STATE: i32 = -32002;
    pub const TEMPLATE_ERROR: i32 = -32003;
    pub const TOOL_ERROR: i32 = -32004;
}

// ============================================================================
// Envelopes
// ============================================================================

/// Request id; hosts may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// `null` only when the request id could not be determined
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any envelope that can travel in either direction.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classify one inbound unit.
    ///
    /// Undecodable JSON is a parse error; valid JSON that is not a JSON-RPC
    /// envelope is an invalid request.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        let Some(obj) = value.as_object() else {
            return Err(ProtocolError::InvalidRequest(
                "expected a JSON object".to_string(),
            ));
        };
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(ProtocolError::InvalidRequest(
                "missing or unsupported jsonrpc version".to_string(),
            ));
        }
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        let invalid = |e: serde_json::Error| ProtocolError::InvalidRequest(e.to_string());

        if obj.contains_key("method") {
            if has_id {
                serde_json::from_value(value).map(Self::Request).map_err(invalid)
            } else {
                serde_json::from_value(value)
                    .map(Self::Notification)
                    .map_err(invalid)
            }
        } else if obj.contains_key("result") || obj.contains_key("error") {
            serde_json::from_value(value).map(Self::Response).map_err(invalid)
        } else {
            Err(ProtocolError::InvalidRequest(
                "neither a request, a notification nor a response".to_string(),
            ))
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }
}

/// Decode method params, mapping failures to `InvalidParams`.
pub fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> Result<T, ProtocolError> {
    // absent params read as `{}` so all-optional param types still parse
    serde_json::from_value(params.unwrap_or_else(|| Value::Object(Default::default())))
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    #[serde(default)]
    pub client_capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: u32,
    pub agent_capabilities: AgentCapabilities,
    pub agent_info: AgentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub prompt_templates: Vec<String>,
    pub tool_streaming: bool,
    pub session_modes: bool,
    pub binary_framing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub mode: Option<SessionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
    pub modes: SessionModes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModes {
    pub current_mode_id: SessionMode,
    pub available_modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeInfo {
    pub id: SessionMode,
    pub name: String,
}

// ============================================================================
// Session methods
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: String,
}

/// One block of a host prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Template {
        name: String,
        #[serde(default)]
        variables: HashMap<String, String>,
    },
    Resource {
        resource: EmbeddedResource,
    },
    ResourceLink(ResourceLink),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Text content the host inlined into the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedResource {
    pub uri: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl EmbeddedResource {
    pub fn prompt_text(&self) -> String {
        format!("path: {}\ncontent: {}", self.uri, self.text)
    }
}

/// A reference to a resource the agent may read itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLink {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ResourceLink {
    /// One `key: value` line per present field, in a fixed order.
    pub fn prompt_text(&self) -> String {
        let mut lines = vec![format!("uri: {}", self.uri), format!("name: {}", self.name)];
        if let Some(title) = &self.title {
            lines.push(format!("title: {title}"));
        }
        if let Some(description) = &self.description {
            lines.push(format!("description: {description}"));
        }
        if let Some(mime_type) = &self.mime_type {
            lines.push(format!("mimeType: {mime_type}"));
        }
        if let Some(size) = self.size {
            lines.push(format!("size: {size}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    pub session_id: String,
    pub prompt: Vec<ContentBlock>,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
    MaxTurnRequests,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeParams {
    pub session_id: String,
    pub mode_id: String,
}

/// Streamed session event, the `update` of a `session/update` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionUpdate {
    #[serde(rename_all = "camelCase")]
    AgentMessageChunk { turn: u64, seq: u64, text: String },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        seq: u64,
        status: ToolCallStatus,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputChunk {
        tool_call_id: String,
        seq: u64,
        text: String,
    },
    StreamEnd { origin: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    pub session_id: String,
    pub update: SessionUpdate,
}

// ============================================================================
// Tool methods
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallParams {
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Informational `tool/call` notification sent when the agent starts a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallNotice {
    pub session_id: String,
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Terminal outcome of one call; the `tool/call` result and `tool/result` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultParams {
    pub session_id: String,
    #[serde(flatten)]
    pub result: ToolCallResult,
}

/// Host answer to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    Cancelled,
}

impl PermissionOutcome {
    pub fn is_allow(self) -> bool {
        matches!(self, PermissionOutcome::AllowOnce | PermissionOutcome::AllowAlways)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: PermissionOutcome,
    pub name: String,
}

impl PermissionOption {
    /// The options offered with every approval request.
    pub fn standard() -> Vec<Self> {
        vec![
            Self {
                option_id: PermissionOutcome::AllowOnce,
                name: "Allow once".to_string(),
            },
            Self {
                option_id: PermissionOutcome::AllowAlways,
                name: "Always allow".to_string(),
            },
            Self {
                option_id: PermissionOutcome::RejectOnce,
                name: "Reject".to_string(),
            },
        ]
    }
}

/// Agent-to-host `tool/permission` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    pub session_id: String,
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub outcome: PermissionOutcome,
}

/// Host-to-agent `tool/permission` notification, the alternative answer path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionNotification {
    pub session_id: String,
    pub tool_call_id: String,
    pub outcome: PermissionOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========================================================================
    // Envelope classification
    // ========================================================================

    #[test]
    fn test_parse_request_notification_response() {
        let req = br#"{"jsonrpc":"2.0","id":7,"method":"session/new","params":{}}"#;
        match JsonRpcMessage::parse(req).unwrap() {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, RequestId::Number(7));
                assert_eq!(r.method, "session/new");
            }
            other => panic!("expected request, got {other:?}"),
        }

        let note = br#"{"jsonrpc":"2.0","method":"session/cancel","params":{"sessionId":"s"}}"#;
        assert!(matches!(
            JsonRpcMessage::parse(note).unwrap(),
            JsonRpcMessage::Notification(_)
        ));

        let resp = br#"{"jsonrpc":"2.0","id":"abc","result":{"outcome":"allow_once"}}"#;
        match JsonRpcMessage::parse(resp).unwrap() {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.id, Some(RequestId::String("abc".into())));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            JsonRpcMessage::parse(b"{not json"),
            Err(ProtocolError::Parse(_))
        ));
        assert!(matches!(
            JsonRpcMessage::parse(b"[1,2]"),
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert!(matches!(
            JsonRpcMessage::parse(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#),
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert!(matches!(
            JsonRpcMessage::parse(br#"{"jsonrpc":"2.0","id":1}"#),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = JsonRpcResponse::failure(
            None,
            JsonRpcError::new(error_codes::PARSE_ERROR, "Parse error"),
        );
        let value = serde_json::to_value(JsonRpcMessage::Response(resp)).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32700, "message": "Parse error"}
            })
        );
    }

    // ========================================================================
    // Params
    // ========================================================================

    #[test]
    fn test_content_blocks() {
        let prompt: PromptParams = parse_params(Some(json!({
            "sessionId": "s1",
            "prompt": [
                {"type": "text", "text": "hi"},
                {"type": "template", "name": "fix_error", "variables": {"path": "a.rs"}}
            ]
        })))
        .unwrap();
        assert_eq!(prompt.prompt[0], ContentBlock::text("hi"));
        match &prompt.prompt[1] {
            ContentBlock::Template { name, variables } => {
                assert_eq!(name, "fix_error");
                assert_eq!(variables["path"], "a.rs");
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn test_resource_blocks() {
        let prompt: PromptParams = parse_params(Some(json!({
            "sessionId": "s1",
            "prompt": [
                {"type": "resource", "resource": {
                    "uri": "file:///home/main.py",
                    "text": "print('hi')",
                    "mimeType": "text/x-python"
                }},
                {"type": "resource_link", "uri": "file:///home/minimal.txt",
                 "name": "minimal.txt"},
                {"type": "resource_link", "uri": "file:///home/document.pdf",
                 "name": "document.pdf", "title": "Important Document",
                 "description": "Project specifications", "mimeType": "application/pdf",
                 "size": 1024}
            ]
        })))
        .unwrap();

        match &prompt.prompt[0] {
            ContentBlock::Resource { resource } => {
                assert_eq!(resource.mime_type.as_deref(), Some("text/x-python"));
                assert_eq!(
                    resource.prompt_text(),
                    "path: file:///home/main.py\ncontent: print('hi')"
                );
            }
            other => panic!("unexpected block {other:?}"),
        }
        match &prompt.prompt[1] {
            ContentBlock::ResourceLink(link) => assert_eq!(
                link.prompt_text(),
                "uri: file:///home/minimal.txt\nname: minimal.txt"
            ),
            other => panic!("unexpected block {other:?}"),
        }
        match &prompt.prompt[2] {
            ContentBlock::ResourceLink(link) => assert_eq!(
                link.prompt_text(),
                "uri: file:///home/document.pdf\nname: document.pdf\n\
                 title: Important Document\ndescription: Project specifications\n\
                 mimeType: application/pdf\nsize: 1024"
            ),
            other => panic!("unexpected block {other:?}"),
        }

        let missing_name = json!({"type": "resource_link", "uri": "file:///x"});
        assert!(serde_json::from_value::<ContentBlock>(missing_name).is_err());
    }

    #[test]
    fn test_parse_params_invalid() {
        let err = parse_params::<SessionIdParams>(Some(json!({"id": 1}))).unwrap_err();
        assert_eq!(err.code(), error_codes::INVALID_PARAMS);
        assert!(parse_params::<SessionIdParams>(None).is_err());
        assert!(parse_params::<NewSessionParams>(None).is_ok());
    }

    #[test]
    fn test_session_update_wire_format() {
        let update = SessionUpdate::ToolCallUpdate {
            tool_call_id: "call_1".into(),
            seq: 0,
            status: ToolCallStatus::PendingApproval,
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({
                "kind": "tool_call_update",
                "toolCallId": "call_1",
                "seq": 0,
                "status": "pending_approval"
            })
        );
        assert_eq!(
            serde_json::to_value(SessionUpdate::Cancelled).unwrap(),
            json!({"kind": "cancelled"})
        );
    }

    #[test]
    fn test_tool_result_flattened() {
        let params = ToolResultParams {
            session_id: "s1".into(),
            result: ToolCallResult {
                tool_call_id: "call_2".into(),
                status: ToolCallStatus::Completed,
                output: Some("hello".into()),
                error: None,
            },
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({
                "sessionId": "s1",
                "toolCallId": "call_2",
                "status": "completed",
                "output": "hello"
            })
        );
    }
}
