//! Error types for a3s-acp

use a3s_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{error_codes, JsonRpcError};
use crate::session::SessionState;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum AcpError {
    /// Connection broken or framing violated; fatal to the connection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unroutable JSON-RPC traffic
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Startup-fatal registration failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Startup-fatal configuration failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream model stream failed
    #[error("Model error: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AcpError {
    /// JSON-RPC error object sent back to the host for this failure.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            AcpError::Protocol(e) => e.code(),
            AcpError::Session(SessionError::UnknownSession(_)) => error_codes::INVALID_PARAMS,
            AcpError::Session(SessionError::InvalidStateTransition { .. }) => {
                error_codes::INVALID_STATE
            }
            AcpError::Session(SessionError::Handshake(_)) => error_codes::HANDSHAKE_FAILED,
            AcpError::Template(_) => error_codes::TEMPLATE_ERROR,
            AcpError::Tool(_) => error_codes::TOOL_ERROR,
            AcpError::Serialization(_) => error_codes::INVALID_PARAMS,
            AcpError::Transport(_)
            | AcpError::Registry(_)
            | AcpError::Config(_)
            | AcpError::Model(_)
            | AcpError::Internal(_) => error_codes::INTERNAL_ERROR,
        };
        JsonRpcError::new(code, self.to_string())
    }

    /// True for failures that end the connection rather than one request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AcpError::Transport(_))
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, AcpError>;

/// JSON-RPC level failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl ProtocolError {
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::Parse(_) => error_codes::PARSE_ERROR,
            ProtocolError::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            ProtocolError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            ProtocolError::InvalidParams(_) => error_codes::INVALID_PARAMS,
        }
    }
}

/// Session lifecycle failures; the session is left unchanged
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Invalid state transition for session {session_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Prompt template failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Template '{template}' is missing variable '{variable}'")]
    MissingVariable { template: String, variable: String },
}

/// Tool registration failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),
}

/// Why a tool call did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    ToolTimeout,
    ToolExecutionFailed,
    PermissionDenied,
    InvalidArguments,
    Cancelled,
}

/// Failed tool call outcome, surfaced to the host as a failed result
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ToolErrorKind::UnknownTool, format!("Unknown tool: {}", name))
    }

    pub fn timeout(name: &str, after: std::time::Duration) -> Self {
        Self::new(
            ToolErrorKind::ToolTimeout,
            format!("Tool '{}' timed out after {}ms", name, after.as_millis()),
        )
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ToolExecutionFailed, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::PermissionDenied, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidArguments, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ToolErrorKind::Cancelled, "Tool call cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_codes() {
        let err = AcpError::from(ProtocolError::MethodNotFound("foo/bar".into()));
        assert_eq!(err.to_rpc_error().code, -32601);

        let err = AcpError::from(SessionError::UnknownSession("s1".into()));
        assert_eq!(err.to_rpc_error().code, -32602);

        let err = AcpError::from(SessionError::InvalidStateTransition {
            session_id: "s1".into(),
            from: SessionState::Streaming,
            to: SessionState::Prompting,
        });
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32002);
        assert!(rpc.message.contains("Streaming"));

        let err = AcpError::from(TemplateError::UnknownTemplate("nope".into()));
        assert_eq!(err.to_rpc_error().code, -32003);
    }

    #[test]
    fn test_only_transport_errors_are_fatal() {
        assert!(AcpError::from(TransportError::Closed).is_fatal());
        assert!(!AcpError::Model("stream dropped".into()).is_fatal());
    }

    #[test]
    fn test_tool_error_serializes_snake_case_kind() {
        let err = ToolError::unknown_tool("delete_all");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unknown_tool");
        assert_eq!(json["message"], "Unknown tool: delete_all");
    }
}
