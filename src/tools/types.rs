//! Core types for dynamically dispatched tools

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::multiplexer::ChunkSender;
use crate::permissions::PermissionTier;

/// Lifecycle of one tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    PendingApproval,
    Approved,
    Denied,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallStatus::Completed | ToolCallStatus::Failed | ToolCallStatus::Cancelled
        )
    }
}

/// One invocation of a tool within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            output: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn complete(&mut self, output: String) {
        self.status = ToolCallStatus::Completed;
        self.output = Some(output);
        self.error = None;
    }

    pub(crate) fn fail(&mut self, error: ToolError) {
        self.status = if error.kind == crate::error::ToolErrorKind::Cancelled {
            ToolCallStatus::Cancelled
        } else {
            ToolCallStatus::Failed
        };
        self.error = Some(error);
    }
}

/// Execution context handed to a handler
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace root directory (sandbox boundary)
    pub workspace: PathBuf,
    pub session_id: String,
    pub call_id: String,
    abort: CancellationToken,
    output: Option<ChunkSender>,
}

impl ToolContext {
    pub fn new(
        workspace: PathBuf,
        session_id: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        // Canonicalize to handle symlinked temp dirs
        let workspace = workspace.canonicalize().unwrap_or(workspace);
        Self {
            workspace,
            session_id: session_id.into(),
            call_id: call_id.into(),
            abort: CancellationToken::new(),
            output: None,
        }
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_output(mut self, output: Option<ChunkSender>) -> Self {
        self.output = output;
        self
    }

    /// Cooperative abort signal; handlers should stop promptly once it fires.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Stream partial output to the host. Dropped silently once the session
    /// output is closed.
    pub fn emit(&self, text: impl Into<String>) {
        if let Some(output) = &self.output {
            let _ = output.output(text);
        }
    }

    /// Resolve an existing path, refusing anything outside the workspace.
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let canonical = self
            .workspace
            .join(path)
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("Failed to resolve path {}: {}", path, e))?;
        self.ensure_inside(&canonical, path)?;
        Ok(canonical)
    }

    /// Resolve a path for writing; the parent directory must exist.
    pub fn resolve_path_for_write(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.workspace.join(path);
        let (Some(parent), Some(file_name)) = (resolved.parent(), resolved.file_name()) else {
            anyhow::bail!("Invalid path: {}", path);
        };
        let parent = parent
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("Parent directory of {} is not usable: {}", path, e))?;
        self.ensure_inside(&parent, path)?;
        Ok(parent.join(file_name))
    }

    fn ensure_inside(&self, resolved: &Path, original: &str) -> Result<()> {
        if !resolved.starts_with(&self.workspace) {
            anyhow::bail!("Path escapes workspace: {}", original);
        }
        Ok(())
    }
}

/// Tool execution output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The executable half of a tool. Runs inside its own task.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        (self.0)(args, ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Tool definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Registered tool: schema, permission tier and handler
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema subset: `type`, `required`, per-property `type`
    pub schema: Value,
    pub tier: PermissionTier,
    /// Overrides the configured default timeout
    pub timeout: Option<Duration>,
    handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    /// New descriptor; defaults to an object schema and the AskHost tier.
    pub fn new(name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema: serde_json::json!({"type": "object"}),
            tier: PermissionTier::AskHost,
            timeout: None,
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_tier(mut self, tier: PermissionTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        self.handler.clone()
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.clone(),
        }
    }

    /// Check `args` against the schema subset. `null` counts as `{}`.
    pub fn validate_args(&self, args: &Value) -> std::result::Result<(), ToolError> {
        let empty = Value::Object(Default::default());
        let args = if args.is_null() { &empty } else { args };

        if let Some(expected) = self.schema.get("type").and_then(Value::as_str) {
            if !type_matches(expected, args) {
                return Err(ToolError::invalid_arguments(format!(
                    "{}: arguments must be of type {}",
                    self.name, expected
                )));
            }
        }

        if let Some(required) = self.schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if args.get(field).map_or(true, Value::is_null) {
                    return Err(ToolError::invalid_arguments(format!(
                        "{}: missing required argument '{}'",
                        self.name, field
                    )));
                }
            }
        }

        if let Some(props) = self.schema.get("properties").and_then(Value::as_object) {
            for (key, prop) in props {
                let (Some(value), Some(expected)) =
                    (args.get(key), prop.get("type").and_then(Value::as_str))
                else {
                    continue;
                };
                if !value.is_null() && !type_matches(expected, value) {
                    return Err(ToolError::invalid_arguments(format!(
                        "{}: argument '{}' must be of type {}",
                        self.name, key, expected
                    )));
                }
            }
        }

        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, noting the cut.
pub fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let total = text.len();
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(&format!("\n... [output truncated: {} of {} bytes shown]", cut, total));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn ToolHandler> {
        handler_fn(|_args, _ctx| async { Ok(ToolOutput::success("ok")) })
    }

    // ========================================================================
    // ToolContext
    // ========================================================================

    #[test]
    fn test_resolve_path_stays_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), "test").unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf(), "s", "call_1");

        assert!(ctx.resolve_path("file.txt").is_ok());
        assert!(ctx.resolve_path("nonexistent.txt").is_err());
        assert!(ctx.resolve_path("../").is_err());
    }

    #[test]
    fn test_resolve_path_for_write() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf(), "s", "call_1");

        let path = ctx.resolve_path_for_write("new.txt").unwrap();
        assert!(path.ends_with("new.txt"));
        assert!(ctx.resolve_path_for_write("missing/new.txt").is_err());
        assert!(ctx.resolve_path_for_write("../escape.txt").is_err());
    }

    #[test]
    fn test_abort_token() {
        let token = CancellationToken::new();
        let ctx = ToolContext::new(PathBuf::from("."), "s", "c").with_abort(token.clone());
        assert!(!ctx.is_aborted());
        token.cancel();
        assert!(ctx.is_aborted());
        // no output sink attached
        ctx.emit("ignored");
    }

    // ========================================================================
    // Schema subset
    // ========================================================================

    #[test]
    fn test_validate_required_and_types() {
        let desc = ToolDescriptor::new("read_file", noop()).with_schema(json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "limit": {"type": "integer"}},
            "required": ["path"]
        }));

        assert!(desc.validate_args(&json!({"path": "a.txt"})).is_ok());
        assert!(desc.validate_args(&json!({"path": "a.txt", "limit": null})).is_ok());

        let err = desc.validate_args(&json!({})).unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::InvalidArguments);
        assert!(err.message.contains("'path'"));

        assert!(desc.validate_args(&json!({"path": 3})).is_err());
        assert!(desc.validate_args(&json!({"path": "a", "limit": 1.5})).is_err());
        assert!(desc.validate_args(&json!(["a.txt"])).is_err());
    }

    #[test]
    fn test_null_args_are_empty_object() {
        let desc = ToolDescriptor::new("ping", noop());
        assert!(desc.validate_args(&Value::Null).is_ok());
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    #[test]
    fn test_truncate_output_on_char_boundary() {
        let text = "héllo wörld".to_string();
        let out = truncate_output(text.clone(), 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("output truncated"));
        assert_eq!(truncate_output(text.clone(), 100), text);
    }

    #[test]
    fn test_status_terminality() {
        assert!(ToolCallStatus::Completed.is_terminal());
        assert!(ToolCallStatus::Cancelled.is_terminal());
        assert!(!ToolCallStatus::Denied.is_terminal());
        assert!(!ToolCallStatus::PendingApproval.is_terminal());
    }

    #[test]
    fn test_fail_with_cancelled_marks_cancelled() {
        let mut call = ToolCall::new("call_1", "run_cmd", json!({}));
        call.fail(ToolError::cancelled());
        assert_eq!(call.status, ToolCallStatus::Cancelled);
        call.fail(ToolError::execution_failed("boom"));
        assert_eq!(call.status, ToolCallStatus::Failed);
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = handler_fn(|args, ctx| async move {
            Ok(ToolOutput::success(format!("{}:{}", ctx.call_id, args["x"])))
        });
        let ctx = ToolContext::new(PathBuf::from("."), "s", "call_7");
        let out = handler.invoke(json!({"x": 1}), ctx).await.unwrap();
        assert_eq!(out.content, "call_7:1");
    }
}
