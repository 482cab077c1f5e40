//! Built-in tools: `read_file`, `write_file`, `run_cmd`
//!
//! All paths are resolved inside the session's working directory.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::types::{ToolContext, ToolDescriptor, ToolHandler, ToolOutput};
use crate::permissions::PermissionTier;

/// Descriptors for every built-in tool
pub fn builtin_tools() -> Vec<ToolDescriptor> {
    vec![read_file(), write_file(), run_cmd()]
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("'{}' must be a string", key))
}

// ============================================================================
// read_file
// ============================================================================

pub fn read_file() -> ToolDescriptor {
    ToolDescriptor::new("read_file", Arc::new(ReadFile))
        .with_description(
            "Read a UTF-8 text file. Optional `offset` (1-based first line) and `limit` \
             (line count) select a range.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "offset": {"type": "integer"},
                "limit": {"type": "integer"}
            },
            "required": ["path"]
        }))
        .with_tier(PermissionTier::AutoAllow)
}

struct ReadFile;

#[async_trait]
impl ToolHandler for ReadFile {
    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let resolved = ctx.resolve_path(path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .with_context(|| format!("Failed to read {}", path))?;

        let offset = args.get("offset").and_then(Value::as_u64);
        let limit = args.get("limit").and_then(Value::as_u64);
        if offset.is_none() && limit.is_none() {
            return Ok(ToolOutput::success(content));
        }

        let skip = offset.unwrap_or(1).saturating_sub(1) as usize;
        let take = limit.map_or(usize::MAX, |l| l as usize);
        let selected: Vec<&str> = content.lines().skip(skip).take(take).collect();
        Ok(ToolOutput::success(selected.join("\n")))
    }
}

// ============================================================================
// write_file
// ============================================================================

pub fn write_file() -> ToolDescriptor {
    ToolDescriptor::new("write_file", Arc::new(WriteFile))
        .with_description("Create or overwrite a file with the given content.")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        }))
        .with_tier(PermissionTier::AskHost)
}

struct WriteFile;

#[async_trait]
impl ToolHandler for WriteFile {
    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        let resolved = ctx.resolve_path_for_write(path)?;
        tokio::fs::write(&resolved, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(ToolOutput::success(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path
        )))
    }
}

// ============================================================================
// run_cmd
// ============================================================================

pub fn run_cmd() -> ToolDescriptor {
    ToolDescriptor::new("run_cmd", Arc::new(RunCmd))
        .with_description(
            "Run a command (no shell) in the working directory. Stdout is streamed; \
             a non-zero exit fails the call.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {"command": {"type": "string"}},
            "required": ["command"]
        }))
        .with_tier(PermissionTier::AskHost)
}

struct RunCmd;

#[async_trait]
impl ToolHandler for RunCmd {
    async fn invoke(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let command = str_arg(&args, "command")?;
        let words = shell_words::split(command)
            .with_context(|| format!("Failed to parse command: {}", command))?;
        let (program, rest) = words
            .split_first()
            .ok_or_else(|| anyhow!("command is empty"))?;

        let mut child = Command::new(program)
            .args(rest)
            .current_dir(&ctx.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", program))?;

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("No stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| anyhow!("No stderr"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let abort = ctx.abort_token().clone();
        let mut lines = BufReader::new(stdout).lines();
        let mut collected = String::new();
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        ctx.emit(format!("{}\n", line));
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                    None => break,
                },
                _ = abort.cancelled() => {
                    let _ = child.kill().await;
                    anyhow::bail!("command aborted: {}", command);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = abort.cancelled() => {
                let _ = child.kill().await;
                anyhow::bail!("command aborted: {}", command);
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();
        collected.push_str(&stderr);

        let code = status.code().unwrap_or(-1);
        let output = if status.success() {
            ToolOutput::success(collected)
        } else {
            ToolOutput::error(format!("{}exit code {}", collected, code))
        };
        Ok(output.with_metadata(json!({"exitCode": code})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir.to_path_buf(), "s1", "call_1")
    }

    #[test]
    fn test_builtin_tiers() {
        let tools = builtin_tools();
        let tier = |name: &str| tools.iter().find(|t| t.name == name).unwrap().tier;
        assert_eq!(tier("read_file"), PermissionTier::AutoAllow);
        assert_eq!(tier("write_file"), PermissionTier::AskHost);
        assert_eq!(tier("run_cmd"), PermissionTier::AskHost);
    }

    #[tokio::test]
    async fn test_read_file_whole_and_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("lines.txt"), "1\n2\n3\n4\n").unwrap();

        let out = ReadFile
            .invoke(json!({"path": "a.txt"}), ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.content, "hello");

        let out = ReadFile
            .invoke(json!({"path": "lines.txt", "offset": 2, "limit": 2}), ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.content, "2\n3");
    }

    #[tokio::test]
    async fn test_read_file_outside_workspace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFile
            .invoke(json!({"path": "../../etc/passwd"}), ctx(dir.path()))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteFile
            .invoke(json!({"path": "out.txt", "content": "data"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_cmd_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = RunCmd
            .invoke(json!({"command": "echo 'hi there'"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.content, "hi there\n");
        assert_eq!(out.metadata.unwrap()["exitCode"], 0);

        let out = RunCmd
            .invoke(json!({"command": "false"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.content.contains("exit code 1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_cmd_honors_abort() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let context = ctx(dir.path()).with_abort(token.clone());
        let run = tokio::spawn(async move {
            RunCmd.invoke(json!({"command": "sleep 30"}), context).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().to_string().contains("aborted"));
    }

    #[tokio::test]
    async fn test_run_cmd_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunCmd
            .invoke(json!({"command": "   "}), ctx(dir.path()))
            .await
            .is_err());
    }
}
