//! Runtime configuration
//!
//! Loaded from a JSON or YAML file (chosen by extension) and overridden by
//! CLI flags. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use a3s_transport::Framing;

use crate::error::{AcpError, Result};
use crate::permissions::PermissionPolicy;
use crate::session::SessionMode;

/// Wire framing selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingKind {
    #[default]
    Lines,
    Binary,
}

impl From<FramingKind> for Framing {
    fn from(kind: FramingKind) -> Self {
        match kind {
            FramingKind::Lines => Framing::Lines,
            FramingKind::Binary => Framing::Binary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Read-only bundle with `prompts/*.md` and `tools.yaml`
    pub bundle_dir: Option<PathBuf>,
    /// Working directory for sessions that do not send `cwd`
    pub workspace: Option<PathBuf>,
    pub framing: FramingKind,
    pub approval_timeout_ms: u64,
    pub max_concurrent_tools: usize,
    pub tool_timeout_ms: u64,
    pub cancel_grace_ms: u64,
    pub idle_timeout_ms: u64,
    pub protocol_error_threshold: u32,
    pub max_output_bytes: usize,
    pub max_model_rounds: usize,
    pub default_mode: SessionMode,
    pub log_level: String,
    pub policy: PermissionPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bundle_dir: None,
            workspace: None,
            framing: FramingKind::Lines,
            approval_timeout_ms: 30_000,
            max_concurrent_tools: 4,
            tool_timeout_ms: 120_000,
            cancel_grace_ms: 2_000,
            idle_timeout_ms: 30 * 60 * 1000,
            protocol_error_threshold: 8,
            max_output_bytes: 16_000,
            max_model_rounds: 32,
            default_mode: SessionMode::ApprovalRequired,
            log_level: "info".to_string(),
            policy: PermissionPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AcpError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| {
                AcpError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                AcpError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tools == 0 {
            return Err(AcpError::Config(
                "maxConcurrentTools must be at least 1".to_string(),
            ));
        }
        if self.approval_timeout_ms == 0 {
            return Err(AcpError::Config(
                "approvalTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if self.max_model_rounds == 0 {
            return Err(AcpError::Config(
                "maxModelRounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_dir = Some(dir.into());
        self
    }

    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace = Some(dir.into());
        self
    }

    pub fn with_framing(mut self, framing: FramingKind) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_tools(mut self, max: usize) -> Self {
        self.max_concurrent_tools = max;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_protocol_error_threshold(mut self, threshold: u32) -> Self {
        self.protocol_error_threshold = threshold;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_max_model_rounds(mut self, rounds: usize) -> Self {
        self.max_model_rounds = rounds;
        self
    }

    pub fn with_default_mode(mut self, mode: SessionMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
