//! Tool Registry
//!
//! Name-keyed table of tool descriptors. Populated once at startup, then
//! shared read-only behind an `Arc`; names can never be re-registered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::types::{ToolDescriptor, ToolSpec};
use crate::error::{AcpError, RegistryError, Result};
use crate::permissions::PermissionTier;

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a duplicate name is a startup-fatal error.
    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
    ) -> std::result::Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        tracing::debug!(tier = ?descriptor.tier, "Registering tool: {}", descriptor.name);
        self.tools.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions offered to the model, sorted by name
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|d| d.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Per-tool adjustments read from the bundle's `tools.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolOverride {
    pub description: Option<String>,
    #[serde(alias = "permission")]
    pub tier: Option<PermissionTier>,
    pub timeout_ms: Option<u64>,
}

impl ToolOverride {
    pub fn apply(&self, mut descriptor: ToolDescriptor) -> ToolDescriptor {
        if let Some(description) = &self.description {
            descriptor.description = description.clone();
        }
        if let Some(tier) = self.tier {
            descriptor.tier = tier;
        }
        if let Some(ms) = self.timeout_ms {
            descriptor.timeout = Some(Duration::from_millis(ms));
        }
        descriptor
    }
}

/// Load `tools.yaml` (or `tools.json`) from a bundle; absent files yield none.
pub fn load_overrides(bundle: &Path) -> Result<HashMap<String, ToolOverride>> {
    for (file, yaml) in [("tools.yaml", true), ("tools.yml", true), ("tools.json", false)] {
        let path = bundle.join(file);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AcpError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let parsed: std::result::Result<HashMap<String, ToolOverride>, String> = if yaml {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };
        return parsed
            .map_err(|e| AcpError::Config(format!("Failed to parse {}: {}", path.display(), e)));
    }
    Ok(HashMap::new())
}
