//! Runtime context
//!
//! Everything fixed at startup (configuration, tool registry, prompt
//! templates, model client) lives in one [`Runtime`] shared by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::model::{EchoModel, ModelClient};
use crate::prompts::TemplateStore;
use crate::tools::{builtin_tools, load_overrides, ToolDescriptor, ToolOverride, ToolRegistry};

pub struct Runtime {
    pub config: RuntimeConfig,
    pub registry: Arc<ToolRegistry>,
    pub templates: TemplateStore,
    pub model: Arc<dyn ModelClient>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("tools", &self.registry.names())
            .field("templates", &self.templates.names())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }
}

/// Assembles a [`Runtime`]. Registration errors are startup-fatal.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    builtins: bool,
    tools: Vec<ToolDescriptor>,
    templates: Option<TemplateStore>,
    model: Option<Arc<dyn ModelClient>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            builtins: false,
            tools: Vec::new(),
            templates: None,
            model: None,
        }
    }

    /// Register `read_file`, `write_file` and `run_cmd`.
    pub fn with_builtins(mut self) -> Self {
        self.builtins = true;
        self
    }

    pub fn tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.tools.push(descriptor);
        self
    }

    pub fn tools(mut self, descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        self.tools.extend(descriptors);
        self
    }

    /// Use these templates instead of built-ins plus bundle.
    pub fn templates(mut self, templates: TemplateStore) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let bundle = self.config.bundle_dir.clone();

        let templates = match (self.templates, &bundle) {
            (Some(templates), _) => templates,
            (None, Some(bundle)) => TemplateStore::with_dir(&bundle.join("prompts"))?,
            (None, None) => TemplateStore::builtin(),
        };
        let overrides: HashMap<String, ToolOverride> = match &bundle {
            Some(bundle) => load_overrides(bundle)?,
            None => HashMap::new(),
        };

        let mut registry = ToolRegistry::new();
        let descriptors = if self.builtins {
            builtin_tools().into_iter().chain(self.tools).collect()
        } else {
            self.tools
        };
        for descriptor in descriptors {
            let descriptor = match overrides.get(&descriptor.name) {
                Some(over) => over.apply(descriptor),
                None => descriptor,
            };
            registry.register(descriptor)?;
        }
        for name in overrides.keys().filter(|name| !registry.contains(name)) {
            tracing::warn!("Override for unregistered tool ignored: {}", name);
        }

        tracing::info!(
            tools = registry.len(),
            templates = templates.len(),
            bundle = ?bundle,
            "Runtime ready"
        );
        Ok(Runtime {
            config: self.config,
            registry: Arc::new(registry),
            templates,
            model: self.model.unwrap_or_else(|| Arc::new(EchoModel)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AcpError;
    use crate::permissions::PermissionTier;
    use crate::tools::{handler_fn, ToolOutput};
    use std::time::Duration;

    fn noop(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(
            name,
            handler_fn(|_args, _ctx| async { Ok(ToolOutput::success("ok")) }),
        )
    }

    #[test]
    fn test_builtins_registered() {
        let runtime = Runtime::builder(RuntimeConfig::default())
            .with_builtins()
            .build()
            .unwrap();
        let mut names = runtime.registry.names();
        names.sort();
        assert_eq!(names, vec!["read_file", "run_cmd", "write_file"]);
        assert!(runtime.templates.contains("system"));
    }

    #[test]
    fn test_duplicate_tool_is_fatal() {
        let err = Runtime::builder(RuntimeConfig::default())
            .with_builtins()
            .tool(noop("read_file"))
            .build()
            .unwrap_err();
        assert!(matches!(err, AcpError::Registry(_)));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let err = Runtime::builder(RuntimeConfig::default().with_max_concurrent_tools(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, AcpError::Config(_)));
    }

    #[test]
    fn test_bundle_overrides_and_templates() {
        let bundle = tempfile::tempdir().unwrap();
        std::fs::create_dir(bundle.path().join("prompts")).unwrap();
        std::fs::write(bundle.path().join("prompts/greet.md"), "Hello {name}").unwrap();
        std::fs::write(
            bundle.path().join("tools.yaml"),
            "run_cmd:\n  permission: never\n  timeoutMs: 500\n",
        )
        .unwrap();

        let runtime = Runtime::builder(RuntimeConfig::default().with_bundle_dir(bundle.path()))
            .with_builtins()
            .build()
            .unwrap();

        let run_cmd = runtime.registry.get("run_cmd").unwrap();
        assert_eq!(run_cmd.tier, PermissionTier::Deny);
        assert_eq!(run_cmd.timeout, Some(Duration::from_millis(500)));
        assert!(runtime.templates.contains("greet"));
        assert!(runtime.templates.contains("system"));
    }
}
