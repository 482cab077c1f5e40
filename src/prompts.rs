// Prompt templates
//
// Built-in templates are compiled in with `include_str!`; a bundle directory
// may add more (`<bundle>/prompts/*.md`, name = file stem) or replace a
// built-in by reusing its name.
//
//   prompts/
//   ├── system.md          : session system prompt; `{cwd}`, `{mode}`, `{tools}`
//   ├── fix_error.md       : fix a failing file; `{path}`, `{error}`
//   └── review_changes.md  : review a diff; `{diff}`

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{AcpError, Result, TemplateError};

/// Session system prompt. Placeholders: `{cwd}`, `{mode}`, `{tools}`
pub const SYSTEM: &str = include_str!("../prompts/system.md");

/// Placeholders: `{path}`, `{error}`
pub const FIX_ERROR: &str = include_str!("../prompts/fix_error.md");

/// Placeholder: `{diff}`
pub const REVIEW_CHANGES: &str = include_str!("../prompts/review_changes.md");

/// Name of the template rendered into every turn's system prompt
pub const SYSTEM_TEMPLATE: &str = "system";

/// Cached regex for `{name}` placeholders
fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// An immutable named template and the variables it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    name: String,
    text: String,
    variables: Vec<String>,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut variables: Vec<String> = Vec::new();
        for cap in placeholder().captures_iter(&text) {
            let var = &cap[1];
            if !variables.iter().any(|v| v == var) {
                variables.push(var.to_string());
            }
        }
        Self {
            name: name.into(),
            text,
            variables,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Declared variables in order of first appearance.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Substitute every declared variable in one pass. Values are inserted
    /// verbatim and never re-scanned for placeholders; extra values are ignored.
    pub fn render(
        &self,
        values: &HashMap<String, String>,
    ) -> std::result::Result<String, TemplateError> {
        if let Some(missing) = self.variables.iter().find(|v| !values.contains_key(*v)) {
            return Err(TemplateError::MissingVariable {
                template: self.name.clone(),
                variable: missing.clone(),
            });
        }
        Ok(placeholder()
            .replace_all(&self.text, |cap: &regex::Captures<'_>| {
                values.get(&cap[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }
}

/// Name-keyed, read-only template table.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateStore {
    /// Empty store, for tests and embedders that bring their own templates
    pub fn new() -> Self {
        Self::default()
    }

    /// The templates compiled into the binary
    pub fn builtin() -> Self {
        Self::new()
            .with_template(PromptTemplate::new(SYSTEM_TEMPLATE, SYSTEM))
            .with_template(PromptTemplate::new("fix_error", FIX_ERROR))
            .with_template(PromptTemplate::new("review_changes", REVIEW_CHANGES))
    }

    /// Built-ins plus every `*.md` file in `dir`.
    pub fn with_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::builtin();
        for template in load_dir(dir)? {
            store = store.with_template(template);
        }
        Ok(store)
    }

    /// Add a template, replacing any with the same name.
    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.templates.insert(template.name.clone(), template);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Template names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn render(
        &self,
        name: &str,
        values: &HashMap<String, String>,
    ) -> std::result::Result<String, TemplateError> {
        self.get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?
            .render(values)
    }
}

/// Read `*.md` templates from a directory; a missing directory yields none.
pub fn load_dir(dir: &Path) -> Result<Vec<PromptTemplate>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| {
        AcpError::Config(format!("Failed to read prompt directory {}: {}", dir.display(), e))
    })?;

    let mut templates = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| AcpError::Config(format!("Failed to list {}: {}", dir.display(), e)))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = std::fs::read_to_string(&path).map_err(|e| {
            AcpError::Config(format!("Failed to read template {}: {}", path.display(), e))
        })?;
        tracing::debug!(template = name, path = %path.display(), "Loaded prompt template");
        templates.push(PromptTemplate::new(name, text));
    }
    templates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(templates)
}
