//! Permission tiers and the pattern rules that override them
//!
//! A tool descriptor declares a default tier. Policy rules, evaluated in the
//! order deny → allow → ask, override that tier for matching invocations.
//!
//! Rule format: `tool_name(pattern)` or `tool_name` (matches all arguments).
//! - `run_cmd(git:*)` - any command starting with `git`
//! - `write_file(src/**)` - writes anywhere below `src/`
//! - `read_file(*.md)` - top-level markdown files

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a tool invocation is admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTier {
    /// Run without asking
    #[serde(alias = "always")]
    AutoAllow,
    /// Round-trip an approval request to the host
    #[serde(alias = "ask")]
    AskHost,
    /// Never run
    #[serde(alias = "never")]
    Deny,
}

/// Outcome of gating one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl From<PermissionTier> for Decision {
    fn from(tier: PermissionTier) -> Self {
        match tier {
            PermissionTier::AutoAllow => Decision::Allow,
            PermissionTier::AskHost => Decision::Ask,
            PermissionTier::Deny => Decision::Deny,
        }
    }
}

/// A permission rule with glob-style argument matching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PermissionRule {
    rule: String,
    tool_name: String,
    arg_pattern: Option<ArgPattern>,
}

#[derive(Debug, Clone)]
enum ArgPattern {
    Any,
    Prefix(String),
    Glob(Regex),
    Literal(String),
}

impl PermissionRule {
    pub fn new(rule: &str) -> Self {
        let rule = rule.trim();
        let (tool_name, pattern) = match rule.find('(') {
            Some(open) if rule.ends_with(')') => (
                rule[..open].trim().to_string(),
                Some(&rule[open + 1..rule.len() - 1]),
            ),
            _ => (rule.to_string(), None),
        };
        Self {
            rule: rule.to_string(),
            tool_name,
            arg_pattern: pattern.map(ArgPattern::parse),
        }
    }

    /// Rule matching every invocation of one tool
    pub fn tool(name: &str) -> Self {
        Self::new(name)
    }

    pub fn as_str(&self) -> &str {
        &self.rule
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn matches(&self, tool_name: &str, args: &serde_json::Value) -> bool {
        if !self.tool_name.eq_ignore_ascii_case(tool_name) {
            return false;
        }
        match &self.arg_pattern {
            None | Some(ArgPattern::Any) => true,
            Some(pattern) => pattern.matches(&match_subject(args)),
        }
    }
}

impl PartialEq for PermissionRule {
    fn eq(&self, other: &Self) -> bool {
        self.rule == other.rule
    }
}

impl Eq for PermissionRule {}

impl From<String> for PermissionRule {
    fn from(rule: String) -> Self {
        Self::new(&rule)
    }
}

impl From<PermissionRule> for String {
    fn from(rule: PermissionRule) -> Self {
        rule.rule
    }
}

impl ArgPattern {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" || pattern == "**" {
            return ArgPattern::Any;
        }
        if let Some(prefix) = pattern.strip_suffix(":*") {
            return ArgPattern::Prefix(prefix.to_string());
        }
        match Regex::new(&glob_to_regex(pattern)) {
            Ok(re) => ArgPattern::Glob(re),
            Err(e) => {
                tracing::warn!(
                    pattern,
                    error = %e,
                    "Unusable permission pattern, matching literally"
                );
                ArgPattern::Literal(pattern.to_string())
            }
        }
    }

    fn matches(&self, subject: &str) -> bool {
        match self {
            ArgPattern::Any => true,
            ArgPattern::Prefix(prefix) => subject.starts_with(prefix.as_str()),
            ArgPattern::Glob(re) => re.is_match(subject),
            ArgPattern::Literal(literal) => subject == literal,
        }
    }
}

/// The argument a pattern is matched against: the first well-known string
/// field, else the serialized arguments.
fn match_subject(args: &serde_json::Value) -> String {
    ["command", "path", "file_path", "pattern", "url"]
        .iter()
        .find_map(|key| args.get(key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| serde_json::to_string(args).unwrap_or_default())
}

/// `*` stops at `/`, `**` crosses it, `?` is one non-`/` character.
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                regex.push_str(".*");
                i += if chars.get(i + 2) == Some(&'/') { 3 } else { 2 };
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            c => {
                regex.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    regex.push('$');
    regex
}

/// Rule lists evaluated deny → allow → ask
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionPolicy {
    pub deny: Vec<PermissionRule>,
    pub allow: Vec<PermissionRule>,
    pub ask: Vec<PermissionRule>,
}

impl PermissionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, rule: &str) -> Self {
        self.deny.push(PermissionRule::new(rule));
        self
    }

    pub fn allow(mut self, rule: &str) -> Self {
        self.allow.push(PermissionRule::new(rule));
        self
    }

    pub fn ask(mut self, rule: &str) -> Self {
        self.ask.push(PermissionRule::new(rule));
        self
    }

    /// Tier forced by the first matching rule, `None` when no rule matches.
    pub fn evaluate(&self, tool_name: &str, args: &serde_json::Value) -> Option<PermissionTier> {
        let hit = |rules: &[PermissionRule]| rules.iter().any(|r| r.matches(tool_name, args));
        if hit(&self.deny) {
            Some(PermissionTier::Deny)
        } else if hit(&self.allow) {
            Some(PermissionTier::AutoAllow)
        } else if hit(&self.ask) {
            Some(PermissionTier::AskHost)
        } else {
            None
        }
    }

    /// Add a blanket allow rule for `tool_name` unless one exists.
    pub fn allow_tool(&mut self, tool_name: &str) {
        let rule = PermissionRule::tool(tool_name);
        if !self.allow.contains(&rule) {
            self.allow.push(rule);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty() && self.allow.is_empty() && self.ask.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========================================================================
    // Rule matching
    // ========================================================================

    #[test]
    fn test_bare_tool_rule_matches_everything() {
        let rule = PermissionRule::new("read_file");
        assert!(rule.matches("read_file", &json!({"path": "a.txt"})));
        assert!(rule.matches("READ_FILE", &json!({})));
        assert!(!rule.matches("write_file", &json!({"path": "a.txt"})));
    }

    #[test]
    fn test_prefix_rule() {
        let rule = PermissionRule::new("run_cmd(cargo:*)");
        assert!(rule.matches("run_cmd", &json!({"command": "cargo test --all"})));
        assert!(rule.matches("run_cmd", &json!({"command": "cargo"})));
        assert!(!rule.matches("run_cmd", &json!({"command": "rm -rf /"})));
    }

    #[test]
    fn test_glob_rules() {
        let single = PermissionRule::new("write_file(*.md)");
        assert!(single.matches("write_file", &json!({"path": "README.md"})));
        assert!(!single.matches("write_file", &json!({"path": "docs/README.md"})));

        let deep = PermissionRule::new("write_file(src/**/*.rs)");
        assert!(deep.matches("write_file", &json!({"path": "src/a/b/lib.rs"})));
        assert!(deep.matches("write_file", &json!({"path": "src/lib.rs"})));
        assert!(!deep.matches("write_file", &json!({"path": "tests/lib.rs"})));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let rule = PermissionRule::new("run_cmd(echo (a|b))");
        assert!(rule.matches("run_cmd", &json!({"command": "echo (a|b)"})));
        assert!(!rule.matches("run_cmd", &json!({"command": "echo a"})));
    }

    #[test]
    fn test_unknown_argument_shape_matches_serialized_args() {
        let rule = PermissionRule::new("custom(*\"mode\":\"dry\"*)");
        assert!(rule.matches("custom", &json!({"mode": "dry"})));
    }

    #[test]
    fn test_rule_serde_as_string() {
        let rules: Vec<PermissionRule> =
            serde_json::from_value(json!(["run_cmd(git:*)", "read_file"])).unwrap();
        assert!(rules[0].matches("run_cmd", &json!({"command": "git log"})));
        assert_eq!(rules[1].tool_name(), "read_file");
        assert_eq!(
            serde_json::to_value(&rules).unwrap(),
            json!(["run_cmd(git:*)", "read_file"])
        );
    }

    // ========================================================================
    // Policy evaluation
    // ========================================================================

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = PermissionPolicy::new()
            .allow("run_cmd")
            .deny("run_cmd(rm:*)");
        assert_eq!(
            policy.evaluate("run_cmd", &json!({"command": "rm -rf target"})),
            Some(PermissionTier::Deny)
        );
        assert_eq!(
            policy.evaluate("run_cmd", &json!({"command": "ls"})),
            Some(PermissionTier::AutoAllow)
        );
    }

    #[test]
    fn test_ask_and_no_match() {
        let policy = PermissionPolicy::new().ask("read_file(secrets/**)");
        assert_eq!(
            policy.evaluate("read_file", &json!({"path": "secrets/key.pem"})),
            Some(PermissionTier::AskHost)
        );
        assert_eq!(policy.evaluate("read_file", &json!({"path": "a.txt"})), None);
    }

    #[test]
    fn test_allow_tool_is_idempotent() {
        let mut policy = PermissionPolicy::new();
        policy.allow_tool("write_file");
        policy.allow_tool("write_file");
        assert_eq!(policy.allow.len(), 1);
        assert_eq!(
            policy.evaluate("write_file", &json!({"path": "x"})),
            Some(PermissionTier::AutoAllow)
        );
    }

    #[test]
    fn test_tier_aliases() {
        let tiers: Vec<PermissionTier> =
            serde_json::from_value(json!(["always", "ask", "never", "ask_host"])).unwrap();
        assert_eq!(
            tiers,
            vec![
                PermissionTier::AutoAllow,
                PermissionTier::AskHost,
                PermissionTier::Deny,
                PermissionTier::AskHost
            ]
        );
        assert_eq!(Decision::from(PermissionTier::AskHost), Decision::Ask);
    }
}
