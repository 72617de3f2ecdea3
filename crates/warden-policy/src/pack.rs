use std::collections::HashMap;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::{CallDescriptor, Decision, PolicyError, PolicyEvaluator};

lazy_static! {
    // Common secret shapes: bearer/API keys, AWS access keys, PEM blocks,
    // inline password assignments.
    static ref SECRET_RE: Regex = Regex::new(
        r"(?i)(sk-[a-z0-9]{16,}|AKIA[0-9A-Z]{16}|-----BEGIN [A-Z ]*PRIVATE KEY-----|(password|passwd|api[_-]?key|secret|token)\s*[:=]\s*\S+)"
    )
    .unwrap();
    // US SSNs and email addresses.
    static ref PII_RE: Regex = Regex::new(
        r"(\b\d{3}-\d{2}-\d{4}\b|[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})"
    )
    .unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolRules {
    pub allow: Option<Vec<String>>,
    pub deny: Option<Vec<String>>,
}

/// One argument rewrite. When `pattern` matches the string value of
/// `argument` on a call to `tool`, every match is replaced and the call
/// proceeds with the rewritten arguments (`Decision::Modify`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub tool: String,
    pub argument: String,
    pub pattern: String,
    pub replacement: String,
}

/// List/pattern-based policy pack, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyPack {
    #[serde(default)]
    pub tools: ToolRules,
    /// Tool-name prefixes that require out-of-band approval; calls to
    /// matching tools are denied by this evaluator.
    #[serde(default)]
    pub require_approval_for: Vec<String>,
    /// Upper bound on the serialized size of a call's arguments.
    #[serde(default)]
    pub max_argument_bytes: Option<usize>,
    #[serde(default)]
    pub block_secrets: bool,
    #[serde(default)]
    pub block_pii: bool,
    /// tool -> argument -> deny regex.
    #[serde(default)]
    pub deny_patterns: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
}

impl PolicyPack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Production defaults: destructive operation prefixes require
    /// approval, argument size is capped, secret and PII screening on.
    pub fn default_pack() -> Self {
        Self {
            require_approval_for: vec![
                "delete".to_string(),
                "update".to_string(),
                "export".to_string(),
            ],
            max_argument_bytes: Some(1000),
            block_secrets: true,
            block_pii: true,
            ..Self::default()
        }
    }

    /// Load a pack from a YAML file and validate its patterns.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let pack: PolicyPack = serde_yaml::from_str(&content)?;
        pack.validate()?;
        Ok(pack)
    }

    /// Compile every configured pattern so a malformed pack is a load
    /// error rather than a per-call denial.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (tool, patterns) in &self.deny_patterns {
            for (argument, pattern) in patterns {
                Regex::new(pattern).map_err(|e| {
                    anyhow::anyhow!("invalid deny pattern for {tool}.{argument}: {e}")
                })?;
            }
        }
        for rule in &self.rewrites {
            Regex::new(&rule.pattern).map_err(|e| {
                anyhow::anyhow!(
                    "invalid rewrite pattern for {}.{}: {e}",
                    rule.tool,
                    rule.argument
                )
            })?;
        }
        Ok(())
    }

    fn check(&self, descriptor: &CallDescriptor) -> Result<Decision, PolicyError> {
        let tool_name = descriptor.tool_name.as_str();

        // 1. Denylist
        if let Some(deny) = &self.tools.deny {
            if deny.iter().any(|t| t == tool_name) {
                return Ok(Decision::deny("tool is explicitly denylisted"));
            }
        }

        // 2. Allowlist
        if let Some(allow) = &self.tools.allow {
            if !allow.iter().any(|t| t == tool_name) {
                return Ok(Decision::deny("tool is not in the allowlist"));
            }
        }

        // 3. Approval-required prefixes
        if let Some(prefix) = self
            .require_approval_for
            .iter()
            .find(|p| tool_name.starts_with(p.as_str()))
        {
            return Ok(Decision::deny(format!(
                "tool '{tool_name}' matches approval-required prefix '{prefix}'"
            )));
        }

        // 4. Argument size
        if let Some(max) = self.max_argument_bytes {
            let size = serde_json::to_vec(&descriptor.arguments)
                .map(|b| b.len())
                .unwrap_or(usize::MAX);
            if size > max {
                return Ok(Decision::deny(format!(
                    "arguments exceed {max} bytes ({size})"
                )));
            }
        }

        // 5. Builtin screens
        if self.block_secrets {
            if let Some(argument) = first_string_match(&descriptor.arguments, &SECRET_RE) {
                return Ok(Decision::deny(format!(
                    "argument '{argument}' matches a secret pattern"
                )));
            }
        }
        if self.block_pii {
            if let Some(argument) = first_string_match(&descriptor.arguments, &PII_RE) {
                return Ok(Decision::deny(format!(
                    "argument '{argument}' matches a PII pattern"
                )));
            }
        }

        // 6. Per-tool deny patterns
        if let Some(patterns) = self.deny_patterns.get(tool_name) {
            for (argument, pattern) in patterns {
                let re = Regex::new(pattern).map_err(|e| {
                    PolicyError::Unavailable(format!("invalid deny pattern: {e}"))
                })?;
                if let Some(value) = descriptor.arguments.get(argument).and_then(Value::as_str) {
                    if re.is_match(value) {
                        return Ok(Decision::deny(format!(
                            "argument '{argument}' matches deny pattern '{pattern}'"
                        )));
                    }
                }
            }
        }

        // 7. Rewrites
        let mut arguments = descriptor.arguments.clone();
        let mut rewritten = false;
        for rule in self.rewrites.iter().filter(|r| r.tool == tool_name) {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                PolicyError::Unavailable(format!("invalid rewrite pattern: {e}"))
            })?;
            if let Some(value) = arguments.get(&rule.argument).and_then(Value::as_str) {
                let replaced = re.replace_all(value, rule.replacement.as_str());
                if replaced != value {
                    tracing::debug!(
                        tool = tool_name,
                        argument = %rule.argument,
                        "rewrite rule applied"
                    );
                    arguments.insert(rule.argument.clone(), Value::String(replaced.into_owned()));
                    rewritten = true;
                }
            }
        }
        if rewritten {
            return Ok(Decision::Modify { arguments });
        }

        Ok(Decision::Allow)
    }
}

/// Name of the first top-level argument whose string content (searched
/// recursively) matches `re`.
fn first_string_match<'a>(
    arguments: &'a serde_json::Map<String, Value>,
    re: &Regex,
) -> Option<&'a str> {
    arguments
        .iter()
        .find(|(_, value)| value_matches(value, re))
        .map(|(name, _)| name.as_str())
}

fn value_matches(value: &Value, re: &Regex) -> bool {
    match value {
        Value::String(s) => re.is_match(s),
        Value::Array(items) => items.iter().any(|v| value_matches(v, re)),
        Value::Object(map) => map.values().any(|v| value_matches(v, re)),
        _ => false,
    }
}

#[async_trait]
impl PolicyEvaluator for PolicyPack {
    async fn evaluate(&self, descriptor: &CallDescriptor) -> Result<Decision, PolicyError> {
        self.check(descriptor)
    }
}
