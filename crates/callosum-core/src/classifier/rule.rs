//! Rule file model.
//!
//! Rules are authored in `tiers.json` as an ordered list; declaration order
//! is the matching contract. The serde model here is deliberately loose
//! (tier is a bare integer, patterns are strings) — all validation happens
//! in [`Classifier::compile`](super::Classifier::compile) so a broken rule
//! file fails with a named rule, not a serde path.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A rule file: optional description plus the ordered rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    /// Free-form description of the rule file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Rules in matching order.
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Loads a rule set from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`] when the file
    /// cannot be read or is not a valid rule document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One classifier rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Rule name, surfaced in classifications and journal entries.
    pub name: String,

    /// Risk tier assigned on match, 0..=4.
    pub tier: u8,

    /// Tool name(s) this rule applies to. `"*"` or `"any"` matches every
    /// tool.
    pub tool_pattern: ToolPattern,

    /// Parameter constraints; every entry must hold for the rule to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_constraints: Option<BTreeMap<String, ConstraintValue>>,

    /// Regular expression evaluated against the `command` parameter (the
    /// empty string when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_pattern: Option<String>,

    /// Context-key template; a rule without one produces no context key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key_template: Option<String>,

    /// Per-rule duplicate-detection window in milliseconds, overriding the
    /// configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_window_ms: Option<u64>,
}

impl Rule {
    /// Creates a minimal rule with the given name, tier, and tool pattern.
    #[must_use]
    pub fn new(name: impl Into<String>, tier: u8, tool_pattern: ToolPattern) -> Self {
        Self {
            name: name.into(),
            tier,
            tool_pattern,
            param_constraints: None,
            command_pattern: None,
            context_key_template: None,
            recent_window_ms: None,
        }
    }
}

/// Tool pattern: a literal name, a finite set, or the wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolPattern {
    /// A single tool name, or `"*"` / `"any"` for the wildcard.
    One(String),
    /// A finite set of tool names.
    Set(Vec<String>),
}

impl ToolPattern {
    /// The universal pattern.
    #[must_use]
    pub fn any() -> Self {
        Self::One("*".to_string())
    }

    /// Returns `true` if this pattern matches every tool.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::One(s) if s == "*" || s == "any")
    }
}

/// A parameter constraint: one allowed value or a finite set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintValue {
    /// Exactly this value (compared after string coercion).
    One(serde_json::Value),
    /// Any of these values.
    Set(Vec<serde_json::Value>),
}

impl ConstraintValue {
    /// The allowed values as string-coerced forms. Values that do not
    /// coerce (objects, arrays, null) can never match and are dropped.
    #[must_use]
    pub fn allowed_strings(&self) -> Vec<String> {
        let values: &[serde_json::Value] = match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Set(vs) => vs,
        };
        values
            .iter()
            .filter_map(crate::template::coerce_to_string)
            .collect()
    }
}
