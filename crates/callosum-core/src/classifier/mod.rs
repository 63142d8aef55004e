//! Tier classification of tool calls.
//!
//! The classifier turns a `(tool, params)` pair into a risk tier, an
//! optional context key naming the external resource the call touches,
//! and the name of the rule that matched.
//!
//! # Matching contract
//!
//! Rules are tested in declaration order and the first full match wins —
//! there is no specificity scoring, the author's ordering is the contract.
//! A universal tier-0 terminal rule is injected at compile time when the
//! list does not already end in one, so every call classifies.
//!
//! # Compilation
//!
//! [`Classifier::compile`] validates each rule once: the tier must be in
//! 0..=4, the command pattern must be a valid regular expression, and the
//! name must be non-empty. Classification itself is a pure function over
//! the compiled list.

mod defaults;
mod rule;

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use self::defaults::builtin_rule_set;
pub use self::rule::{ConstraintValue, Rule, RuleSet, ToolPattern};
use crate::config::ConfigError;
use crate::template;
use crate::Params;

/// Risk tier of a tool call.
///
/// Tiers order by severity; enforcement accumulates with the level:
/// journal only at [`Tier::Internal`], context recording from
/// [`Tier::Routine`], duplicate detection and advisory locking from
/// [`Tier::Commitment`], hard conflict blocking at [`Tier::Irreversible`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// 0 — read-only / inert.
    Inert,
    /// 1 — internal mutation (local file, shell).
    Internal,
    /// 2 — routine external action (chat message, sub-session).
    Routine,
    /// 3 — external commitment (email, cron mutation).
    Commitment,
    /// 4 — irreversible action (delete, config apply).
    Irreversible,
}

impl Tier {
    /// The numeric level, 0..=4.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Inert => 0,
            Self::Internal => 1,
            Self::Routine => 2,
            Self::Commitment => 3,
            Self::Irreversible => 4,
        }
    }

    /// Converts a numeric level into a tier.
    ///
    /// Returns `None` outside 0..=4.
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Inert),
            1 => Some(Self::Internal),
            2 => Some(Self::Routine),
            3 => Some(Self::Commitment),
            4 => Some(Self::Irreversible),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level())
    }
}

impl Serialize for Tier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(deserializer)?;
        Self::from_level(level)
            .ok_or_else(|| serde::de::Error::custom(format!("tier {level} outside 0..=4")))
    }
}

/// Result of classifying one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// Assigned risk tier.
    pub tier: Tier,

    /// Canonical identifier of the affected resource, when the matching
    /// rule carries a template. Without one, tier-3+ duplicate and lock
    /// handling is skipped for the call.
    pub context_key: Option<String>,

    /// Name of the rule that matched.
    pub rule_name: String,

    /// Per-rule duplicate-detection window override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_window_ms: Option<u64>,
}

impl Classification {
    /// Per-rule window as a [`Duration`], when present.
    #[must_use]
    pub const fn recent_window(&self) -> Option<Duration> {
        match self.recent_window_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }
}

/// Tool membership test compiled from a [`ToolPattern`].
#[derive(Debug, Clone)]
enum ToolMatcher {
    Any,
    One(String),
    Set(Vec<String>),
}

impl ToolMatcher {
    fn matches(&self, tool: &str) -> bool {
        match self {
            Self::Any => true,
            Self::One(name) => name == tool,
            Self::Set(names) => names.iter().any(|n| n == tool),
        }
    }
}

/// One rule after compile-time validation.
#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    tier: Tier,
    tools: ToolMatcher,
    /// Param name paired with its allowed string-coerced values (AND over
    /// entries, OR within one entry's values).
    constraints: Vec<(String, Vec<String>)>,
    command: Option<Regex>,
    template: Option<String>,
    recent_window_ms: Option<u64>,
}

impl CompiledRule {
    fn matches(&self, tool: &str, params: &Params) -> bool {
        if !self.tools.matches(tool) {
            return false;
        }
        for (param, allowed) in &self.constraints {
            let Some(actual) = params.get(param).and_then(template::coerce_to_string) else {
                return false;
            };
            if !allowed.iter().any(|v| *v == actual) {
                return false;
            }
        }
        if let Some(pattern) = &self.command {
            let command = params
                .get("command")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if !pattern.is_match(command) {
                return false;
            }
        }
        true
    }

    fn is_catch_all(&self) -> bool {
        matches!(self.tools, ToolMatcher::Any)
            && self.constraints.is_empty()
            && self.command.is_none()
    }
}

/// A compiled, ordered rule list.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<CompiledRule>,
}

impl Classifier {
    /// Compiles a rule set, validating every rule and injecting the
    /// universal tier-0 terminal rule when the list lacks a catch-all.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a tier outside 0..=4, an invalid
    /// command pattern, or an empty rule name.
    pub fn compile(rule_set: &RuleSet) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(rule_set.rules.len() + 1);
        for (index, rule) in rule_set.rules.iter().enumerate() {
            rules.push(Self::compile_rule(rule, index)?);
        }

        if !rules.last().is_some_and(CompiledRule::is_catch_all) {
            rules.push(
                Self::compile_rule(&defaults::default_rule(), rules.len())
                    .expect("built-in terminal rule is valid"),
            );
        }

        Ok(Self { rules })
    }

    /// Compiles the built-in default rule set.
    #[must_use]
    pub fn builtin() -> Self {
        Self::compile(&builtin_rule_set()).expect("built-in rule set is valid")
    }

    fn compile_rule(rule: &Rule, index: usize) -> Result<CompiledRule, ConfigError> {
        if rule.name.is_empty() {
            return Err(ConfigError::EmptyRuleName { index });
        }

        let tier = Tier::from_level(rule.tier).ok_or_else(|| ConfigError::InvalidTier {
            rule: rule.name.clone(),
            tier: rule.tier,
        })?;

        let tools = match &rule.tool_pattern {
            pattern if pattern.is_wildcard() => ToolMatcher::Any,
            ToolPattern::One(name) => ToolMatcher::One(name.clone()),
            ToolPattern::Set(names) => ToolMatcher::Set(names.clone()),
        };

        let constraints = rule
            .param_constraints
            .iter()
            .flatten()
            .map(|(param, constraint)| (param.clone(), constraint.allowed_strings()))
            .collect();

        let command = rule
            .command_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|source| ConfigError::InvalidCommandPattern {
                rule: rule.name.clone(),
                source,
            })?;

        Ok(CompiledRule {
            name: rule.name.clone(),
            tier,
            tools,
            constraints,
            command,
            template: rule.context_key_template.clone(),
            recent_window_ms: rule.recent_window_ms,
        })
    }

    /// Classifies a tool call.
    ///
    /// Pure and deterministic over the compiled list; the injected
    /// terminal rule guarantees a match.
    #[must_use]
    pub fn classify(&self, tool: &str, params: &Params) -> Classification {
        let rule = self
            .rules
            .iter()
            .find(|r| r.matches(tool, params))
            .expect("terminal rule matches every call");

        let context_key = rule
            .template
            .as_deref()
            .map(|t| template::expand(t, tool, params))
            .filter(|key| !key.is_empty());

        Classification {
            tier: rule.tier,
            context_key,
            rule_name: rule.name.clone(),
            recent_window_ms: rule.recent_window_ms,
        }
    }

    /// Number of compiled rules, terminal rule included.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
