//! Built-in default rule set.
//!
//! Used when no `tiers.json` is present. The defaults cover the tool
//! surface a multi-session agent typically shares: email delivery over
//! `curl`/SMTP, chat messaging, cron mutation, deploy/config application,
//! file mutation, and general shell execution, with a universal tier-0
//! terminal rule.

use std::collections::BTreeMap;

use serde_json::json;

use super::rule::{ConstraintValue, Rule, RuleSet, ToolPattern};

/// Builds the built-in rule set.
#[must_use]
pub fn builtin_rule_set() -> RuleSet {
    RuleSet {
        description: Some("built-in default tiers".to_string()),
        rules: vec![
            email_send(),
            email_tool(),
            cron_mutation(),
            message_irreversible(),
            config_apply(),
            message_send(),
            session_spawn(),
            file_mutate(),
            exec_general(),
            default_rule(),
        ],
    }
}

/// `exec` invocations that deliver mail (curl over SMTP, sendmail).
fn email_send() -> Rule {
    let mut rule = Rule::new("email-send", 3, ToolPattern::One("exec".to_string()));
    rule.command_pattern = Some(r"--mail-rcpt|smtp://|^sendmail\b".to_string());
    rule.context_key_template = Some("email:{commandRecipient}".to_string());
    rule
}

/// A first-class email tool, when the runtime exposes one.
fn email_tool() -> Rule {
    let mut rule = Rule::new("email-tool", 3, ToolPattern::One("email".to_string()));
    rule.context_key_template = Some("email:{params.to|params.recipient}".to_string());
    rule
}

/// Cron table mutation.
fn cron_mutation() -> Rule {
    let mut rule = Rule::new(
        "cron-mutation",
        3,
        ToolPattern::One("cron".to_string()),
    );
    rule.param_constraints = Some(BTreeMap::from([(
        "action".to_string(),
        ConstraintValue::Set(vec![
            json!("add"),
            json!("update"),
            json!("remove"),
            json!("delete"),
        ]),
    )]));
    rule.context_key_template = Some("cron:{params.name|params.id|params.action}".to_string());
    rule
}

/// Channel-destroying message actions are irreversible.
fn message_irreversible() -> Rule {
    let mut rule = Rule::new(
        "message-irreversible",
        4,
        ToolPattern::One("message".to_string()),
    );
    rule.param_constraints = Some(BTreeMap::from([(
        "action".to_string(),
        ConstraintValue::Set(vec![json!("channel-delete"), json!("channel-purge")]),
    )]));
    rule.context_key_template = Some("{tool}:{params.action}".to_string());
    rule
}

/// Deploys and configuration application.
fn config_apply() -> Rule {
    let mut rule = Rule::new(
        "config-apply",
        4,
        ToolPattern::Set(vec!["deploy".to_string(), "config".to_string()]),
    );
    rule.context_key_template =
        Some("{tool}:{params.target|params.service|params.action}".to_string());
    rule
}

/// Routine chat messages.
fn message_send() -> Rule {
    let mut rule = Rule::new("message-send", 2, ToolPattern::One("message".to_string()));
    rule.context_key_template =
        Some("channel:{params.target|params.channel|params.to}".to_string());
    rule
}

/// Sub-session spawning.
fn session_spawn() -> Rule {
    let mut rule = Rule::new("session-spawn", 2, ToolPattern::One("spawn".to_string()));
    rule.context_key_template = Some("session:{params.name|params.task}".to_string());
    rule
}

/// Local file mutation.
fn file_mutate() -> Rule {
    Rule::new(
        "file-mutate",
        1,
        ToolPattern::Set(vec![
            "write".to_string(),
            "edit".to_string(),
            "append".to_string(),
        ]),
    )
}

/// Any other shell execution.
fn exec_general() -> Rule {
    Rule::new(
        "exec-general",
        1,
        ToolPattern::Set(vec!["exec".to_string(), "shell".to_string()]),
    )
}

/// Universal terminal rule: everything else is read-only.
pub(super) fn default_rule() -> Rule {
    Rule::new("default", 0, ToolPattern::any())
}
