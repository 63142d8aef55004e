//! Context-key template expansion.
//!
//! Classifier rules name the resource a tool call touches through a small
//! template language: a literal string with `{EXPR}` placeholders, where
//! `EXPR` is a `|`-separated list of alternatives tried left-to-right. The
//! first alternative that produces a non-empty value wins.
//!
//! Alternative forms:
//!
//! - `tool` — the tool name.
//! - `params.NAME` — parameter `NAME` coerced to a string; absent, empty,
//!   or null values fail the alternative.
//! - `commandRecipient` — an email recipient scraped from the `command`
//!   parameter (`--mail-rcpt` first, then `--to`).
//! - a bare identifier — a literal fallback that always succeeds.
//!
//! Expansion is total: it never fails. If every alternative of an
//! expression fails, the expansion is the literal `unknown`. Malformed
//! templates (an unclosed `{`) keep the malformed fragment verbatim — a
//! misconfigured template must not take the tool call down with it.

use std::sync::LazyLock;

use regex::Regex;

use crate::Params;

/// Fallback text used when every alternative of an expression fails.
pub const UNKNOWN: &str = "unknown";

/// Recipient of `curl --mail-rcpt 'alice@example.com'` style commands.
static MAIL_RCPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--mail-rcpt\s+'?([^'\s]+)").expect("mail-rcpt regex is valid"));

/// Recipient of `--to 'alice@example.com'` style commands.
static MAIL_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--to\s+'?([^'\s]+)").expect("mail-to regex is valid"));

/// Expands a context-key template against a tool call.
///
/// Every `{EXPR}` occurrence is expanded independently; text outside the
/// braces is copied verbatim.
#[must_use]
pub fn expand(template: &str, tool: &str, params: &Params) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let expr = &after_open[..close];
                out.push_str(&resolve_expr(expr, tool, params));
                rest = &after_open[close + 1..];
            },
            None => {
                // Unclosed brace: tolerate the misconfiguration by keeping
                // the fragment as written.
                out.push_str(&rest[open..]);
                rest = "";
            },
        }
    }
    out.push_str(rest);
    out
}

/// Resolves one `a|b|c` expression to its first non-empty alternative.
fn resolve_expr(expr: &str, tool: &str, params: &Params) -> String {
    for alt in expr.split('|') {
        if let Some(value) = resolve_alternative(alt.trim(), tool, params) {
            return value;
        }
    }
    UNKNOWN.to_string()
}

fn resolve_alternative(alt: &str, tool: &str, params: &Params) -> Option<String> {
    match alt {
        "" => None,
        "tool" => Some(tool.to_string()),
        "commandRecipient" => command_recipient(params),
        _ => {
            if let Some(name) = alt.strip_prefix("params.") {
                params.get(name).and_then(coerce_to_string)
            } else if alt.contains('.') {
                // Dotted forms other than `params.` are not part of the
                // language; the alternative fails rather than leaking the
                // selector text into the key.
                None
            } else {
                // Bare identifier: literal fallback, always succeeds.
                Some(alt.to_string())
            }
        },
    }
}

/// Coerces a JSON parameter value to a non-empty string.
///
/// Null, empty strings, and container values fail the coercion so the next
/// alternative gets a chance.
pub(crate) fn coerce_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extracts an email recipient from the `command` parameter.
///
/// Matches `--mail-rcpt '?addr` first, then `--to '?addr`, yielding the
/// first capture.
fn command_recipient(params: &Params) -> Option<String> {
    let command = params.get("command").and_then(serde_json::Value::as_str)?;
    for re in [&*MAIL_RCPT_RE, &*MAIL_TO_RE] {
        if let Some(caps) = re.captures(command) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str().to_string());
            }
        }
    }
    None
}
