//! Gate verdicts and the runtime hook envelope.
//!
//! The transport between the gate and the agent runtime only knows
//! "allow" and "block" — but the gate itself distinguishes a *pause*
//! (the action already happened recently; reconsider, retry if genuinely
//! distinct) from a hard *block* (another session owns the resource right
//! now). The distinction lives here in [`Verdict`] and is collapsed only
//! at the hook boundary.

use serde::{Deserialize, Serialize};

use crate::classifier::Tier;
use crate::Params;

/// Decision on one pre-call event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The call may proceed.
    #[serde(rename_all = "camelCase")]
    Allow {
        /// Classified tier.
        tier: Tier,
        /// Context key, when the matching rule produced one.
        context_key: Option<String>,
        /// Name of the rule that classified the call.
        rule_name: String,
        /// Non-fatal conflict note (tier-3 conflicts proceed warned).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },

    /// The call is refused because an equivalent action completed
    /// recently; the reason invites the caller to retry if the new action
    /// is genuinely distinct.
    Pause {
        /// Human-readable account of the recent duplicate and related
        /// activity.
        reason: String,
    },

    /// The call is refused outright (lock conflict at the irreversible
    /// tier, or a persistence failure that would leave the call
    /// unaudited).
    Block {
        /// Human-readable reason naming the conflicting instance and key.
        reason: String,
    },
}

impl Verdict {
    /// Whether the actual tool must not run.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        matches!(self, Self::Pause { .. } | Self::Block { .. })
    }

    /// The refusal reason, for pause and block verdicts.
    #[must_use]
    pub fn blocking_reason(&self) -> Option<&str> {
        match self {
            Self::Pause { reason } | Self::Block { reason } => Some(reason),
            Self::Allow { .. } => None,
        }
    }

    /// Collapses the verdict into the hook wire shape: `None` for allow,
    /// a block response otherwise.
    #[must_use]
    pub fn into_hook_response(self) -> Option<BlockResponse> {
        match self {
            Self::Allow { .. } => None,
            Self::Pause { reason } | Self::Block { reason } => Some(BlockResponse {
                block: true,
                block_reason: reason,
            }),
        }
    }
}

/// Hook response returned to the runtime for a refused call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResponse {
    /// Always `true`; present for the hook surface's shape.
    pub block: bool,

    /// The agent's sole input for deciding whether to retry.
    pub block_reason: String,
}

/// Pre-call event delivered by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeToolCall {
    /// Name of the tool about to be invoked.
    pub tool_name: String,

    /// Tool parameters, an open mapping.
    #[serde(default, deserialize_with = "null_to_empty_params")]
    pub params: Params,
}

/// Post-call event delivered by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfterToolCall {
    /// Name of the tool that was invoked.
    pub tool_name: String,

    /// The same parameters the pre-call event carried.
    #[serde(default, deserialize_with = "null_to_empty_params")]
    pub params: Params,

    /// Error message when the tool failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runtimes hand over `params: null` for parameterless tools; treat it
/// as the empty mapping rather than a shape error.
pub(crate) fn null_to_empty_params<'de, D>(deserializer: D) -> Result<Params, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Params>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_is_not_blocking() {
        let verdict = Verdict::Allow {
            tier: Tier::Routine,
            context_key: Some("channel:andy".to_string()),
            rule_name: "message-send".to_string(),
            warning: None,
        };
        assert!(!verdict.is_blocking());
        assert!(verdict.blocking_reason().is_none());
        assert!(verdict.into_hook_response().is_none());
    }

    #[test]
    fn test_pause_collapses_to_block_at_the_hook() {
        let verdict = Verdict::Pause {
            reason: "already done".to_string(),
        };
        assert!(verdict.is_blocking());
        let response = verdict.into_hook_response().expect("blocked at the hook");
        assert!(response.block);
        assert_eq!(response.block_reason, "already done");
    }

    #[test]
    fn test_hook_response_wire_shape() {
        let response = BlockResponse {
            block: true,
            block_reason: "conflict".to_string(),
        };
        let json = serde_json::to_value(&response).expect("serializes");
        assert_eq!(json["block"], true);
        assert_eq!(json["blockReason"], "conflict");
    }

    #[test]
    fn test_before_event_accepts_missing_params() {
        let event: BeforeToolCall =
            serde_json::from_str(r#"{"toolName": "exec"}"#).expect("parses");
        assert_eq!(event.tool_name, "exec");
        assert!(event.params.is_empty());
    }

    #[test]
    fn test_before_event_accepts_null_params() {
        let event: BeforeToolCall =
            serde_json::from_str(r#"{"toolName": "exec", "params": null}"#).expect("parses");
        assert!(event.params.is_empty());
    }
}
