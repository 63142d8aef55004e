//! # callosum-core
//!
//! Core library for callosum — a coordination sidecar for AI-agent
//! runtimes in which one logical agent runs as several concurrent
//! sessions sharing the same external tools (email, chat, files, cron,
//! deploy).
//!
//! The library is the *action gate*: it classifies each tool call by risk
//! tier, records it in a shared append-only journal, and — above the
//! commitment tier — checks whether another session (or the same session,
//! recently) already acted on the same resource, pausing or blocking the
//! call when it did.
//!
//! ## Components
//!
//! - [`template`] — pure expansion of context-key templates.
//! - [`classifier`] — ordered, first-match-wins tier rules.
//! - [`store`] — journal, advisory lock table, and context record.
//! - [`gate`] — the pre-call / post-call decision procedure.
//! - [`remote`] — client for a shared gate daemon (server mode).
//!
//! ## Example
//!
//! ```rust,no_run
//! use callosum_core::{BeforeToolCall, Gate, GateConfig, Params};
//!
//! # fn example() -> Result<(), callosum_core::GateError> {
//! let gate = Gate::new(GateConfig::new("session-alpha"))?;
//!
//! let event = BeforeToolCall {
//!     tool_name: "exec".to_string(),
//!     params: Params::new(),
//! };
//! let verdict = gate.before_tool_call(&event);
//! if let Some(response) = verdict.into_hook_response() {
//!     println!("refused: {}", response.block_reason);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod classifier;
pub mod config;
pub mod gate;
pub mod remote;
pub mod store;
pub mod template;

/// Tool parameters: an open string-to-value mapping whose keys depend on
/// the tool. Values are coerced to strings at the classifier boundary.
pub type Params = serde_json::Map<String, serde_json::Value>;

pub use classifier::{Classification, Classifier, Rule, RuleSet, Tier};
pub use config::{ConfigError, GateConfig, GateMode};
pub use gate::{AfterToolCall, BeforeToolCall, BlockResponse, Gate, GateError, Verdict};
pub use store::{
    ConflictCheck, ContextRecord, CoordinationStore, JournalAction, JournalEntry, Lock,
    StoreError, StoreSnapshot,
};
