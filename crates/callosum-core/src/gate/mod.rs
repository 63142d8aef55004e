//! The action gate: pre-call and post-call decision procedure.
//!
//! The gate sits between a session's intent to invoke a tool and the
//! actual invocation. On every pre-call event it classifies the call,
//! journals an `intercept` line unconditionally (the audit contract),
//! and — above the commitment tier — checks for recent duplicates and
//! cross-instance conflicts before taking an advisory lock:
//!
//! ```text
//! before_tool_call
//!     |
//!     +-- classify -> (tier, context key, rule)
//!     +-- journal intercept            (always; append failure => block)
//!     +-- tier >= 2: record context
//!     +-- tier >= 3: recent duplicate? ----> pause (retry-if-distinct)
//!     |             cross-instance conflict?
//!     |                 tier 4 -----------> block
//!     |                 tier 3 -----------> warn, proceed
//!     |             acquire advisory lock (tier-4 loss => block)
//!     +-- allow
//!
//! after_tool_call
//!     +-- replay pre-call classification (snapshot; re-classify fallback)
//!     +-- tier >= 3: journal complete/failed, release lock
//! ```
//!
//! There is no suspension between the duplicate check, the conflict
//! check, and the lock decision: the store serializes all of it, so two
//! racing sessions cannot both slip through a check-then-act window.
//!
//! # Failure posture
//!
//! A journal append that fails blocks the call — the gate never lets a
//! tool run unaudited. A classifier panic is caught and the call degrades
//! to tier 0 with a warning: classification bugs must not brick the
//! agent.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable for the gate.
#![allow(clippy::missing_panics_doc)]

mod verdict;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, warn};

pub use self::verdict::{AfterToolCall, BeforeToolCall, BlockResponse, Verdict};
pub(crate) use self::verdict::null_to_empty_params;
use crate::classifier::{builtin_rule_set, Classification, Classifier, RuleSet, Tier};
use crate::config::{ConfigError, GateConfig, GateMode};
use crate::remote::{CompleteRequest, GateClient, InterceptRequest, RemoteError};
use crate::store::{CoordinationStore, JournalAction, JournalEntry, StoreError};
use crate::Params;

/// How many unrelated recent tier-3+ actions a pause reason cites.
const PAUSE_CONTEXT_LIMIT: usize = 3;

/// Errors from gate construction and explicit gate operations.
///
/// The decision path itself never surfaces these: refusals are verdicts,
/// and persistence failures inside `intercept` become block verdicts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    /// Configuration or rule list rejected at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Coordination state could not be read or written.
    #[error("coordination state error: {0}")]
    Store(#[from] StoreError),

    /// Remote transport failed.
    #[error("remote gate error: {0}")]
    Remote(#[from] RemoteError),
}

/// Classification snapshot for a call between its pre- and post-call
/// events.
#[derive(Debug, Clone)]
struct InflightCall {
    classification: Classification,
    tool: String,
    recorded_at: DateTime<Utc>,
    sibling: Option<String>,
}

/// The action gate.
///
/// One gate per session in plugin mode (sharing a state directory or a
/// daemon with its peers); one gate inside the daemon in server mode.
pub struct Gate {
    classifier: Classifier,
    store: CoordinationStore,
    config: GateConfig,
    remote: Option<GateClient>,
    inflight: Mutex<HashMap<String, InflightCall>>,
}

impl Gate {
    /// Builds a gate from configuration: loads the rule file (or the
    /// built-in defaults), compiles the classifier, and opens the store.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] for an invalid configuration or rule
    /// list, [`GateError::Store`] when the state directory cannot be
    /// opened, and [`GateError::Remote`] when the remote client cannot be
    /// constructed.
    pub fn new(config: GateConfig) -> Result<Self, GateError> {
        config.validate()?;
        let rule_set = match config.resolve_rules_file() {
            Some(path) => RuleSet::load(path)?,
            None => builtin_rule_set(),
        };
        Self::with_rules(config, &rule_set)
    }

    /// Builds a gate with an explicit rule set.
    ///
    /// # Errors
    ///
    /// As [`Gate::new`], minus rule file I/O.
    pub fn with_rules(config: GateConfig, rule_set: &RuleSet) -> Result<Self, GateError> {
        config.validate()?;
        let classifier = Classifier::compile(rule_set)?;
        let store = CoordinationStore::open(
            &config.state_dir,
            config.lock_expiry(),
            config.context_window(),
        )?;

        let remote = match config.mode {
            GateMode::Local => None,
            GateMode::Remote => {
                let url = config
                    .server_url
                    .clone()
                    .ok_or(ConfigError::MissingServerUrl)?;
                Some(GateClient::new(url, config.timeout())?)
            },
        };

        Ok(Self {
            classifier,
            store,
            config,
            remote,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying store, for status and journal queries.
    #[must_use]
    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    /// This gate's own instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    // =====================================================================
    // Hook surface
    // =====================================================================

    /// Handles a `before_tool_call` event for this gate's own instance.
    #[must_use]
    pub fn before_tool_call(&self, event: &BeforeToolCall) -> Verdict {
        self.intercept(&self.config.instance_id, &event.tool_name, &event.params)
    }

    /// Handles an `after_tool_call` event for this gate's own instance.
    pub fn after_tool_call(&self, event: &AfterToolCall) {
        self.complete(
            &self.config.instance_id,
            &event.tool_name,
            &event.params,
            event.error.as_deref(),
        );
    }

    // =====================================================================
    // Pre-call
    // =====================================================================

    /// Decides a pre-call event for `instance`.
    ///
    /// In remote mode the decision is delegated to the daemon; on
    /// transport failure the gate falls back to the local store with a
    /// warning.
    #[must_use]
    pub fn intercept(&self, instance: &str, tool: &str, params: &Params) -> Verdict {
        if let Some(client) = &self.remote {
            let request = InterceptRequest {
                instance: instance.to_string(),
                tool: tool.to_string(),
                action: params
                    .get("action")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                params: params.clone(),
            };
            match client.intercept(&request) {
                Ok(response) => {
                    let verdict = response.into_verdict();
                    if let Verdict::Allow {
                        tier,
                        context_key,
                        rule_name,
                        ..
                    } = &verdict
                    {
                        if *tier >= Tier::Commitment && context_key.is_some() {
                            self.remember_inflight(
                                instance,
                                tool,
                                &params_digest(params),
                                &Classification {
                                    tier: *tier,
                                    context_key: context_key.clone(),
                                    rule_name: rule_name.clone(),
                                    recent_window_ms: None,
                                },
                            );
                        }
                    }
                    return verdict;
                },
                Err(error) => {
                    warn!(%error, "gate daemon unreachable, deciding against local state");
                },
            }
        }
        self.intercept_local(instance, tool, params)
    }

    fn intercept_local(&self, instance: &str, tool: &str, params: &Params) -> Verdict {
        let classification = self.classify_guarded(tool, params);
        let digest = params_digest(params);
        debug!(
            instance,
            tool,
            tier = %classification.tier,
            rule = %classification.rule_name,
            context_key = classification.context_key.as_deref().unwrap_or("-"),
            "intercepted tool call"
        );

        // The audit contract: every call journals an intercept line,
        // whatever its tier. No line, no tool run.
        let intercept = JournalEntry::new(
            instance,
            tool,
            classification.tier,
            &classification.rule_name,
            JournalAction::Intercept,
        )
        .with_context_key(classification.context_key.clone())
        .with_params_digest(digest.clone());
        if let Err(err) = self.store.append_journal(&intercept) {
            return self.persistence_block(tool, &err);
        }

        let Some(key) = classification.context_key.clone() else {
            return Verdict::Allow {
                tier: classification.tier,
                context_key: None,
                rule_name: classification.rule_name,
                warning: None,
            };
        };

        if classification.tier >= Tier::Routine {
            if let Err(err) = self
                .store
                .record_context(instance, &key, classification.tier, tool)
            {
                return self.persistence_block(tool, &err);
            }

            // Routine-tier overlap carries no enforcement, but it is
            // worth a log line: two sessions talking into the same
            // channel is exactly the failure operators grep for.
            if classification.tier == Tier::Routine {
                if let Ok(snapshot) = self.store.snapshot(Some(&key)) {
                    if let Some(other) = snapshot
                        .recent_contexts
                        .iter()
                        .find(|record| record.instance != instance)
                    {
                        warn!(
                            instance,
                            context_key = %key,
                            other_instance = %other.instance,
                            "overlapping routine activity on shared context"
                        );
                    }
                }
            }
        }

        let mut warning = None;
        if classification.tier >= Tier::Commitment {
            let window = classification
                .recent_window()
                .unwrap_or_else(|| self.config.recent_window());

            // Duplicate detection, against any instance including self
            // unless configured otherwise.
            match self.store.find_recent_on_key(&key, window) {
                Err(err) => return self.persistence_block(tool, &err),
                Ok(Some(prior))
                    if self.config.self_duplicate_check || prior.instance != instance =>
                {
                    let reason = self.pause_reason(&key, &prior, window);
                    self.journal_blocked(instance, tool, &classification, &digest, &reason);
                    return Verdict::Pause { reason };
                },
                Ok(_) => {},
            }

            // Cross-instance conflict: hard stop at tier 4, warning at
            // tier 3.
            let conflict = match self.store.check_conflict(instance, &key, classification.tier) {
                Ok(conflict) => conflict,
                Err(err) => return self.persistence_block(tool, &err),
            };
            if conflict.has_conflict {
                let with = conflict.conflict_with.as_deref().unwrap_or("unknown");
                if classification.tier == Tier::Irreversible {
                    let reason = format!(
                        "context '{key}' (tier {}) is {} instance '{with}'; irreversible calls are blocked on conflict",
                        classification.tier,
                        if conflict.locked {
                            "locked by"
                        } else {
                            "recently active from"
                        },
                    );
                    self.journal_blocked(instance, tool, &classification, &digest, &reason);
                    return Verdict::Block { reason };
                }
                warn!(
                    instance,
                    context_key = %key,
                    conflict_with = %with,
                    "cross-instance conflict on commitment-tier call, proceeding"
                );
                warning = Some(format!(
                    "instance '{with}' recently acted on '{key}'; proceeding with caution"
                ));
            }

            match self.store.acquire_lock(instance, &key, classification.tier) {
                Err(err) => return self.persistence_block(tool, &err),
                Ok(true) => {},
                Ok(false) => {
                    let holder = self.lock_holder(&key).unwrap_or_else(|| "unknown".to_string());
                    if classification.tier == Tier::Irreversible {
                        let reason = format!(
                            "advisory lock on '{key}' is held by instance '{holder}'; irreversible calls are blocked while the lock is live"
                        );
                        self.journal_blocked(instance, tool, &classification, &digest, &reason);
                        return Verdict::Block { reason };
                    }
                    warn!(
                        instance,
                        context_key = %key,
                        holder = %holder,
                        "lock acquisition lost, proceeding unlocked"
                    );
                    warning.get_or_insert_with(|| {
                        format!("could not lock '{key}' (held by '{holder}'); proceeding unlocked")
                    });
                },
            }

            self.remember_inflight(instance, tool, &digest, &classification);
        }

        Verdict::Allow {
            tier: classification.tier,
            context_key: Some(key),
            rule_name: classification.rule_name,
            warning,
        }
    }

    // =====================================================================
    // Post-call
    // =====================================================================

    /// Records a post-call event for `instance`.
    ///
    /// The pre-call classification snapshot is replayed when available;
    /// re-classification is only the fallback for calls the gate never
    /// saw (e.g. a restart between the two events).
    pub fn complete(&self, instance: &str, tool: &str, params: &Params, call_error: Option<&str>) {
        let digest = params_digest(params);
        let classification = self
            .take_inflight(&call_id(instance, tool, &digest))
            .map_or_else(|| self.classify_guarded(tool, params), |c| c.classification);

        let Some(key) = classification.context_key.clone() else {
            return;
        };
        if classification.tier < Tier::Commitment {
            return;
        }

        if let Some(client) = &self.remote {
            let request = CompleteRequest {
                instance: instance.to_string(),
                context_key: Some(key.clone()),
                result: call_error.map_or_else(|| "ok".to_string(), str::to_string),
            };
            match client.complete(&request) {
                Ok(_) => return,
                Err(error) => {
                    warn!(%error, "gate daemon unreachable, completing against local state");
                },
            }
        }

        self.complete_local(
            instance,
            tool,
            &classification,
            &key,
            &digest,
            call_error,
        );
    }

    /// Records a post-call event by context key, as the daemon receives
    /// it over the wire.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Store`] when the completion cannot be
    /// journaled.
    pub fn complete_key(&self, instance: &str, key: &str, ok: bool) -> Result<(), GateError> {
        let snapshot = self.take_inflight(&key_id(instance, key));
        let (tool, classification) = snapshot.map_or_else(
            || {
                // No snapshot (daemon restarted mid-call): journal with
                // the commitment tier the enforcement path implies.
                (
                    "remote".to_string(),
                    Classification {
                        tier: Tier::Commitment,
                        context_key: Some(key.to_string()),
                        rule_name: "remote".to_string(),
                        recent_window_ms: None,
                    },
                )
            },
            |call| (call.tool, call.classification),
        );

        let entry = JournalEntry::new(
            instance,
            &tool,
            classification.tier,
            &classification.rule_name,
            if ok {
                JournalAction::Complete
            } else {
                JournalAction::Failed
            },
        )
        .with_context_key(Some(key.to_string()));
        self.store.append_journal(&entry)?;
        self.store.release_lock(instance, key)?;
        Ok(())
    }

    fn complete_local(
        &self,
        instance: &str,
        tool: &str,
        classification: &Classification,
        key: &str,
        digest: &str,
        call_error: Option<&str>,
    ) {
        let action = if call_error.is_none() {
            JournalAction::Complete
        } else {
            JournalAction::Failed
        };
        let mut entry = JournalEntry::new(
            instance,
            tool,
            classification.tier,
            &classification.rule_name,
            action,
        )
        .with_context_key(Some(key.to_string()))
        .with_params_digest(digest);
        if let Some(message) = call_error {
            entry = entry.with_conflict_note(format!("tool error: {message}"));
        }

        // Post-call has no verdict channel; a persistence failure here is
        // logged loudly and the lock is left to its TTL.
        if let Err(error) = self.store.append_journal(&entry) {
            error!(%error, instance, context_key = %key, "failed to journal completion");
            return;
        }
        if let Err(error) = self.store.release_lock(instance, key) {
            error!(%error, instance, context_key = %key, "failed to release lock");
        }
    }

    // =====================================================================
    // Internals
    // =====================================================================

    /// Classifies with panic containment: a classifier bug degrades the
    /// call to tier 0 instead of taking the agent down.
    fn classify_guarded(&self, tool: &str, params: &Params) -> Classification {
        catch_unwind(AssertUnwindSafe(|| self.classifier.classify(tool, params))).unwrap_or_else(
            |_| {
                warn!(tool, "classifier panicked; treating call as tier 0");
                Classification {
                    tier: Tier::Inert,
                    context_key: None,
                    rule_name: "classification-error".to_string(),
                    recent_window_ms: None,
                }
            },
        )
    }

    fn persistence_block(&self, tool: &str, err: &StoreError) -> Verdict {
        error!(error = %err, tool, "coordination state unavailable; blocking call");
        Verdict::Block {
            reason: format!(
                "coordination state unavailable ({err}); refusing to run unaudited '{tool}' call"
            ),
        }
    }

    fn journal_blocked(
        &self,
        instance: &str,
        tool: &str,
        classification: &Classification,
        digest: &str,
        reason: &str,
    ) {
        let entry = JournalEntry::new(
            instance,
            tool,
            classification.tier,
            &classification.rule_name,
            JournalAction::Blocked,
        )
        .with_context_key(classification.context_key.clone())
        .with_params_digest(digest)
        .with_conflict_note(reason);
        if let Err(error) = self.store.append_journal(&entry) {
            // The call is already being refused; losing the blocked line
            // is logged but changes nothing.
            error!(%error, "failed to journal blocked call");
        }
    }

    /// Builds the pause reason: the duplicate itself, a little
    /// surrounding tier-3+ activity, and the retry instruction.
    fn pause_reason(
        &self,
        key: &str,
        prior: &JournalEntry,
        window: std::time::Duration,
    ) -> String {
        let mut reason = format!(
            "A matching action on '{key}' already completed: instance '{}' ran '{}' ({}) {} ago.",
            prior.instance,
            prior.tool,
            prior.rule_name,
            humanize_since(prior.timestamp),
        );

        let others = self
            .store
            .recent_commitments(key, window, PAUSE_CONTEXT_LIMIT)
            .unwrap_or_default();
        if !others.is_empty() {
            let summary: Vec<String> = others
                .iter()
                .map(|entry| {
                    format!(
                        "'{}' on '{}' {} ago",
                        entry.instance,
                        entry.context_key.as_deref().unwrap_or(&entry.tool),
                        humanize_since(entry.timestamp),
                    )
                })
                .collect();
            reason.push_str(&format!(
                " Other recent external actions: {}.",
                summary.join("; ")
            ));
        }

        reason.push_str(
            " If this new action is genuinely distinct from the one above, retry it; \
             otherwise it has already been done.",
        );
        reason
    }

    fn lock_holder(&self, key: &str) -> Option<String> {
        self.store
            .snapshot(Some(key))
            .ok()?
            .locks
            .into_iter()
            .next()
            .map(|lock| lock.instance)
    }

    fn remember_inflight(
        &self,
        instance: &str,
        tool: &str,
        digest: &str,
        classification: &Classification,
    ) {
        let mut inflight = self.inflight.lock().unwrap();

        // Calls whose post-call never arrived age out with the lock TTL.
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.lock_expiry())
                .unwrap_or_else(|_| chrono::Duration::days(1));
        inflight.retain(|_, call| call.recorded_at >= cutoff);

        let call = call_id(instance, tool, digest);
        let key = classification
            .context_key
            .as_ref()
            .map(|k| key_id(instance, k));
        inflight.insert(
            call.clone(),
            InflightCall {
                classification: classification.clone(),
                tool: tool.to_string(),
                recorded_at: Utc::now(),
                sibling: key.clone(),
            },
        );
        if let Some(key) = key {
            inflight.insert(
                key,
                InflightCall {
                    classification: classification.clone(),
                    tool: tool.to_string(),
                    recorded_at: Utc::now(),
                    sibling: Some(call),
                },
            );
        }
    }

    fn take_inflight(&self, id: &str) -> Option<InflightCall> {
        let mut inflight = self.inflight.lock().unwrap();
        let call = inflight.remove(id)?;
        if let Some(sibling) = &call.sibling {
            inflight.remove(sibling);
        }
        Some(call)
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("instance_id", &self.config.instance_id)
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

fn call_id(instance: &str, tool: &str, digest: &str) -> String {
    format!("call:{instance}:{tool}:{digest}")
}

fn key_id(instance: &str, key: &str) -> String {
    format!("key:{instance}:{key}")
}

/// Short stable digest of the parameter map (FNV-1a over the
/// canonically-ordered JSON). Stability matters here, collision
/// resistance does not.
#[must_use]
pub fn params_digest(params: &Params) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hash = FNV_OFFSET;
    for byte in canonical.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

/// Rough human-readable age of a timestamp, for verdict reasons.
fn humanize_since(then: DateTime<Utc>) -> String {
    let delta = Utc::now() - then;
    let seconds = delta.num_seconds().max(0);
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else if seconds < 86_400 {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        if minutes == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h{minutes}m")
        }
    } else {
        format!("{}d", seconds / 86_400)
    }
}
