//! Append-only audit journal.
//!
//! Every intercepted tool call lands here, one self-contained JSON object
//! per line. The file is strictly append-only: entries are never mutated
//! or deleted by the gate. When the active file exceeds the rotation
//! threshold it is renamed aside (`journal` → `journal.1` → `journal.2`)
//! *before* the pending append, so rotation can never drop an in-flight
//! entry.
//!
//! Lookups (`tail`, `find_recent_complete`) scan the active file only;
//! rotated files are retained for offline audit, not consulted by the
//! decision path. The duplicate-detection windows are far shorter than
//! the time a 2 MiB journal covers in practice, which keeps the bounded
//! scan honest.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::StoreError;
use crate::classifier::Tier;

/// Rotation threshold for the active journal file: 2 MiB.
pub const DEFAULT_ROTATE_BYTES: u64 = 2 * 1024 * 1024;

/// Journal file name inside the state directory.
pub const JOURNAL_FILE: &str = "journal";

/// What happened to the intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalAction {
    /// Pre-call event observed; the call was admitted to the gate.
    Intercept,
    /// Post-call event observed with no error.
    Complete,
    /// Post-call event observed with an error.
    Failed,
    /// The gate refused the call (block or pause).
    Blocked,
}

impl JournalAction {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intercept => "intercept",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

/// One immutable journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Wall-clock time of the event. Best-effort sortable; the primary
    /// ordering is append order.
    pub timestamp: DateTime<Utc>,

    /// Session that issued the call.
    pub instance: String,

    /// Tool name.
    pub tool: String,

    /// Classified tier.
    pub tier: Tier,

    /// Name of the rule that classified the call.
    pub rule_name: String,

    /// Context key, when the rule produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,

    /// Outcome recorded by this line.
    pub action: JournalAction,

    /// Short stable digest of the parameter map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_digest: Option<String>,

    /// Why the gate refused or warned, for `blocked` lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_note: Option<String>,
}

impl JournalEntry {
    /// Creates an entry stamped with the current wall clock.
    #[must_use]
    pub fn new(
        instance: impl Into<String>,
        tool: impl Into<String>,
        tier: Tier,
        rule_name: impl Into<String>,
        action: JournalAction,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            instance: instance.into(),
            tool: tool.into(),
            tier,
            rule_name: rule_name.into(),
            context_key: None,
            action,
            params_digest: None,
            conflict_note: None,
        }
    }

    /// Sets the context key (builder pattern).
    #[must_use]
    pub fn with_context_key(mut self, key: Option<String>) -> Self {
        self.context_key = key;
        self
    }

    /// Sets the params digest (builder pattern).
    #[must_use]
    pub fn with_params_digest(mut self, digest: impl Into<String>) -> Self {
        self.params_digest = Some(digest.into());
        self
    }

    /// Sets the conflict note (builder pattern).
    #[must_use]
    pub fn with_conflict_note(mut self, note: impl Into<String>) -> Self {
        self.conflict_note = Some(note.into());
        self
    }
}

/// The append-only journal file.
#[derive(Debug)]
pub(crate) struct Journal {
    path: PathBuf,
    rotate_bytes: u64,
}

impl Journal {
    pub(crate) fn new(state_dir: &std::path::Path) -> Self {
        Self {
            path: state_dir.join(JOURNAL_FILE),
            rotate_bytes: DEFAULT_ROTATE_BYTES,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_rotate_bytes(mut self, rotate_bytes: u64) -> Self {
        self.rotate_bytes = rotate_bytes;
        self
    }

    /// Appends one entry, durable before return.
    pub(crate) fn append(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.rotate_if_needed()?;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let mut line =
            serde_json::to_vec(entry).map_err(|source| StoreError::Encode { source })?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(&line).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Rotates the active file aside when it has outgrown the threshold.
    ///
    /// Rotation happens before the pending append, so the fresh entry
    /// always lands in the new active file.
    fn rotate_if_needed(&self) -> Result<(), StoreError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            },
        };
        if size <= self.rotate_bytes {
            return Ok(());
        }

        let first = self.path.with_extension("1");
        let second = self.path.with_extension("2");
        if first.exists() {
            fs::rename(&first, &second).map_err(|source| StoreError::Io {
                path: first.clone(),
                source,
            })?;
        }
        fs::rename(&self.path, &first).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Reads every parseable entry of the active file, in append order.
    ///
    /// Unparseable lines are skipped with a warning rather than failing
    /// the read; a single corrupt line must not take the audit trail down.
    pub(crate) fn read_all(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            },
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            },
        };

        let mut entries = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    warn!(line = number + 1, %error, "skipping unparseable journal line");
                },
            }
        }
        Ok(entries)
    }

    /// The last `limit` entries, in append order.
    pub(crate) fn tail(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError> {
        let mut entries = self.read_all()?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Most recent `complete` entry on `key` not older than `window`.
    pub(crate) fn find_recent_complete(
        &self,
        key: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JournalEntry>, StoreError> {
        let cutoff = now - window;
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|entry| {
                entry.action == JournalAction::Complete
                    && entry.context_key.as_deref() == Some(key)
                    && entry.timestamp >= cutoff
            }))
    }

    /// Recent completed tier-3+ actions on keys other than `exclude_key`,
    /// most recent last, at most `limit` of them. Supplemental context for
    /// pause reasons.
    pub(crate) fn recent_commitments(
        &self,
        exclude_key: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let cutoff = now - window;
        let mut recent: Vec<JournalEntry> = self
            .read_all()?
            .into_iter()
            .filter(|entry| {
                entry.action == JournalAction::Complete
                    && entry.tier >= Tier::Commitment
                    && entry.timestamp >= cutoff
                    && entry.context_key.as_deref() != Some(exclude_key)
            })
            .collect();
        if recent.len() > limit {
            recent.drain(..recent.len() - limit);
        }
        Ok(recent)
    }
}
