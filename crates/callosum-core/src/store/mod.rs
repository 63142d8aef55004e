//! Coordination state shared by an agent's concurrent sessions.
//!
//! The store owns three collections, all file-backed under one state
//! directory:
//!
//! - the **journal** — append-only audit stream (JSONL, rotated by size);
//! - the **lock table** — at most one active advisory lock per context
//!   key, with TTL expiry (single JSON document);
//! - the **context record** — time-windowed trace of recent tier-2+
//!   activity (single JSON document).
//!
//! All operations on one [`CoordinationStore`] are serialized behind a
//! single mutex, so concurrent callers observe a linearizable ordering
//! across the three collections. Journal appends are durable before the
//! operation returns.
//!
//! # Cross-process deployments
//!
//! The canonical multi-process backend is a single serializing daemon
//! owning the store. Pointing several processes directly at one state
//! directory keeps the journal safe (appends only), but the lock-table
//! read-modify-write cycle is then a known best-effort race, bounded by
//! the lock TTL.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable for a coordination store.
#![allow(clippy::missing_panics_doc)]

mod context;
mod fs;
mod journal;
mod locks;


use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::context::{ContextRecord, CONTEXT_FILE};
pub use self::journal::{JournalAction, JournalEntry, DEFAULT_ROTATE_BYTES, JOURNAL_FILE};
pub use self::locks::{Lock, LOCKS_FILE};
use crate::classifier::Tier;

/// Errors from coordination-state persistence.
///
/// Any of these is fatal for the call that hit it: the gate must not
/// proceed without its audit trail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("state I/O failed at {}: {source}", path.display())]
    Io {
        /// Path of the failing file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A state value could not be serialized.
    #[error("failed to encode state: {source}")]
    Encode {
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A state document could not be parsed.
    #[error("corrupt state document at {}: {source}", path.display())]
    Decode {
        /// Path of the corrupt document.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A state document is implausibly large.
    #[error("state document at {} is {size} bytes, max {max}", path.display())]
    Oversized {
        /// Path of the oversized document.
        path: PathBuf,
        /// Observed size in bytes.
        size: u64,
        /// Permitted maximum in bytes.
        max: u64,
    },
}

/// Outcome of a conflict check on a context key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheck {
    /// Whether another instance's activity conflicts with the call.
    pub has_conflict: bool,

    /// The conflicting instance, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_with: Option<String>,

    /// `true` when the conflict is an active advisory lock (as opposed to
    /// recent context activity).
    pub locked: bool,
}

impl ConflictCheck {
    /// No conflict.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            has_conflict: false,
            conflict_with: None,
            locked: false,
        }
    }

    fn locked_by(instance: String) -> Self {
        Self {
            has_conflict: true,
            conflict_with: Some(instance),
            locked: true,
        }
    }

    fn recent_activity(instance: String) -> Self {
        Self {
            has_conflict: true,
            conflict_with: Some(instance),
            locked: false,
        }
    }
}

/// Point-in-time view of locks and recent context activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Active advisory locks.
    pub locks: Vec<Lock>,

    /// Context records inside the visibility window.
    pub recent_contexts: Vec<ContextRecord>,
}

struct Inner {
    journal: journal::Journal,
    locks: locks::LockTable,
    contexts: context::ContextLog,
    lock_ttl: Duration,
}

/// The shared coordination store.
///
/// Cheap to share behind an `Arc`; every operation takes `&self` and
/// serializes on the internal mutex.
pub struct CoordinationStore {
    inner: Mutex<Inner>,
}

impl CoordinationStore {
    /// Opens (creating if needed) the store under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the state directory cannot be
    /// created.
    pub fn open(
        state_dir: impl AsRef<Path>,
        lock_ttl: StdDuration,
        context_window: StdDuration,
    ) -> Result<Self, StoreError> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir).map_err(|source| StoreError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;

        Ok(Self {
            inner: Mutex::new(Inner {
                journal: journal::Journal::new(state_dir),
                locks: locks::LockTable::new(state_dir),
                contexts: context::ContextLog::new(state_dir, to_chrono(context_window)),
                lock_ttl: to_chrono(lock_ttl),
            }),
        })
    }

    /// Appends a journal entry, durable before return.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the append cannot be persisted. The
    /// caller must treat this as fatal for the current call.
    pub fn append_journal(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.inner.lock().unwrap().journal.append(entry)
    }

    /// Acquires or refreshes the advisory lock on `key` for `instance`.
    ///
    /// Returns `false` when another instance holds an active lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lock table cannot be read or
    /// rewritten.
    pub fn acquire_lock(&self, instance: &str, key: &str, tier: Tier) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        let ttl = inner.lock_ttl;
        inner.locks.acquire(instance, key, tier, ttl, Utc::now())
    }

    /// Releases the lock on `key` if held by `instance`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lock table cannot be rewritten.
    pub fn release_lock(&self, instance: &str, key: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .locks
            .release(instance, key, Utc::now())
    }

    /// Records tier-2+ activity on a context key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context record cannot be rewritten.
    pub fn record_context(
        &self,
        instance: &str,
        key: &str,
        tier: Tier,
        tool: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .contexts
            .record(instance, key, tier, tool, Utc::now())
    }

    /// Checks for cross-instance conflict on `key`.
    ///
    /// An active lock held by another instance always conflicts
    /// (`locked = true`). Otherwise, for tier-3+ calls, in-window context
    /// activity from another instance conflicts (`locked = false`).
    /// Same-instance activity never conflicts here; duplicate detection
    /// against self is the decision procedure's job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the underlying state cannot be read.
    pub fn check_conflict(
        &self,
        instance: &str,
        key: &str,
        tier: Tier,
    ) -> Result<ConflictCheck, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();

        if let Some(lock) = inner.locks.holder(key, now)? {
            if lock.instance != instance {
                return Ok(ConflictCheck::locked_by(lock.instance));
            }
        }

        if tier >= Tier::Commitment {
            if let Some(record) = inner.contexts.other_instance_on_key(instance, key, now)? {
                return Ok(ConflictCheck::recent_activity(record.instance));
            }
        }

        Ok(ConflictCheck::none())
    }

    /// The most recent `complete` journal entry on `key` within `window`,
    /// from any instance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the journal cannot be read.
    pub fn find_recent_on_key(
        &self,
        key: &str,
        window: StdDuration,
    ) -> Result<Option<JournalEntry>, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .journal
            .find_recent_complete(key, to_chrono(window), Utc::now())
    }

    /// Recent completed tier-3+ actions on other keys, for pause-reason
    /// context. Most recent last, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the journal cannot be read.
    pub fn recent_commitments(
        &self,
        exclude_key: &str,
        window: StdDuration,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        self.inner.lock().unwrap().journal.recent_commitments(
            exclude_key,
            to_chrono(window),
            Utc::now(),
            limit,
        )
    }

    /// The last `limit` journal entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the journal cannot be read.
    pub fn journal_tail(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError> {
        self.inner.lock().unwrap().journal.tail(limit)
    }

    /// Snapshot of active locks and recent contexts, optionally filtered
    /// to one context key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the underlying state cannot be read.
    pub fn snapshot(&self, key_filter: Option<&str>) -> Result<StoreSnapshot, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut locks = inner.locks.active(now)?;
        let mut recent_contexts = inner.contexts.recent(now)?;
        if let Some(key) = key_filter {
            locks.retain(|l| l.context_key == key);
            recent_contexts.retain(|r| r.context_key == key);
        }
        Ok(StoreSnapshot {
            locks,
            recent_contexts,
        })
    }

    /// Maintenance sweep: rewrites the lock table without expired locks.
    ///
    /// Expiry already hides stale locks from every read; this merely
    /// compacts the document. Returns the number of locks dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lock table cannot be rewritten.
    pub fn prune_stale_locks(&self) -> Result<usize, StoreError> {
        self.inner.lock().unwrap().locks.prune(Utc::now())
    }
}

impl std::fmt::Debug for CoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationStore").finish_non_exhaustive()
    }
}

/// Converts a std duration to a chrono one, saturating instead of
/// panicking on absurd values.
fn to_chrono(duration: StdDuration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365))
}
