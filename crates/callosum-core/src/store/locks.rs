//! Advisory lock table.
//!
//! At most one active lock exists per context key. A lock is a
//! time-bounded claim: re-acquisition by the holder refreshes the expiry,
//! release removes it, and expiry makes it invisible to every subsequent
//! read — the TTL is the authoritative release path for crashed holders.
//!
//! The table is a single JSON document rewritten atomically on each
//! mutation; at the expected scale (tens of locks) that is cheaper than
//! anything clever.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::fs::{atomic_write_json, read_json_or_default};
use super::StoreError;
use crate::classifier::Tier;

/// Lock table file name inside the state directory.
pub const LOCKS_FILE: &str = "locks.json";

/// An advisory claim on a context key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    /// Holding instance.
    pub instance: String,

    /// Claimed context key.
    pub context_key: String,

    /// Tier of the call that took the lock.
    pub tier: Tier,

    /// When the claim was first created.
    pub acquired_at: DateTime<Utc>,

    /// When the claim lapses. Refreshed on same-instance re-acquire.
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// Whether the lock is still active at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LockDocument {
    locks: Vec<Lock>,
}

/// The lock table file.
#[derive(Debug)]
pub(crate) struct LockTable {
    path: PathBuf,
}

impl LockTable {
    pub(crate) fn new(state_dir: &std::path::Path) -> Self {
        Self {
            path: state_dir.join(LOCKS_FILE),
        }
    }

    /// Loads the table, dropping expired locks.
    fn load(&self, now: DateTime<Utc>) -> Result<Vec<Lock>, StoreError> {
        let document: LockDocument = read_json_or_default(&self.path)?;
        Ok(document
            .locks
            .into_iter()
            .filter(|lock| lock.is_active(now))
            .collect())
    }

    fn persist(&self, locks: Vec<Lock>) -> Result<(), StoreError> {
        atomic_write_json(&self.path, &LockDocument { locks })
    }

    /// Acquires or refreshes the lock on `key` for `instance`.
    ///
    /// Returns `true` when the instance now holds the lock: either no
    /// active lock existed (created) or the instance already held it
    /// (expiry extended). Returns `false` when another instance holds an
    /// active lock. Expired locks are pruned as a side effect.
    pub(crate) fn acquire(
        &self,
        instance: &str,
        key: &str,
        tier: Tier,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.load(now)?;

        if let Some(existing) = locks.iter_mut().find(|l| l.context_key == key) {
            if existing.instance != instance {
                return Ok(false);
            }
            existing.expires_at = now + ttl;
            existing.tier = tier;
            self.persist(locks)?;
            return Ok(true);
        }

        locks.push(Lock {
            instance: instance.to_string(),
            context_key: key.to_string(),
            tier,
            acquired_at: now,
            expires_at: now + ttl,
        });
        self.persist(locks)?;
        Ok(true)
    }

    /// Releases the lock on `key` if `instance` holds it. Idempotent:
    /// releasing an absent or foreign lock is a no-op.
    pub(crate) fn release(
        &self,
        instance: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let locks = self.load(now)?;
        let before = locks.len();
        let kept: Vec<Lock> = locks
            .into_iter()
            .filter(|l| !(l.context_key == key && l.instance == instance))
            .collect();
        if kept.len() != before {
            self.persist(kept)?;
        }
        Ok(())
    }

    /// The active holder of `key`, if any.
    pub(crate) fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Lock>, StoreError> {
        Ok(self.load(now)?.into_iter().find(|l| l.context_key == key))
    }

    /// All active locks.
    pub(crate) fn active(&self, now: DateTime<Utc>) -> Result<Vec<Lock>, StoreError> {
        self.load(now)
    }

    /// Rewrites the document without expired locks, returning how many
    /// were dropped.
    pub(crate) fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let document: LockDocument = read_json_or_default(&self.path)?;
        let before = document.locks.len();
        let kept: Vec<Lock> = document
            .locks
            .into_iter()
            .filter(|lock| lock.is_active(now))
            .collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.persist(kept)?;
        }
        Ok(dropped)
    }
}
