//! Short-horizon context-activity record.
//!
//! Every tier-2+ call with a context key leaves a trace here so other
//! instances can see what resources were recently touched. Records older
//! than the context window are invisible to reads and dropped from the
//! document on the next write.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::fs::{atomic_write_json, read_json_or_default};
use super::StoreError;
use crate::classifier::Tier;

/// Context record file name inside the state directory.
pub const CONTEXT_FILE: &str = "context.json";

/// One trace of recent activity on a context key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    /// Instance that acted.
    pub instance: String,

    /// Context key that was touched.
    pub context_key: String,

    /// Tier of the action.
    pub tier: Tier,

    /// When the action was intercepted.
    pub timestamp: DateTime<Utc>,

    /// Tool that performed it.
    pub tool: String,
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextDocument {
    records: Vec<ContextRecord>,
}

/// The windowed context-activity file.
#[derive(Debug)]
pub(crate) struct ContextLog {
    path: PathBuf,
    window: Duration,
}

impl ContextLog {
    pub(crate) fn new(state_dir: &std::path::Path, window: Duration) -> Self {
        Self {
            path: state_dir.join(CONTEXT_FILE),
            window,
        }
    }

    fn load(&self, now: DateTime<Utc>) -> Result<Vec<ContextRecord>, StoreError> {
        let cutoff = now - self.window;
        let document: ContextDocument = read_json_or_default(&self.path)?;
        Ok(document
            .records
            .into_iter()
            .filter(|record| record.timestamp >= cutoff)
            .collect())
    }

    /// Appends a record stamped `now`, pruning anything outside the
    /// window while the document is being rewritten anyway.
    pub(crate) fn record(
        &self,
        instance: &str,
        key: &str,
        tier: Tier,
        tool: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.load(now)?;
        records.push(ContextRecord {
            instance: instance.to_string(),
            context_key: key.to_string(),
            tier,
            timestamp: now,
            tool: tool.to_string(),
        });
        atomic_write_json(&self.path, &ContextDocument { records })
    }

    /// All records inside the window, oldest first.
    pub(crate) fn recent(&self, now: DateTime<Utc>) -> Result<Vec<ContextRecord>, StoreError> {
        self.load(now)
    }

    /// The most recent in-window record on `key` from an instance other
    /// than `instance`.
    pub(crate) fn other_instance_on_key(
        &self,
        instance: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ContextRecord>, StoreError> {
        Ok(self
            .load(now)?
            .into_iter()
            .rev()
            .find(|record| record.context_key == key && record.instance != instance))
    }
}
