//! Gate configuration.
//!
//! A [`GateConfig`] describes one deployment of the gate: where state
//! lives, the coordination horizons, and whether decisions are made
//! locally or delegated to a shared daemon. All fields except
//! `instance_id` have serviceable defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default advisory-lock TTL: 5 minutes.
pub const DEFAULT_LOCK_EXPIRY_MS: u64 = 300_000;

/// Default duplicate-detection window: 1 hour.
pub const DEFAULT_RECENT_WINDOW_MS: u64 = 3_600_000;

/// Default cross-instance context visibility window: 30 minutes.
pub const DEFAULT_CONTEXT_WINDOW_MS: u64 = 1_800_000;

/// Default remote transport timeout: 5 seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Errors raised while loading or validating configuration and rule files.
///
/// Every variant is fatal at startup: a gate with a broken rule list must
/// refuse to run rather than misclassify.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration or rule file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration or rule file is not valid JSON.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A rule carries a tier outside 0..=4.
    #[error("rule '{rule}' has tier {tier}, expected 0..=4")]
    InvalidTier {
        /// Name of the offending rule.
        rule: String,
        /// The out-of-range tier value.
        tier: u8,
    },

    /// A rule's `commandPattern` is not a valid regular expression.
    #[error("rule '{rule}' has an invalid command pattern: {source}")]
    InvalidCommandPattern {
        /// Name of the offending rule.
        rule: String,
        /// Underlying regex compile error.
        #[source]
        source: regex::Error,
    },

    /// A rule has an empty name.
    #[error("rule at index {index} has an empty name")]
    EmptyRuleName {
        /// Position of the offending rule in the list.
        index: usize,
    },

    /// `instance_id` is empty.
    #[error("instance_id must be non-empty")]
    MissingInstanceId,

    /// Remote mode was requested without a server URL.
    #[error("mode is 'remote' but server_url is not set")]
    MissingServerUrl,
}

/// Where gate decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Decide against the local state directory.
    #[default]
    Local,
    /// Delegate to a shared daemon, falling back to local on transport
    /// failure.
    Remote,
}

/// Configuration for one gate instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateConfig {
    /// Identifier of this session among the agent's concurrent sessions.
    pub instance_id: String,

    /// Directory holding the journal, lock table, and context record.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Advisory-lock TTL in milliseconds.
    #[serde(default = "default_lock_expiry_ms")]
    pub lock_expiry_ms: u64,

    /// Duplicate-detection window in milliseconds (per-rule windows
    /// override this).
    #[serde(default = "default_recent_window_ms")]
    pub recent_window_ms: u64,

    /// Cross-instance context visibility window in milliseconds.
    #[serde(default = "default_context_window_ms")]
    pub context_window_ms: u64,

    /// Local or remote decision mode.
    #[serde(default)]
    pub mode: GateMode,

    /// Daemon base URL, required when `mode` is remote.
    #[serde(default)]
    pub server_url: Option<String>,

    /// Remote transport timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Whether duplicate detection also matches this instance's own recent
    /// actions. When false, only other instances trigger the duplicate
    /// pause.
    #[serde(default = "default_true")]
    pub self_duplicate_check: bool,

    /// Explicit rule file path. When unset, `tiers.json` in the state
    /// directory is used if present, else the built-in defaults.
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".callosum")
}

const fn default_lock_expiry_ms() -> u64 {
    DEFAULT_LOCK_EXPIRY_MS
}

const fn default_recent_window_ms() -> u64 {
    DEFAULT_RECENT_WINDOW_MS
}

const fn default_context_window_ms() -> u64 {
    DEFAULT_CONTEXT_WINDOW_MS
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

const fn default_true() -> bool {
    true
}

impl GateConfig {
    /// Creates a configuration with defaults for the given instance.
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state_dir: default_state_dir(),
            lock_expiry_ms: DEFAULT_LOCK_EXPIRY_MS,
            recent_window_ms: DEFAULT_RECENT_WINDOW_MS,
            context_window_ms: DEFAULT_CONTEXT_WINDOW_MS,
            mode: GateMode::Local,
            server_url: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            self_duplicate_check: true,
            rules_file: None,
        }
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the parsed configuration fails [`GateConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingInstanceId`] for an empty instance id,
    /// or [`ConfigError::MissingServerUrl`] when remote mode lacks a URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.is_empty() {
            return Err(ConfigError::MissingInstanceId);
        }
        if self.mode == GateMode::Remote && self.server_url.is_none() {
            return Err(ConfigError::MissingServerUrl);
        }
        Ok(())
    }

    /// Advisory-lock TTL as a [`Duration`].
    #[must_use]
    pub const fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    /// Default duplicate-detection window as a [`Duration`].
    #[must_use]
    pub const fn recent_window(&self) -> Duration {
        Duration::from_millis(self.recent_window_ms)
    }

    /// Context visibility window as a [`Duration`].
    #[must_use]
    pub const fn context_window(&self) -> Duration {
        Duration::from_millis(self.context_window_ms)
    }

    /// Remote transport timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolves the rule file to load, if any exists.
    #[must_use]
    pub fn resolve_rules_file(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.rules_file {
            return Some(explicit.clone());
        }
        let implicit = self.state_dir.join("tiers.json");
        implicit.exists().then_some(implicit)
    }
}
