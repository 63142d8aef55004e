//! Client for a shared gate daemon.
//!
//! In remote mode the decision procedure lives in a single serializing
//! daemon and each session's gate becomes a thin client of it. Every call
//! is a stateless request-response exchange with a bounded timeout; the
//! wire shapes here are shared with the daemon's HTTP surface.
//!
//! Transport failure is not fatal: the caller falls back to its local
//! store and logs a warning. Whether remote coordination is a hard
//! requirement is the operator's call, not this client's.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::Tier;
use crate::gate::Verdict;
use crate::store::{JournalEntry, StoreSnapshot};
use crate::Params;

/// Errors from the remote transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The daemon could not be reached or timed out.
    #[error("gate daemon unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The daemon answered with a non-success status.
    #[error("gate daemon returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },
}

/// Pre-call decision request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptRequest {
    /// Calling session.
    pub instance: String,

    /// Tool name.
    pub tool: String,

    /// The `action` parameter, surfaced for log readability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Full tool parameters.
    #[serde(default, deserialize_with = "crate::gate::null_to_empty_params")]
    pub params: Params,
}

/// Pre-call decision response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptResponse {
    /// Whether the tool may run.
    pub proceed: bool,

    /// Classified tier.
    pub tier: Tier,

    /// Context key, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,

    /// Name of the matching rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,

    /// Conflicting instances, when the call was refused or warned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<String>>,

    /// Non-fatal conflict warning for allowed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,

    /// Refusal reason when `proceed` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Whether a refusal is a pause (retry-if-distinct) rather than a
    /// hard block.
    #[serde(default)]
    pub pause: bool,

    /// Server-assigned id of this intercept.
    pub id: String,
}

impl InterceptResponse {
    /// Wraps a verdict for the wire.
    #[must_use]
    pub fn from_verdict(verdict: &Verdict, id: String) -> Self {
        match verdict {
            Verdict::Allow {
                tier,
                context_key,
                rule_name,
                warning,
            } => Self {
                proceed: true,
                tier: *tier,
                context_key: context_key.clone(),
                rule_name: Some(rule_name.clone()),
                conflicts: None,
                warning: warning.clone(),
                reason: None,
                pause: false,
                id,
            },
            Verdict::Pause { reason } => Self {
                proceed: false,
                tier: Tier::Commitment,
                context_key: None,
                rule_name: None,
                conflicts: None,
                warning: None,
                reason: Some(reason.clone()),
                pause: true,
                id,
            },
            Verdict::Block { reason } => Self {
                proceed: false,
                tier: Tier::Irreversible,
                context_key: None,
                rule_name: None,
                conflicts: None,
                warning: None,
                reason: Some(reason.clone()),
                pause: false,
                id,
            },
        }
    }

    /// Reconstructs the verdict on the client side.
    #[must_use]
    pub fn into_verdict(self) -> Verdict {
        if self.proceed {
            Verdict::Allow {
                tier: self.tier,
                context_key: self.context_key,
                rule_name: self.rule_name.unwrap_or_else(|| "remote".to_string()),
                warning: self.warning,
            }
        } else {
            let reason = self
                .reason
                .unwrap_or_else(|| "refused by gate daemon".to_string());
            if self.pause {
                Verdict::Pause { reason }
            } else {
                Verdict::Block { reason }
            }
        }
    }
}

/// Post-call completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    /// Calling session.
    pub instance: String,

    /// Context key of the completed call, when one was classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,

    /// `"ok"` on success, anything else is recorded as a failure.
    pub result: String,
}

/// Post-call completion acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    /// Whether the completion was recorded.
    pub ok: bool,
}

/// Explicit lock operation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    /// Requesting session.
    pub instance: String,

    /// Context key to claim or release.
    pub context_key: String,

    /// Tier of the claim.
    pub tier: Tier,
}

/// Explicit lock operation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    /// Whether the lock is now held (or was released).
    pub acquired: bool,

    /// The holding instance when acquisition failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<String>,
}

/// Status snapshot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Locks and recent context activity.
    #[serde(flatten)]
    pub snapshot: StoreSnapshot,
}

/// Journal tail response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalResponse {
    /// Most recent entries, append order.
    pub entries: Vec<JournalEntry>,
}

/// Blocking HTTP client for the gate daemon.
#[derive(Debug)]
pub struct GateClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl GateClient {
    /// Creates a client for `base_url` with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Transport`] when the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, RemoteError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(request)
            .send()?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json()?)
    }

    fn get<Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Resp, RemoteError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .send()?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json()?)
    }

    /// Requests a pre-call decision.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] on transport failure; the caller should
    /// fall back to its local store.
    pub fn intercept(&self, request: &InterceptRequest) -> Result<InterceptResponse, RemoteError> {
        self.post("/intercept", request)
    }

    /// Reports a post-call completion.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] on transport failure.
    pub fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, RemoteError> {
        self.post("/complete", request)
    }

    /// Explicitly acquires a lock.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] on transport failure.
    pub fn lock(&self, request: &LockRequest) -> Result<LockResponse, RemoteError> {
        self.post("/lock", request)
    }

    /// Explicitly releases a lock.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] on transport failure.
    pub fn unlock(&self, request: &LockRequest) -> Result<LockResponse, RemoteError> {
        self.post("/unlock", request)
    }

    /// Fetches the lock/context snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] on transport failure.
    pub fn status(&self, context_key: Option<&str>) -> Result<StatusResponse, RemoteError> {
        let mut query = Vec::new();
        if let Some(key) = context_key {
            query.push(("contextKey", key.to_string()));
        }
        self.get("/status", &query)
    }

    /// Fetches the journal tail.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] on transport failure.
    pub fn journal(&self, limit: Option<usize>) -> Result<JournalResponse, RemoteError> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        self.get("/journal", &query)
    }
}
