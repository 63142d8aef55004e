//! HTTP envelope around the gate.
//!
//! The daemon is the single serializing process for its state directory;
//! every route is a thin translation between the wire shapes in
//! `callosum_core::remote` and one gate or store call. Decision logic
//! lives entirely in the core.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use callosum_core::remote::{
    CompleteRequest, CompleteResponse, InterceptRequest, InterceptResponse, JournalResponse,
    LockRequest, LockResponse, StatusResponse,
};
use callosum_core::Gate;

/// Default journal tail length.
const DEFAULT_JOURNAL_LIMIT: usize = 50;

/// Shared handler state.
pub type SharedGate = Arc<Gate>;

/// Builds the daemon router.
pub fn router(gate: SharedGate) -> Router {
    Router::new()
        .route("/intercept", post(intercept))
        .route("/complete", post(complete))
        .route("/lock", post(lock))
        .route("/unlock", post(unlock))
        .route("/status", get(status))
        .route("/journal", get(journal))
        .with_state(gate)
}

/// Store failures map to 500 with the error in the body; the client's
/// fallback policy takes it from there.
#[derive(Debug)]
struct AppError(callosum_core::GateError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E: Into<callosum_core::GateError>> From<E> for AppError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

async fn intercept(
    State(gate): State<SharedGate>,
    Json(request): Json<InterceptRequest>,
) -> Json<InterceptResponse> {
    let verdict = gate.intercept(&request.instance, &request.tool, &request.params);
    info!(
        instance = %request.instance,
        tool = %request.tool,
        blocking = verdict.is_blocking(),
        "intercept decided"
    );
    Json(InterceptResponse::from_verdict(
        &verdict,
        Uuid::new_v4().to_string(),
    ))
}

async fn complete(
    State(gate): State<SharedGate>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, AppError> {
    if let Some(key) = &request.context_key {
        gate.complete_key(&request.instance, key, request.result == "ok")?;
    }
    Ok(Json(CompleteResponse { ok: true }))
}

async fn lock(
    State(gate): State<SharedGate>,
    Json(request): Json<LockRequest>,
) -> Result<Json<LockResponse>, AppError> {
    let acquired =
        gate.store()
            .acquire_lock(&request.instance, &request.context_key, request.tier)?;
    let conflict = if acquired {
        None
    } else {
        gate.store()
            .snapshot(Some(&request.context_key))?
            .locks
            .into_iter()
            .next()
            .map(|lock| lock.instance)
    };
    Ok(Json(LockResponse { acquired, conflict }))
}

async fn unlock(
    State(gate): State<SharedGate>,
    Json(request): Json<LockRequest>,
) -> Result<Json<LockResponse>, AppError> {
    gate.store()
        .release_lock(&request.instance, &request.context_key)?;
    Ok(Json(LockResponse {
        acquired: true,
        conflict: None,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    context_key: Option<String>,
}

async fn status(
    State(gate): State<SharedGate>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let snapshot = gate.store().snapshot(query.context_key.as_deref())?;
    Ok(Json(StatusResponse { snapshot }))
}

#[derive(Debug, Deserialize)]
struct JournalQuery {
    limit: Option<usize>,
}

async fn journal(
    State(gate): State<SharedGate>,
    Query(query): Query<JournalQuery>,
) -> Result<Json<JournalResponse>, AppError> {
    let entries = gate
        .store()
        .journal_tail(query.limit.unwrap_or(DEFAULT_JOURNAL_LIMIT))?;
    Ok(Json(JournalResponse { entries }))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use callosum_core::{GateConfig, Params, Tier};

    use super::*;

    fn shared_gate(dir: &TempDir) -> SharedGate {
        let mut config = GateConfig::new("daemon");
        config.state_dir = dir.path().to_path_buf();
        Arc::new(Gate::new(config).expect("gate builds"))
    }

    #[tokio::test]
    async fn test_intercept_and_complete_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let gate = shared_gate(&dir);

        let request = InterceptRequest {
            instance: "alpha".to_string(),
            tool: "message".to_string(),
            action: Some("channel-delete".to_string()),
            params: serde_json::from_str::<Params>(r#"{"action": "channel-delete"}"#)
                .expect("params"),
        };
        let Json(response) = intercept(State(gate.clone()), Json(request)).await;
        assert!(response.proceed);
        assert_eq!(response.tier, Tier::Irreversible);
        assert_eq!(
            response.context_key.as_deref(),
            Some("message:channel-delete")
        );
        assert!(!response.id.is_empty());

        let complete_request = CompleteRequest {
            instance: "alpha".to_string(),
            context_key: response.context_key.clone(),
            result: "ok".to_string(),
        };
        let result = complete(State(gate.clone()), Json(complete_request)).await;
        assert!(result.expect("complete succeeds").ok);

        let Json(status_response) = status(
            State(gate),
            Query(StatusQuery { context_key: None }),
        )
        .await
        .expect("status");
        assert!(status_response.snapshot.locks.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_lock_conflict_names_holder() {
        let dir = TempDir::new().expect("temp dir");
        let gate = shared_gate(&dir);

        let alpha = LockRequest {
            instance: "alpha".to_string(),
            context_key: "deploy:api".to_string(),
            tier: Tier::Irreversible,
        };
        let Json(first) = lock(State(gate.clone()), Json(alpha)).await.expect("lock");
        assert!(first.acquired);

        let beta = LockRequest {
            instance: "beta".to_string(),
            context_key: "deploy:api".to_string(),
            tier: Tier::Irreversible,
        };
        let Json(second) = lock(State(gate.clone()), Json(beta.clone()))
            .await
            .expect("lock");
        assert!(!second.acquired);
        assert_eq!(second.conflict.as_deref(), Some("alpha"));

        // Unlock by a non-holder is a no-op; the holder releases.
        let Json(_) = unlock(State(gate.clone()), Json(beta)).await.expect("unlock");
        let release = LockRequest {
            instance: "alpha".to_string(),
            context_key: "deploy:api".to_string(),
            tier: Tier::Irreversible,
        };
        let Json(_) = unlock(State(gate.clone()), Json(release)).await.expect("unlock");
        let Json(status_response) = status(
            State(gate),
            Query(StatusQuery {
                context_key: Some("deploy:api".to_string()),
            }),
        )
        .await
        .expect("status");
        assert!(status_response.snapshot.locks.is_empty());
    }

    #[tokio::test]
    async fn test_journal_tail_default_limit() {
        let dir = TempDir::new().expect("temp dir");
        let gate = shared_gate(&dir);

        for _ in 0..3 {
            let request = InterceptRequest {
                instance: "alpha".to_string(),
                tool: "weather".to_string(),
                action: None,
                params: Params::new(),
            };
            let _ = intercept(State(gate.clone()), Json(request)).await;
        }

        let Json(response) = journal(State(gate), Query(JournalQuery { limit: None }))
            .await
            .expect("journal");
        assert_eq!(response.entries.len(), 3);
    }
}
