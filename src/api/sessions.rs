// ABOUTME: Session endpoints: declare-and-reconcile creation, status probes,
// availability checks, deletion

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ok, ok_empty, ApiError, AppState, AuthedUser};
use crate::models::{EnvironmentStatus, SessionType};
use crate::store::NewSession;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub environment_id: Uuid,
    pub name: Option<String>,
    pub branch: Option<String>,
    pub working_directory: Option<String>,
    pub session_type: Option<SessionType>,
    pub agent_id: Option<Uuid>,
}

/// Declare a session and run the reconciler to quiescence before replying,
/// so a 200 means a running container with the branch checked out.
pub async fn create_session(
    State(state): State<AppState>,
    _auth: AuthedUser,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let env = state
        .store
        .get_environment(body.environment_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment {}", body.environment_id)))?;
    if env.status == EnvironmentStatus::Error {
        return Err(
            ApiError::new(StatusCode::BAD_REQUEST, "EnvironmentError").with_details(format!(
                "environment '{}' is in error state",
                env.name
            )),
        );
    }

    let branch = body
        .branch
        .clone()
        .unwrap_or_else(|| env.default_branch.clone());
    let name = body.name.clone().unwrap_or_else(|| branch.clone());

    let session = state
        .store
        .create_session(NewSession {
            environment_id: env.id,
            name,
            git_branch: Some(branch),
            working_directory: body.working_directory,
            session_type: body.session_type.unwrap_or_default(),
            agent_id: body.agent_id,
        })
        .await?;

    state.reconciler.ensure_session_container(session.id).await?;

    // Re-read: the reconciler filled in container_id and status.
    let session = state
        .store
        .get_session(session.id)
        .await?
        .ok_or_else(|| ApiError::internal("session vanished during creation"))?;
    Ok(ok(session))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id}")))?;
    Ok(ok(session))
}

pub async fn list_environment_sessions(
    State(state): State<AppState>,
    Path(env_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let sessions = state.store.list_sessions_for_environment(env_id).await?;
    Ok(ok(json!({ "sessions": sessions })))
}

/// Store status plus a live runtime probe. `is_realtime` says whether the
/// runtime confirmed a running container just now.
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id}")))?;

    let is_realtime = match session.container_id.as_deref() {
        Some(container_id) => matches!(
            state.containers.runtime().inspect(container_id).await,
            Ok(Some(ref c)) if c.running
        ),
        None => false,
    };

    Ok(ok(json!({
        "session_id": session.id,
        "status": session.status,
        "is_realtime": is_realtime,
        "checked_at": Utc::now(),
    })))
}

pub async fn check_session_name(
    State(state): State<AppState>,
    Path((env_id, name)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    let existing = state.store.find_live_session_by_name(env_id, &name).await?;
    Ok(availability(&name, "name", existing.is_none()))
}

pub async fn check_session_branch(
    State(state): State<AppState>,
    Path((env_id, branch)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    let existing = state
        .store
        .find_live_session_by_branch(env_id, &branch)
        .await?;
    Ok(availability(&branch, "branch", existing.is_none()))
}

pub async fn delete_session(
    State(state): State<AppState>,
    _auth: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.reconciler.cleanup_session(id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    Ok(ok_empty())
}

fn availability(value: &str, what: &str, available: bool) -> Json<Value> {
    ok(json!({
        "available": available,
        what: value,
        "message": if available {
            format!("{what} '{value}' is available")
        } else {
            format!("{what} '{value}' is already in use by a live session")
        },
    }))
}
