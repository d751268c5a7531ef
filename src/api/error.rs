// ABOUTME: HTTP error envelope: typed error kinds mapped onto status codes
// with details and conflict payloads

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use crate::docker::ContainerError;
use crate::repo::RepoError;
use crate::session::ReconcileError;
use crate::store::StoreError;
use crate::worktree::WorktreeError;

/// An API failure: `{success: false, error, details?, ...extra}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub details: Option<String>,
    pub extra: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str) -> Self {
        Self {
            status,
            code,
            details: None,
            extra: Map::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound").with_details(what)
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal").with_details(err.to_string())
    }

    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthenticated")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(false));
        body.insert("error".to_string(), Value::String(self.code.to_string()));
        if let Some(details) = self.details {
            body.insert("details".to_string(), Value::String(details));
        }
        body.extend(self.extra);
        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NameInUse { existing } => {
                ApiError::new(StatusCode::CONFLICT, "NameInUse")
                    .with_details(format!("environment name '{}' is taken", existing.name))
                    .with_extra("existing", json!(existing))
            }
            StoreError::SessionNameInUse { existing } => {
                ApiError::new(StatusCode::CONFLICT, "SESSION_NAME_IN_USE")
                    .with_details(format!("session name '{}' is taken", existing.name))
                    .with_extra("existingSession", json!(existing))
            }
            StoreError::BranchInUse { existing } => {
                ApiError::new(StatusCode::CONFLICT, "BRANCH_IN_USE")
                    .with_details(format!(
                        "branch '{}' is bound to session '{}'",
                        existing.git_branch.as_deref().unwrap_or_default(),
                        existing.name
                    ))
                    .with_extra("existingSession", json!(existing))
            }
            StoreError::NotFound(what) => ApiError::not_found(what),
            other => ApiError::internal(other),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::SessionNotFound(id) => ApiError::not_found(format!("session {id}")),
            ReconcileError::SessionDead(id) => {
                ApiError::new(StatusCode::CONFLICT, "SessionDead")
                    .with_details(format!("session {id} is dead"))
            }
            ReconcileError::NoBranch(_) | ReconcileError::NoRepository(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "Internal").with_details(err.to_string())
            }
            ReconcileError::Repo(RepoError::RepoUnavailable { url, cause }) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "RepoUnavailable")
                    .with_details(format!("repository {url} unavailable: {cause}"))
            }
            ReconcileError::Repo(other) => ApiError::internal(other),
            ReconcileError::Container(ContainerError::ImageMissing { image }) => {
                ApiError::new(StatusCode::BAD_REQUEST, "ImageMissing").with_details(format!(
                    "sandbox image '{image}' not found; build or pull it and retry"
                ))
            }
            ReconcileError::Container(ContainerError::MountReadOnly { path }) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "MountReadOnly")
                    .with_details(format!(
                        "mount {path} is read-only: the bare repository must be mounted read-write"
                    ))
            }
            ReconcileError::Container(ContainerError::ContainerGone(id)) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ContainerGone")
                    .with_details(id)
            }
            ReconcileError::Container(other) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ContainerCreateFailed")
                    .with_details(other.to_string())
            }
            ReconcileError::Worktree(WorktreeError::MountReadOnly { path }) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "MountReadOnly")
                    .with_details(format!(
                        "mount {path} is read-only: the bare repository must be mounted read-write"
                    ))
            }
            ReconcileError::Worktree(WorktreeError::BranchNotFoundAndNoDefault) => {
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "BranchNotFoundAndNoDefault",
                )
                .with_details("repository has no branches to base a worktree on")
            }
            ReconcileError::Worktree(other) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "GitFailure")
                    .with_details(other.to_string())
            }
            ReconcileError::Store(store_err) => store_err.into(),
        }
    }
}
