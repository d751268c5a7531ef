// ABOUTME: Environment endpoints: declaration CRUD, name availability, and
// cascade deletion

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ok, ok_empty, ApiError, AppState, AuthedUser};
use crate::store::NewEnvironment;

#[derive(Debug, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub user_id: Uuid,
    pub name: String,
    pub repository_url: Option<String>,
    pub branch: Option<String>,
}

pub async fn create_environment(
    State(state): State<AppState>,
    _auth: AuthedUser,
    Json(body): Json<CreateEnvironmentRequest>,
) -> Result<Json<Value>, ApiError> {
    // Surface a missing sandbox image at declaration time, not at first
    // session create.
    let image = state.containers.sandbox().image.clone();
    match state.containers.runtime().image_exists(&image).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(ApiError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "ImageMissing",
            )
            .with_details(format!(
                "sandbox image '{image}' not found; build or pull it and retry"
            )));
        }
        Err(e) => return Err(ApiError::internal(e)),
    }

    let created = state
        .store
        .create_environment(NewEnvironment {
            user_id: body.user_id,
            name: body.name.clone(),
            repository_url: body.repository_url,
            default_branch: body.branch,
        })
        .await;

    match created {
        Ok(env) => {
            // Pre-warm the bare clone in the background; an unreachable
            // repository flips the environment to error before anyone
            // tries to create a session in it.
            if let Some(url) = env.repository_url.clone() {
                let store = state.store.clone();
                let repos = state.repos.clone();
                let env_id = env.id;
                tokio::spawn(async move {
                    if let Err(e) = repos.ensure(env_id, &url).await {
                        tracing::warn!("pre-warming clone for environment {env_id} failed: {e}");
                        let _ = store
                            .set_environment_status(
                                env_id,
                                crate::models::EnvironmentStatus::Error,
                            )
                            .await;
                    }
                });
            }
            Ok(ok(env))
        }
        Err(e @ crate::store::StoreError::NameInUse { .. }) => {
            let suggestions = suggest_names(&state, body.user_id, &body.name).await;
            Err(ApiError::from(e).with_extra("suggestions", json!(suggestions)))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let env = state
        .store
        .get_environment(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("environment {id}")))?;
    Ok(ok(env))
}

pub async fn list_user_environments(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let environments = state.store.list_environments_for_user(user_id).await?;
    let mut payload = Vec::with_capacity(environments.len());
    for env in environments {
        let sessions = state.store.list_sessions_for_environment(env.id).await?;
        let mut value = serde_json::to_value(&env).map_err(ApiError::internal)?;
        if let Value::Object(map) = &mut value {
            map.insert("sessions".to_string(), json!(sessions));
        }
        payload.push(value);
    }
    Ok(ok(json!({ "environments": payload })))
}

pub async fn check_environment_name(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    let available = state
        .store
        .environment_name_available(user_id, &name)
        .await?;
    let suggestions = if available {
        Vec::new()
    } else {
        suggest_names(&state, user_id, &name).await
    };
    Ok(ok(json!({
        "available": available,
        "name": name,
        "suggestions": suggestions,
        "message": if available {
            format!("'{name}' is available")
        } else {
            format!("'{name}' is already in use")
        },
    })))
}

pub async fn delete_environment(
    State(state): State<AppState>,
    _auth: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.reconciler.cleanup_environment(id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("environment {id}")));
    }
    Ok(ok_empty())
}

/// Numeric-suffix alternates that are actually free right now.
async fn suggest_names(state: &AppState, user_id: Uuid, base: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    for i in 2..=5 {
        let candidate = format!("{base}-{i}");
        if matches!(
            state
                .store
                .environment_name_available(user_id, &candidate)
                .await,
            Ok(true)
        ) {
            suggestions.push(candidate);
        }
        if suggestions.len() == 3 {
            break;
        }
    }
    suggestions
}
