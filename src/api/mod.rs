// ABOUTME: HTTP surface: shared state, auth extractor, response envelope,
// and the route table

pub mod agents;
pub mod environments;
pub mod error;
pub mod sessions;
pub mod terminal;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderValue, Method};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{Auth, Principal};
use crate::crypto::CredentialSealer;
use crate::docker::ContainerManager;
use crate::repo::RepoCache;
use crate::session::SessionReconciler;
use crate::store::Store;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub auth: Auth,
    pub sealer: CredentialSealer,
    pub containers: Arc<ContainerManager>,
    pub reconciler: Arc<SessionReconciler>,
    pub repos: RepoCache,
}

/// Bearer-authenticated caller, required on every mutating endpoint.
pub struct AuthedUser(pub Principal);

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(ApiError::unauthenticated)?;
        let principal = state
            .auth
            .authenticate(token)
            .map_err(|_| ApiError::unauthenticated())?;
        Ok(AuthedUser(principal))
    }
}

/// `{success: true, data: ...}`
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// `{success: true}`
pub fn ok_empty() -> Json<Value> {
    Json(json!({ "success": true }))
}

pub fn router(state: AppState, cors_origin: Option<&str>) -> Router {
    let cors = match cors_origin {
        Some(origin) if origin != "*" => CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<HeaderValue>()
                    .unwrap_or_else(|_| HeaderValue::from_static("*")),
            )
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any),
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/environments", post(environments::create_environment))
        .route(
            "/api/environments/user/{user_id}",
            get(environments::list_user_environments),
        )
        .route(
            "/api/environments/check-name/{user_id}/{name}",
            get(environments::check_environment_name),
        )
        .route(
            "/api/environments/{id}",
            get(environments::get_environment).delete(environments::delete_environment),
        )
        .route("/api/sessions", post(sessions::create_session))
        .route(
            "/api/sessions/environment/{env_id}",
            get(sessions::list_environment_sessions),
        )
        .route(
            "/api/sessions/check-name/{env_id}/{name}",
            get(sessions::check_session_name),
        )
        .route(
            "/api/sessions/check-branch/{env_id}/{branch}",
            get(sessions::check_session_branch),
        )
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/sessions/{id}/status", get(sessions::session_status))
        .route("/api/agents", post(agents::create_agent))
        .route("/api/agents/user/{user_id}", get(agents::list_user_agents))
        .route(
            "/api/agents/{id}",
            get(agents::get_agent).delete(agents::delete_agent),
        )
        .route("/terminal/ws/{session_id}", get(terminal::terminal_ws))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    ok(json!({ "status": "ok" }))
}
