// ABOUTME: Agent configuration endpoints; credentials are sealed before they
// touch the store and never serialized back out

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{ok, ok_empty, ApiError, AppState, AuthedUser};
use crate::models::Agent;

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub user_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub credential: Option<String>,
}

pub async fn create_agent(
    State(state): State<AppState>,
    _auth: AuthedUser,
    Json(body): Json<CreateAgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut agent = Agent::new(body.user_id, body.name, body.agent_type);
    if let Some(credential) = body.credential.as_deref() {
        let sealed = state
            .sealer
            .seal(credential.as_bytes())
            .map_err(ApiError::internal)?;
        agent.credential = Some(sealed);
    }
    state.store.create_agent(&agent).await?;
    Ok(ok(agent))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .store
        .get_agent(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent {id}")))?;
    Ok(ok(agent))
}

pub async fn list_user_agents(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let agents = state.store.list_agents_for_user(user_id).await?;
    Ok(ok(agents))
}

/// Deleting an agent destroys its sealed credential with it.
pub async fn delete_agent(
    State(state): State<AppState>,
    _auth: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_agent(id).await? {
        return Err(ApiError::not_found(format!("agent {id}")));
    }
    Ok(ok_empty())
}
