// ABOUTME: User and agent rows; credentials are stored as opaque sealed blobs

use sqlx::FromRow;
use uuid::Uuid;

use super::{now_rfc3339, parse_datetime, parse_uuid, Store, StoreError};
use crate::models::{Agent, User};

#[derive(FromRow)]
struct UserRow {
    id: String,
    username: String,
    vcs_credential: Option<Vec<u8>>,
    created_at: String,
    updated_at: String,
}

#[derive(FromRow)]
struct AgentRow {
    id: String,
    user_id: String,
    name: String,
    agent_type: String,
    credential: Option<Vec<u8>>,
    created_at: String,
    updated_at: String,
}

impl Store {
    /// Insert the user row if it does not exist yet. Registration proper
    /// lives outside the core; this keeps foreign keys satisfied for
    /// environments created against a fresh user id.
    pub async fn ensure_user(&self, id: Uuid) -> Result<(), StoreError> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, username, created_at, updated_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(format!("user-{}", &id.to_string()[..8]))
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, vcs_credential, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(|r| {
            Ok(User {
                id: parse_uuid(&r.id, "users.id")?,
                username: r.username,
                vcs_credential: r.vcs_credential,
                created_at: parse_datetime(&r.created_at, "users.created_at")?,
                updated_at: parse_datetime(&r.updated_at, "users.updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn set_user_credential(
        &self,
        id: Uuid,
        sealed: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET vcs_credential = ?, updated_at = ? WHERE id = ?")
            .bind(sealed)
            .bind(now_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn create_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.ensure_user(agent.user_id).await?;
        sqlx::query(
            "INSERT INTO agents (id, user_id, name, agent_type, credential, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(agent.user_id.to_string())
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(agent.credential.as_deref())
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.updated_at.to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT id, user_id, name, agent_type, credential, created_at, updated_at \
             FROM agents WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(agent_from_row).transpose()
    }

    pub async fn list_agents_for_user(&self, user_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, user_id, name, agent_type, credential, created_at, updated_at \
             FROM agents WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(agent_from_row).collect()
    }

    /// Removing an agent also destroys its sealed credential (same row).
    pub async fn delete_agent(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn agent_from_row(r: AgentRow) -> Result<Agent, StoreError> {
    Ok(Agent {
        id: parse_uuid(&r.id, "agents.id")?,
        user_id: parse_uuid(&r.user_id, "agents.user_id")?,
        name: r.name,
        agent_type: r.agent_type,
        credential: r.credential,
        created_at: parse_datetime(&r.created_at, "agents.created_at")?,
        updated_at: parse_datetime(&r.updated_at, "agents.updated_at")?,
    })
}
