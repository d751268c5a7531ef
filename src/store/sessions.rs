// ABOUTME: Session rows: creation under partial-uniqueness, status transitions,
// container id bookkeeping

use sqlx::FromRow;
use uuid::Uuid;

use super::{is_unique_violation, now_rfc3339, parse_datetime, parse_uuid, Store, StoreError};
use crate::models::{Environment, Session, SessionStatus, SessionType};

#[derive(Debug, Clone)]
pub struct NewSession {
    pub environment_id: Uuid,
    pub name: String,
    pub git_branch: Option<String>,
    pub working_directory: Option<String>,
    pub session_type: SessionType,
    pub agent_id: Option<Uuid>,
}

#[derive(FromRow)]
struct SessionRow {
    id: String,
    environment_id: String,
    name: String,
    pty_mux_name: String,
    working_directory: String,
    status: String,
    container_id: Option<String>,
    git_branch: Option<String>,
    session_type: String,
    agent_id: Option<String>,
    created_at: String,
    updated_at: String,
    last_activity: Option<String>,
}

impl SessionRow {
    fn into_model(self) -> Result<Session, StoreError> {
        let status = SessionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("session status {}", self.status)))?;
        let session_type = SessionType::parse(&self.session_type)
            .ok_or_else(|| StoreError::Corrupt(format!("session type {}", self.session_type)))?;
        Ok(Session {
            id: parse_uuid(&self.id, "sessions.id")?,
            environment_id: parse_uuid(&self.environment_id, "sessions.environment_id")?,
            name: self.name,
            pty_mux_name: self.pty_mux_name,
            working_directory: self.working_directory,
            status,
            container_id: self.container_id,
            git_branch: self.git_branch,
            session_type,
            agent_id: self
                .agent_id
                .as_deref()
                .map(|id| parse_uuid(id, "sessions.agent_id"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at, "sessions.created_at")?,
            updated_at: parse_datetime(&self.updated_at, "sessions.updated_at")?,
            last_activity: self
                .last_activity
                .as_deref()
                .map(|ts| parse_datetime(ts, "sessions.last_activity"))
                .transpose()?,
        })
    }
}

const SELECT: &str = "SELECT id, environment_id, name, pty_mux_name, working_directory, status, \
                      container_id, git_branch, session_type, agent_id, created_at, updated_at, \
                      last_activity FROM sessions";

impl Store {
    /// Insert a new session row. Name and branch conflicts among live
    /// sessions of the same environment come back as typed errors carrying
    /// the existing row, as the schema's partial unique indexes are the
    /// arbiter.
    pub async fn create_session(&self, new: NewSession) -> Result<Session, StoreError> {
        let mut session = Session::new(
            new.environment_id,
            new.name.clone(),
            new.git_branch.clone(),
        )
        .with_type(new.session_type, new.agent_id);
        if let Some(dir) = new.working_directory.clone() {
            session = session.with_working_directory(dir);
        }

        let result = sqlx::query(
            "INSERT INTO sessions \
             (id, environment_id, name, pty_mux_name, working_directory, status, container_id, \
              git_branch, session_type, agent_id, created_at, updated_at, last_activity) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.environment_id.to_string())
        .bind(&session.name)
        .bind(&session.pty_mux_name)
        .bind(&session.working_directory)
        .bind(session.status.as_str())
        .bind(&session.container_id)
        .bind(&session.git_branch)
        .bind(session.session_type.as_str())
        .bind(session.agent_id.map(|id| id.to_string()))
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.last_activity.map(|ts| ts.to_rfc3339()))
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(session),
            Err(e)
                if is_unique_violation(&e, "sessions.git_branch")
                    || is_unique_violation(&e, "idx_sessions_env_branch_live") =>
            {
                let branch = new.git_branch.as_deref().unwrap_or_default();
                let existing = self
                    .find_live_session_by_branch(new.environment_id, branch)
                    .await?
                    .ok_or_else(|| StoreError::NotFound("conflicting session".into()))?;
                Err(StoreError::BranchInUse { existing })
            }
            Err(e)
                if is_unique_violation(&e, "sessions.name")
                    || is_unique_violation(&e, "idx_sessions_env_name_live") =>
            {
                let existing = self
                    .find_live_session_by_name(new.environment_id, &new.name)
                    .await?
                    .ok_or_else(|| StoreError::NotFound("conflicting session".into()))?;
                Err(StoreError::SessionNameInUse { existing })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{SELECT} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(SessionRow::into_model).transpose()
    }

    /// Session joined with its owning environment; `None` when either is gone.
    pub async fn get_session_with_environment(
        &self,
        id: Uuid,
    ) -> Result<Option<(Session, Environment)>, StoreError> {
        let Some(session) = self.get_session(id).await? else {
            return Ok(None);
        };
        let Some(environment) = self.get_environment(session.environment_id).await? else {
            return Ok(None);
        };
        Ok(Some((session, environment)))
    }

    pub async fn list_sessions_for_environment(
        &self,
        environment_id: Uuid,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT} WHERE environment_id = ? ORDER BY created_at"
        ))
        .bind(environment_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(SessionRow::into_model).collect()
    }

    /// Every session that is not dead, across all environments.
    pub async fn list_live_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows =
            sqlx::query_as::<_, SessionRow>(&format!("{SELECT} WHERE status <> 'dead'"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(SessionRow::into_model).collect()
    }

    pub async fn find_live_session_by_name(
        &self,
        environment_id: Uuid,
        name: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT} WHERE environment_id = ? AND name = ? AND status <> 'dead'"
        ))
        .bind(environment_id.to_string())
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.map(SessionRow::into_model).transpose()
    }

    pub async fn find_live_session_by_branch(
        &self,
        environment_id: Uuid,
        branch: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT} WHERE environment_id = ? AND git_branch = ? AND status <> 'dead'"
        ))
        .bind(environment_id.to_string())
        .bind(branch)
        .fetch_optional(self.pool())
        .await?;
        row.map(SessionRow::into_model).transpose()
    }

    /// Record the session's container. Writing a non-null container id
    /// always implies the session is active.
    pub async fn set_session_container(
        &self,
        id: Uuid,
        container_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET container_id = ?, status = 'active', updated_at = ? WHERE id = ?",
        )
        .bind(container_id)
        .bind(now_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clear_session_container(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET container_id = NULL, updated_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Terminal transition: dead sessions release their container reference
    /// and never come back.
    pub async fn mark_session_dead(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET status = 'dead', container_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn touch_session_activity(&self, id: Uuid) -> Result<(), StoreError> {
        let now = now_rfc3339();
        sqlx::query("UPDATE sessions SET last_activity = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every pty-mux name any session row references, live or dead. The
    /// janitor treats multiplexer sessions outside this set as orphans.
    pub async fn list_pty_mux_names(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT pty_mux_name FROM sessions")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
