// ABOUTME: Environment rows: CRUD plus the (user_id, name) uniqueness contract

use sqlx::FromRow;
use uuid::Uuid;

use super::{is_unique_violation, now_rfc3339, parse_datetime, parse_uuid, Store, StoreError};
use crate::models::{Environment, EnvironmentStatus};

#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub user_id: Uuid,
    pub name: String,
    pub repository_url: Option<String>,
    pub default_branch: Option<String>,
}

#[derive(FromRow)]
struct EnvironmentRow {
    id: String,
    user_id: String,
    name: String,
    repository_url: Option<String>,
    default_branch: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl EnvironmentRow {
    fn into_model(self) -> Result<Environment, StoreError> {
        let status = EnvironmentStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("environment status {}", self.status)))?;
        Ok(Environment {
            id: parse_uuid(&self.id, "environments.id")?,
            user_id: parse_uuid(&self.user_id, "environments.user_id")?,
            name: self.name,
            repository_url: self.repository_url,
            default_branch: self.default_branch,
            status,
            created_at: parse_datetime(&self.created_at, "environments.created_at")?,
            updated_at: parse_datetime(&self.updated_at, "environments.updated_at")?,
        })
    }
}

const SELECT: &str = "SELECT id, user_id, name, repository_url, default_branch, status, \
                      created_at, updated_at FROM environments";

impl Store {
    pub async fn create_environment(
        &self,
        new: NewEnvironment,
    ) -> Result<Environment, StoreError> {
        self.ensure_user(new.user_id).await?;

        let mut env = Environment::new(new.user_id, new.name.clone(), new.repository_url.clone());
        if let Some(branch) = new.default_branch.clone() {
            env = env.with_default_branch(branch);
        }

        let result = sqlx::query(
            "INSERT INTO environments \
             (id, user_id, name, repository_url, default_branch, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(env.id.to_string())
        .bind(env.user_id.to_string())
        .bind(&env.name)
        .bind(&env.repository_url)
        .bind(&env.default_branch)
        .bind(env.status.as_str())
        .bind(env.created_at.to_rfc3339())
        .bind(env.updated_at.to_rfc3339())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(env),
            Err(e) if is_unique_violation(&e, "environments.name") => {
                let existing = self
                    .find_environment_by_name(new.user_id, &new.name)
                    .await?
                    .ok_or_else(|| StoreError::NotFound("conflicting environment".into()))?;
                Err(StoreError::NameInUse { existing })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_environment(&self, id: Uuid) -> Result<Option<Environment>, StoreError> {
        let row = sqlx::query_as::<_, EnvironmentRow>(&format!("{SELECT} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(EnvironmentRow::into_model).transpose()
    }

    pub async fn find_environment_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<Environment>, StoreError> {
        let row = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "{SELECT} WHERE user_id = ? AND name = ?"
        ))
        .bind(user_id.to_string())
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.map(EnvironmentRow::into_model).transpose()
    }

    pub async fn list_environments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Environment>, StoreError> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "{SELECT} WHERE user_id = ? ORDER BY created_at"
        ))
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(EnvironmentRow::into_model).collect()
    }

    pub async fn environment_name_available(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.find_environment_by_name(user_id, name).await?.is_none())
    }

    pub async fn set_environment_status(
        &self,
        id: Uuid,
        status: EnvironmentStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE environments SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete the environment row; sessions cascade at the schema level.
    pub async fn delete_environment(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM environments WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
