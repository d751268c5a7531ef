// ABOUTME: Environment data model: a user's declaration of a repository-rooted workspace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Ready,
    Error,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(EnvironmentStatus::Ready),
            "error" => Some(EnvironmentStatus::Error),
            _ => None,
        }
    }
}

/// An environment is purely a declaration: it owns sessions but never a
/// container of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub repository_url: Option<String>,
    pub default_branch: String,
    pub status: EnvironmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(user_id: Uuid, name: String, repository_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            repository_url,
            default_branch: "main".to_string(),
            status: EnvironmentStatus::Ready,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_default_branch(mut self, branch: String) -> Self {
        self.default_branch = branch;
        self
    }
}
