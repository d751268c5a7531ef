// ABOUTME: Agent data model: a named agent configuration attachable to agent-type sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub agent_type: String,
    /// Sealed credential blob; never serialized to clients.
    #[serde(skip_serializing, default)]
    pub credential: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(user_id: Uuid, name: String, agent_type: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            agent_type,
            credential: None,
            created_at: now,
            updated_at: now,
        }
    }
}
