// ABOUTME: User data model: identity plus an opaque sealed VCS credential

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// Sealed VCS credential blob; opaque to everything but the crypto layer.
    #[serde(skip_serializing, default)]
    pub vcs_credential: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
