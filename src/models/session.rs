// ABOUTME: Session data model: one persistent terminal bound to a git branch inside a container

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::slug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Declared but no live terminal attached.
    Inactive,
    /// Container running, worktree checked out, at least one attach succeeded.
    Active,
    /// Terminal state. Dead sessions are never reused; their name and
    /// branch become available to new sessions.
    Dead,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Inactive => "inactive",
            SessionStatus::Active => "active",
            SessionStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(SessionStatus::Inactive),
            "active" => Some(SessionStatus::Active),
            "dead" => Some(SessionStatus::Dead),
            _ => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, SessionStatus::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Shell,
    Agent,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Shell => "shell",
            SessionType::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(SessionType::Shell),
            "agent" => Some(SessionType::Agent),
            _ => None,
        }
    }
}

impl Default for SessionType {
    fn default() -> Self {
        SessionType::Shell
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    /// Stable multiplexer session name inside the container. This is the
    /// persistence mechanism for terminal state: reconnects attach to it,
    /// never create a second one.
    pub pty_mux_name: String,
    pub working_directory: String,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub git_branch: Option<String>,
    pub session_type: SessionType,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Session {
    /// Build a fresh session row. The pty-mux name is derived once from the
    /// session name plus a timestamp and never changes afterwards.
    pub fn new(environment_id: Uuid, name: String, git_branch: Option<String>) -> Self {
        let now = Utc::now();
        let pty_mux_name = format!("{}-{}", slug(&name), now.timestamp());
        Self {
            id: Uuid::new_v4(),
            environment_id,
            name,
            pty_mux_name,
            working_directory: "/workspace".to_string(),
            status: SessionStatus::Inactive,
            container_id: None,
            git_branch,
            session_type: SessionType::Shell,
            agent_id: None,
            created_at: now,
            updated_at: now,
            last_activity: None,
        }
    }

    pub fn with_type(mut self, session_type: SessionType, agent_id: Option<Uuid>) -> Self {
        self.session_type = session_type;
        self.agent_id = agent_id;
        self
    }

    pub fn with_working_directory(mut self, dir: String) -> Self {
        self.working_directory = dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Inactive,
            SessionStatus::Active,
            SessionStatus::Dead,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("running"), None);
    }

    #[test]
    fn new_session_derives_pty_mux_name_from_name() {
        let session = Session::new(Uuid::new_v4(), "Feat/One".to_string(), None);
        assert!(session.pty_mux_name.starts_with("feat-one-"));
        assert_eq!(session.status, SessionStatus::Inactive);
        assert_eq!(session.working_directory, "/workspace");
        assert!(session.container_id.is_none());
    }
}
