// ABOUTME: Container runtime integration: naming/label contract, runtime seam,
// exec stream demultiplexing, and the session container manager

pub mod container_manager;
pub mod exec_stream;
pub mod runtime;

#[cfg(test)]
pub mod fake;

pub use container_manager::{
    CapturedOutput, ContainerError, ContainerManager, CreateRequest, SandboxConfig,
};
pub use exec_stream::{encode_frame, Frame, FrameParser, StreamKind};
pub use runtime::{
    ContainerSpec, ContainerState, DockerRuntime, ExecHandle, ExecSpec, ExecStatus, MountSpec,
    Runtime, RuntimeError,
};

use uuid::Uuid;

use crate::models::slug;

/// Container labels; part of the external contract (adoption on restart and
/// operator introspection key off them).
pub mod labels {
    pub const SESSION: &str = "orchestrator.session";
    pub const USER: &str = "orchestrator.user";
    pub const ENVIRONMENT: &str = "orchestrator.environment";
    pub const SESSION_NAME: &str = "orchestrator.session-name";
}

/// Deterministic container name for a session. Stable across restarts so a
/// reconcile after a crash can adopt the surviving container by name.
pub fn container_name(env_name: &str, session_name: &str, session_id: Uuid) -> String {
    format!(
        "orchestrator-{}-{}-{}",
        slug(env_name),
        slug(session_name),
        &session_id.to_string()[..8]
    )
}

/// Container path the bare clone is mounted at.
pub fn bare_clone_mount_path(env_id: Uuid) -> String {
    format!("/repos/{env_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic_and_slugged() {
        let id = Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();
        let name = container_name("My Env", "feat/One", id);
        assert_eq!(name, "orchestrator-my-env-feat-one-6ba7b810");
        assert_eq!(container_name("My Env", "feat/One", id), name);
    }
}
