// ABOUTME: Session container lifecycle: create with the expected name, mounts,
// labels and caps; reuse, inspect, exec, and best-effort destroy

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::exec_stream::{FrameParser, StreamKind};
use super::runtime::{
    ContainerSpec, ContainerState, ExecHandle, ExecSpec, MountSpec, Runtime, RuntimeError,
};
use super::{bare_clone_mount_path, container_name, labels};
use futures_util::StreamExt;

const EXEC_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("sandbox image '{image}' not found; build or pull it before creating sessions")]
    ImageMissing { image: String },
    #[error("refusing read-only mount at {path}: the bare repository must be mounted read-write")]
    MountReadOnly { path: String },
    #[error("container gone: {0}")]
    ContainerGone(String),
    #[error("container create failed: {0}")]
    CreateFailed(String),
    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),
}

/// Sandbox parameters applied to every session container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub memory_limit_mib: u64,
    pub cpu_limit: f64,
    pub data_root: PathBuf,
}

/// What the reconciler knows when it asks for a container.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub environment_id: Uuid,
    pub environment_name: String,
    pub session_name: String,
    pub extra_mounts: Vec<MountSpec>,
}

/// Captured output of a non-interactive exec.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct ContainerManager {
    runtime: Arc<dyn Runtime>,
    sandbox: SandboxConfig,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn Runtime>, sandbox: SandboxConfig) -> Self {
        Self { runtime, sandbox }
    }

    pub fn runtime(&self) -> Arc<dyn Runtime> {
        Arc::clone(&self.runtime)
    }

    pub fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    /// Build the container spec for a session. The bare clone mount is
    /// always read-write; a read-only override anywhere on that path is
    /// refused outright rather than letting worktree creation fail later.
    pub fn build_spec(&self, req: &CreateRequest) -> Result<ContainerSpec, ContainerError> {
        let bare_mount_path = bare_clone_mount_path(req.environment_id);
        for mount in &req.extra_mounts {
            if mount.container_path == bare_mount_path && mount.read_only {
                return Err(ContainerError::MountReadOnly {
                    path: bare_mount_path,
                });
            }
        }

        let mut mounts = vec![MountSpec {
            host_path: self
                .sandbox
                .data_root
                .join("repos")
                .join(req.environment_id.to_string()),
            container_path: bare_mount_path.clone(),
            read_only: false,
        }];
        mounts.extend(
            req.extra_mounts
                .iter()
                .filter(|m| m.container_path != bare_mount_path)
                .cloned(),
        );

        let mut label_map = HashMap::new();
        label_map.insert(labels::SESSION.to_string(), req.session_id.to_string());
        label_map.insert(labels::USER.to_string(), req.user_id.to_string());
        label_map.insert(
            labels::ENVIRONMENT.to_string(),
            req.environment_id.to_string(),
        );
        label_map.insert(
            labels::SESSION_NAME.to_string(),
            req.session_name.clone(),
        );

        Ok(ContainerSpec {
            name: container_name(&req.environment_name, &req.session_name, req.session_id),
            image: self.sandbox.image.clone(),
            working_dir: "/workspace".to_string(),
            env: vec![
                ("ENV".to_string(), "development".to_string()),
                ("USER_ID".to_string(), req.user_id.to_string()),
                ("SESSION_ID".to_string(), req.session_id.to_string()),
                (
                    "ENVIRONMENT_NAME".to_string(),
                    req.environment_name.clone(),
                ),
            ],
            labels: label_map,
            mounts,
            memory_limit_bytes: Some((self.sandbox.memory_limit_mib * 1024 * 1024) as i64),
            nano_cpus: Some((self.sandbox.cpu_limit * 1_000_000_000.0) as i64),
        })
    }

    /// Create and start a session container. A name collision (lost
    /// check-to-use race) is retried once under a timestamp suffix; a
    /// second collision is fatal.
    pub async fn create_session_container(
        &self,
        req: &CreateRequest,
    ) -> Result<String, ContainerError> {
        if !self.runtime.image_exists(&self.sandbox.image).await? {
            return Err(ContainerError::ImageMissing {
                image: self.sandbox.image.clone(),
            });
        }

        let mut spec = self.build_spec(req)?;
        info!(
            "creating container {} for session {}",
            spec.name, req.session_id
        );

        match self.runtime.create(&spec).await {
            Ok(id) => Ok(id),
            Err(RuntimeError::Conflict(_)) => {
                let suffix = base36(chrono::Utc::now().timestamp() as u64);
                spec.name = format!("{}-{}", spec.name, suffix);
                warn!(
                    "container name collision for session {}, retrying as {}",
                    req.session_id, spec.name
                );
                match self.runtime.create(&spec).await {
                    Ok(id) => Ok(id),
                    Err(e) => Err(ContainerError::CreateFailed(e.to_string())),
                }
            }
            Err(e) => Err(ContainerError::CreateFailed(e.to_string())),
        }
    }

    /// Start the container if it is not running. `ContainerGone` when the
    /// runtime no longer knows the id.
    pub async fn ensure_running(&self, id: &str) -> Result<(), ContainerError> {
        match self.runtime.inspect(id).await? {
            Some(state) if state.running => Ok(()),
            Some(_) => {
                info!("starting stopped container {id}");
                self.runtime.start(id).await?;
                Ok(())
            }
            None => Err(ContainerError::ContainerGone(id.to_string())),
        }
    }

    /// Look a container up by its deterministic name. Running containers are
    /// returned for adoption; stopped ones are removed so the caller can
    /// recreate cleanly.
    pub async fn reuse_by_name(
        &self,
        expected_name: &str,
    ) -> Result<Option<ContainerState>, ContainerError> {
        match self.runtime.inspect_by_name(expected_name).await? {
            Some(state) if state.running => {
                debug!("reusing running container {} ({})", state.name, state.id);
                Ok(Some(state))
            }
            Some(state) => {
                info!(
                    "removing stopped container {} before recreation",
                    state.id
                );
                self.destroy(&state.id).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Best-effort stop and remove; failures are logged, never surfaced.
    pub async fn destroy(&self, id: &str) {
        if let Err(e) = self.runtime.stop(id).await {
            match e {
                RuntimeError::NotFound(_) => return,
                other => debug!("stopping container {id} failed: {other}"),
            }
        }
        if let Err(e) = self.runtime.remove(id).await {
            warn!("removing container {id} failed: {e}");
        }
    }

    /// Run a command to completion inside the container, demultiplexing the
    /// exec stream into captured stdout/stderr.
    pub async fn exec_capture(
        &self,
        container_id: &str,
        argv: Vec<String>,
    ) -> Result<CapturedOutput, ContainerError> {
        self.exec_capture_with_timeout(container_id, argv, EXEC_CAPTURE_TIMEOUT)
            .await
    }

    pub async fn exec_capture_with_timeout(
        &self,
        container_id: &str,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<CapturedOutput, ContainerError> {
        let mut handle = self
            .runtime
            .exec(container_id, ExecSpec::capture(argv))
            .await?;

        let exec_id = handle.exec_id.clone();
        let drain = async {
            let mut parser = FrameParser::new();
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(chunk) = handle.output.next().await {
                let chunk = chunk?;
                for frame in parser.feed(&chunk) {
                    match frame.kind {
                        StreamKind::Stderr => stderr.extend_from_slice(&frame.data),
                        _ => stdout.extend_from_slice(&frame.data),
                    }
                }
            }
            Ok::<_, RuntimeError>((stdout, stderr))
        };

        let (stdout, stderr) = tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| ContainerError::ExecTimeout(timeout))??;

        // The exec can report running for a beat after its stream closes.
        let mut status = self.runtime.exec_status(&exec_id).await?;
        for _ in 0..10 {
            if !status.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = self.runtime.exec_status(&exec_id).await?;
        }

        Ok(CapturedOutput {
            exit_code: status.exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    /// Start an interactive (tty) exec for the terminal pipeline.
    pub async fn exec_interactive(
        &self,
        container_id: &str,
        argv: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<ExecHandle, ContainerError> {
        Ok(self
            .runtime
            .exec(container_id, ExecSpec::interactive(argv, working_dir))
            .await?)
    }

    /// Write bytes to an interactive exec's stdin.
    pub async fn write_input(
        handle: &mut ExecHandle,
        data: &[u8],
    ) -> Result<(), ContainerError> {
        handle
            .input
            .write_all(data)
            .await
            .map_err(|e| ContainerError::Runtime(RuntimeError::Failure(e.to_string())))?;
        handle
            .input
            .flush()
            .await
            .map_err(|e| ContainerError::Runtime(RuntimeError::Failure(e.to_string())))?;
        Ok(())
    }
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{ExecScript, FakeRuntime};
    use crate::docker::labels;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn manager(runtime: Arc<FakeRuntime>) -> ContainerManager {
        ContainerManager::new(
            runtime,
            SandboxConfig {
                image: "sandbox:latest".to_string(),
                memory_limit_mib: 1024,
                cpu_limit: 0.5,
                data_root: PathBuf::from("/srv/devbox"),
            },
        )
    }

    fn request() -> CreateRequest {
        CreateRequest {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            environment_name: "env1".to_string(),
            session_name: "feat".to_string(),
            extra_mounts: Vec::new(),
        }
    }

    #[test]
    fn base36_encodes_known_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(1_700_000_000), "s44we8");
    }

    #[test]
    fn build_spec_wires_mounts_env_and_labels() {
        let m = manager(Arc::new(FakeRuntime::new()));
        let req = request();
        let spec = m.build_spec(&req).unwrap();

        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.memory_limit_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(spec.nano_cpus, Some(500_000_000));

        let bare = &spec.mounts[0];
        assert_eq!(
            bare.container_path,
            format!("/repos/{}", req.environment_id)
        );
        assert!(!bare.read_only);
        assert_eq!(
            bare.host_path,
            PathBuf::from(format!("/srv/devbox/repos/{}", req.environment_id))
        );

        assert_eq!(
            spec.labels.get(labels::SESSION),
            Some(&req.session_id.to_string())
        );
        assert_eq!(
            spec.labels.get(labels::ENVIRONMENT),
            Some(&req.environment_id.to_string())
        );
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "ENV" && v == "development"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "SESSION_ID" && v == &req.session_id.to_string()));
    }

    #[test]
    fn build_spec_refuses_read_only_bare_mount() {
        let m = manager(Arc::new(FakeRuntime::new()));
        let mut req = request();
        req.extra_mounts.push(MountSpec {
            host_path: PathBuf::from("/elsewhere"),
            container_path: format!("/repos/{}", req.environment_id),
            read_only: true,
        });

        let err = m.build_spec(&req).unwrap_err();
        match err {
            ContainerError::MountReadOnly { path } => {
                assert_eq!(path, format!("/repos/{}", req.environment_id));
            }
            other => panic!("expected MountReadOnly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_capture_reassembles_split_frames() {
        let runtime = Arc::new(FakeRuntime::new());
        let cid = runtime.seed_container("c1", HashMap::new(), true);
        runtime.script(ExecScript {
            matcher: "echo".to_string(),
            exit_code: 0,
            stdout: b"hello out".to_vec(),
            stderr: b"hello err".to_vec(),
        });

        let m = manager(runtime);
        let out = m
            .exec_capture(&cid, vec!["echo".to_string(), "hi".to_string()])
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello out");
        assert_eq!(out.stderr, "hello err");
    }

    #[tokio::test]
    async fn ensure_running_reports_gone_containers() {
        let runtime = Arc::new(FakeRuntime::new());
        let m = manager(runtime.clone());
        let err = m.ensure_running("ctr-missing").await.unwrap_err();
        assert!(matches!(err, ContainerError::ContainerGone(_)));

        let cid = runtime.seed_container("c1", HashMap::new(), false);
        m.ensure_running(&cid).await.unwrap();
        assert!(runtime.is_running(&cid));
    }

    #[tokio::test]
    async fn reuse_by_name_removes_stopped_containers() {
        let runtime = Arc::new(FakeRuntime::new());
        let cid = runtime.seed_container("orchestrator-x", HashMap::new(), false);
        let m = manager(runtime.clone());

        assert!(m.reuse_by_name("orchestrator-x").await.unwrap().is_none());
        assert!(runtime.removed_ids().contains(&cid));
        assert_eq!(runtime.container_count(), 0);
    }
}
