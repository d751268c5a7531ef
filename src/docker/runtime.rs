// ABOUTME: Named interface to the container runtime plus the bollard-backed
// implementation used in production

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::ListImagesOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::info;

use super::exec_stream::{encode_frame, StreamKind};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime connection error: {0}")]
    Connection(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("name conflict: {0}")]
    Conflict(String),
    #[error("runtime operation failed: {0}")]
    Failure(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            other => RuntimeError::Connection(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub memory_limit_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// Runtime-side view of a container, the source of truth for existence
/// and running state.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub tty: bool,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub attach_stdin: bool,
}

impl ExecSpec {
    pub fn capture(argv: Vec<String>) -> Self {
        Self {
            argv,
            tty: false,
            env: Vec::new(),
            working_dir: None,
            attach_stdin: false,
        }
    }

    pub fn interactive(argv: Vec<String>, working_dir: Option<String>) -> Self {
        Self {
            argv,
            tty: true,
            env: Vec::new(),
            working_dir,
            attach_stdin: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// A started exec: duplex byte stream plus the id used for resize and
/// status inspection. Output chunks are in the 8-byte-header multiplexed
/// framing; a tty exec carries everything on the stdout channel.
pub struct ExecHandle {
    pub exec_id: String,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, Result<Bytes, RuntimeError>>,
}

/// The container runtime collaborator. Everything the orchestrator needs
/// from the runtime goes through this seam.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
    /// `Ok(None)` when the container does not exist.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError>;
    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError>;
    async fn list_by_label(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<ContainerState>, RuntimeError>;
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;
    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecHandle, RuntimeError>;
    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError>;
    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16)
        -> Result<(), RuntimeError>;
}

/// Bollard-backed runtime talking to the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub async fn connect(docker_host: Option<&str>) -> Result<Self, RuntimeError> {
        if let Some(host) = docker_host {
            info!("using configured runtime host: {host}");
            std::env::set_var("DOCKER_HOST", host);
        }
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        info!("connected to container runtime");
        Ok(Self { docker })
    }

    fn state_from_inspect(
        resp: bollard::models::ContainerInspectResponse,
    ) -> Option<ContainerState> {
        let id = resp.id?;
        let name = resp
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let running = resp
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let labels = resp
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();
        Some(ContainerState {
            id,
            name,
            running,
            labels,
        })
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.container_path.clone()),
                source: Some(m.host_path.to_string_lossy().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: spec.memory_limit_bytes,
            nano_cpus: spec.nano_cpus,
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec![
                "CHOWN".to_string(),
                "SETUID".to_string(),
                "SETGID".to_string(),
            ]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
        match self.docker.inspect_container(id, None).await {
            Ok(resp) => Ok(Self::state_from_inspect(resp)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        // Inspect accepts names as well as ids.
        self.inspect(name).await
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<ContainerState>, RuntimeError> {
        let label = match value {
            Some(v) => format!("{key}={v}"),
            None => key.to_string(),
        };
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerState {
                    id: c.id?,
                    name: c
                        .names
                        .and_then(|names| names.first().cloned())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![image.to_string()]);
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(!images.is_empty())
    }

    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecHandle, RuntimeError> {
        let options = CreateExecOptions::<String> {
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            cmd: Some(spec.argv),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env)
            },
            working_dir: spec.working_dir,
            ..Default::default()
        };
        let created = self.docker.create_exec(id, options).await?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        match started {
            StartExecResults::Attached { output, input } => {
                // Normalize the runtime's demultiplexed chunks back into the
                // wire framing so every consumer goes through one parser.
                let output = output
                    .filter_map(|item| async move {
                        match item {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                Some(Ok(encode_frame(StreamKind::Stdout, &message)))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(encode_frame(StreamKind::Stderr, &message)))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(RuntimeError::from(e))),
                        }
                    })
                    .boxed();
                Ok(ExecHandle {
                    exec_id: created.id,
                    input,
                    output,
                })
            }
            StartExecResults::Detached => {
                Err(RuntimeError::Failure("exec unexpectedly detached".into()))
            }
        }
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError> {
        let resp = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecStatus {
            running: resp.running.unwrap_or(false),
            exit_code: resp.exit_code,
        })
    }

    async fn resize_exec(
        &self,
        exec_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), RuntimeError> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await?;
        Ok(())
    }
}
