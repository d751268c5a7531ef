// ABOUTME: Scripted in-memory Runtime double for exercising reconciler and
// worktree logic without a container daemon

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use super::exec_stream::{encode_frame, StreamKind};
use super::runtime::{
    ContainerSpec, ContainerState, ExecHandle, ExecSpec, ExecStatus, Runtime, RuntimeError,
};

/// A canned reply for exec calls whose space-joined argv contains `matcher`.
#[derive(Debug, Clone)]
pub struct ExecScript {
    pub matcher: String,
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecScript {
    pub fn ok(matcher: &str, stdout: &str) -> Self {
        Self {
            matcher: matcher.to_string(),
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn fail(matcher: &str, exit_code: i64, stderr: &str) -> Self {
        Self {
            matcher: matcher.to_string(),
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, ContainerState>,
    specs: HashMap<String, ContainerSpec>,
    next_id: u64,
    next_exec: u64,
    image_present: bool,
    conflicts_remaining: u32,
    scripts: Vec<ExecScript>,
    exec_status: HashMap<String, ExecStatus>,
    exec_log: Vec<(String, Vec<String>)>,
    resize_log: Vec<(String, u16, u16)>,
    removed: Vec<String>,
}

/// In-memory runtime. Containers live in a map; execs answer from scripts.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.inner.lock().unwrap().image_present = true;
        fake
    }

    pub fn set_image_present(&self, present: bool) {
        self.inner.lock().unwrap().image_present = present;
    }

    /// Make the next `n` create calls fail with a name conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().conflicts_remaining = n;
    }

    pub fn script(&self, script: ExecScript) {
        self.inner.lock().unwrap().scripts.push(script);
    }

    /// Pre-seed a container, e.g. one surviving a crash before the store
    /// learned its id.
    pub fn seed_container(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        running: bool,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("ctr-{}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            ContainerState {
                id: id.clone(),
                name: name.to_string(),
                running,
                labels,
            },
        );
        id
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn spec_for(&self, id: &str) -> Option<ContainerSpec> {
        self.inner.lock().unwrap().specs.get(id).cloned()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn kill_container(&self, id: &str) {
        self.inner.lock().unwrap().containers.remove(&id.to_string());
    }

    pub fn stop_container(&self, id: &str) {
        if let Some(c) = self.inner.lock().unwrap().containers.get_mut(id) {
            c.running = false;
        }
    }

    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.inner.lock().unwrap().exec_log.clone()
    }

    pub fn resize_log(&self) -> Vec<(String, u16, u16)> {
        self.inner.lock().unwrap().resize_log.clone()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.conflicts_remaining > 0 {
            inner.conflicts_remaining -= 1;
            return Err(RuntimeError::Conflict(format!(
                "name {} already in use",
                spec.name
            )));
        }
        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "name {} already in use",
                spec.name
            )));
        }
        inner.next_id += 1;
        let id = format!("ctr-{}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            ContainerState {
                id: id.clone(),
                name: spec.name.clone(),
                running: true,
                labels: spec.labels.clone(),
            },
        );
        inner.specs.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.remove(id);
        inner.removed.push(id.to_string());
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
        Ok(self.inner.lock().unwrap().containers.get(id).cloned())
    }

    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<ContainerState>, RuntimeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| match value {
                Some(v) => c.labels.get(key).map(String::as_str) == Some(v),
                None => c.labels.contains_key(key),
            })
            .cloned()
            .collect())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(self.inner.lock().unwrap().image_present)
    }

    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecHandle, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        inner.exec_log.push((id.to_string(), spec.argv.clone()));
        let joined = spec.argv.join(" ");
        let script = inner
            .scripts
            .iter()
            .find(|s| joined.contains(&s.matcher))
            .cloned()
            .unwrap_or(ExecScript {
                matcher: String::new(),
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });

        inner.next_exec += 1;
        let exec_id = format!("exec-{}", inner.next_exec);
        inner.exec_status.insert(
            exec_id.clone(),
            ExecStatus {
                running: false,
                exit_code: Some(script.exit_code),
            },
        );

        // Frame the reply and split it mid-frame so consumers have to
        // reassemble across reads, like a real socket.
        let mut wire = Vec::new();
        if !script.stdout.is_empty() {
            wire.extend_from_slice(&encode_frame(StreamKind::Stdout, &script.stdout));
        }
        if !script.stderr.is_empty() {
            wire.extend_from_slice(&encode_frame(StreamKind::Stderr, &script.stderr));
        }
        let chunks: Vec<Result<Bytes, RuntimeError>> = if wire.len() > 3 {
            let cut = wire.len() / 2;
            vec![
                Ok(Bytes::copy_from_slice(&wire[..cut])),
                Ok(Bytes::copy_from_slice(&wire[cut..])),
            ]
        } else if wire.is_empty() {
            Vec::new()
        } else {
            vec![Ok(Bytes::from(wire))]
        };

        Ok(ExecHandle {
            exec_id,
            input: Box::pin(tokio::io::sink()),
            output: futures_util::stream::iter(chunks).boxed(),
        })
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .exec_status
            .get(exec_id)
            .copied()
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))
    }

    async fn resize_exec(
        &self,
        exec_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), RuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .resize_log
            .push((exec_id.to_string(), cols, rows));
        Ok(())
    }
}
