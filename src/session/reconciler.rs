// ABOUTME: The session/worktree/container reconciler: case analysis over the
// joint store+runtime state, idempotent and self-healing

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::keyed_mutex::KeyedMutex;
use crate::docker::{container_name, ContainerError, ContainerManager, CreateRequest};
use crate::models::Environment;
use crate::repo::{RepoCache, RepoError};
use crate::store::{Store, StoreError};
use crate::worktree::{WorktreeCoordinator, WorktreeError};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("session {0} is dead and cannot be revived")]
    SessionDead(Uuid),
    #[error("session {0} has no branch to reconcile")]
    NoBranch(Uuid),
    #[error("environment {0} has no repository url")]
    NoRepository(Uuid),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Converges `(store row, runtime container, worktree)` for one session at
/// a time. All public operations serialize per session through a keyed
/// mutex; everything they do is idempotent.
pub struct SessionReconciler {
    store: Store,
    repos: RepoCache,
    containers: Arc<ContainerManager>,
    worktrees: WorktreeCoordinator,
    locks: KeyedMutex<Uuid>,
}

impl SessionReconciler {
    pub fn new(
        store: Store,
        repos: RepoCache,
        containers: Arc<ContainerManager>,
        worktrees: WorktreeCoordinator,
    ) -> Self {
        Self {
            store,
            repos,
            containers,
            worktrees,
            locks: KeyedMutex::new(),
        }
    }

    /// Ensure the session has a running container whose `/workspace` is a
    /// checkout of the session branch, record it in the store, and return
    /// the container id. On failure the session is marked dead and its
    /// container reference cleared before the error surfaces.
    pub async fn ensure_session_container(
        &self,
        session_id: Uuid,
    ) -> Result<String, ReconcileError> {
        let _guard = self.locks.lock(session_id).await;
        match self.reconcile_locked(session_id).await {
            Ok(container_id) => Ok(container_id),
            Err(e) => {
                if !matches!(e, ReconcileError::SessionNotFound(_)) {
                    warn!("reconcile for session {session_id} failed: {e}");
                    if let Err(mark) = self.store.mark_session_dead(session_id).await {
                        warn!("marking session {session_id} dead also failed: {mark}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn reconcile_locked(&self, session_id: Uuid) -> Result<String, ReconcileError> {
        let (session, env) = self
            .store
            .get_session_with_environment(session_id)
            .await?
            .ok_or(ReconcileError::SessionNotFound(session_id))?;
        if session.status.is_dead() {
            return Err(ReconcileError::SessionDead(session_id));
        }
        let branch = session
            .git_branch
            .clone()
            .ok_or(ReconcileError::NoBranch(session_id))?;
        let url = env
            .repository_url
            .clone()
            .ok_or(ReconcileError::NoRepository(env.id))?;

        // Cases A-C: the store already references a container.
        if let Some(recorded) = session.container_id.as_deref() {
            match self.containers.runtime().inspect(recorded).await {
                Ok(Some(state)) => {
                    if !state.running {
                        self.containers.ensure_running(recorded).await?;
                    }
                    self.worktrees
                        .ensure_worktree(recorded, env.id, &branch)
                        .await?;
                    self.store
                        .set_session_container(session_id, recorded)
                        .await?;
                    return Ok(recorded.to_string());
                }
                Ok(None) => {
                    // The recorded container is gone; forget it and fall
                    // through to name-based recovery.
                    info!(
                        "session {session_id} container {recorded} vanished, reconciling fresh"
                    );
                    self.containers.destroy(recorded).await;
                    self.store.clear_session_container(session_id).await?;
                }
                Err(e) => return Err(ContainerError::from(e).into()),
            }
        }

        // Case D: a correctly named container survived (crash between
        // create and store write, or a restarted orchestrator). Adopt it.
        let expected_name = container_name(&env.name, &session.name, session.id);
        if let Some(state) = self.containers.reuse_by_name(&expected_name).await? {
            info!(
                "adopting container {} for session {session_id}",
                state.id
            );
            self.worktrees
                .ensure_worktree(&state.id, env.id, &branch)
                .await?;
            self.store
                .set_session_container(session_id, &state.id)
                .await?;
            return Ok(state.id);
        }

        // Case F: build from nothing. Order matters: container first, then
        // worktree, and only then the store write, so the store never
        // references a container that has not existed.
        self.repos.ensure(env.id, &url).await?;
        // Best-effort refresh when the requested branch is not local yet;
        // the worktree step will branch off the default if it still isn't.
        match self.repos.branches(env.id).await {
            Ok(branches) if !branches.iter().any(|b| b == &branch) => {
                self.repos.fetch(env.id).await;
            }
            _ => {}
        }
        let request = self.create_request(&session.name, session.id, &env);
        let container_id = self.containers.create_session_container(&request).await?;

        if let Err(e) = self
            .worktrees
            .ensure_worktree(&container_id, env.id, &branch)
            .await
        {
            // Do not leave a half-built container behind.
            self.containers.destroy(&container_id).await;
            return Err(e.into());
        }

        self.store
            .set_session_container(session_id, &container_id)
            .await?;
        Ok(container_id)
    }

    /// Tear the session down: container first (reference cleared before the
    /// destroy so the store never points at a corpse), then the row. The
    /// worktree dies with the container.
    pub async fn cleanup_session(&self, session_id: Uuid) -> Result<bool, ReconcileError> {
        let _guard = self.locks.lock(session_id).await;
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(false);
        };
        if let Some(container_id) = session.container_id.as_deref() {
            self.store.clear_session_container(session_id).await?;
            self.containers.destroy(container_id).await;
        }
        Ok(self.store.delete_session(session_id).await?)
    }

    /// Destroy every session of an environment, then the environment row.
    pub async fn cleanup_environment(&self, env_id: Uuid) -> Result<bool, ReconcileError> {
        for session in self.store.list_sessions_for_environment(env_id).await? {
            if let Err(e) = self.cleanup_session(session.id).await {
                warn!(
                    "cleaning session {} during environment {env_id} removal failed: {e}",
                    session.id
                );
            }
        }
        Ok(self.store.delete_environment(env_id).await?)
    }

    fn create_request(
        &self,
        session_name: &str,
        session_id: Uuid,
        env: &Environment,
    ) -> CreateRequest {
        CreateRequest {
            session_id,
            user_id: env.user_id,
            environment_id: env.id,
            environment_name: env.name.clone(),
            session_name: session_name.to_string(),
            extra_mounts: Vec::new(),
        }
    }
}
