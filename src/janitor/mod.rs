// ABOUTME: Periodic sweep reconciling the store against the runtime: dead
// session marking, orphaned mux session reaping, worktree registration pruning

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::docker::{labels, ContainerManager};
use crate::models::SessionStatus;
use crate::store::Store;
use crate::terminal::pty_mux;

/// Cleans up without ever creating: no containers are started here and no
/// rows are resurrected.
pub struct Janitor {
    store: Store,
    containers: Arc<ContainerManager>,
    interval: Duration,
}

impl Janitor {
    pub fn new(store: Store, containers: Arc<ContainerManager>, interval: Duration) -> Self {
        Self {
            store,
            containers,
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// One full pass. Every step is best-effort; failures are logged and
    /// the sweep moves on.
    pub async fn sweep(&self) {
        debug!("janitor sweep starting");
        self.mark_dead_sessions().await;
        self.reap_container_state().await;
        debug!("janitor sweep done");
    }

    /// Sessions whose recorded container is stopped or gone are dead, as is
    /// any session claiming to be active with no container at all.
    async fn mark_dead_sessions(&self) {
        let sessions = match self.store.list_live_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("janitor could not list sessions: {e}");
                return;
            }
        };

        for session in sessions {
            let doomed = match session.container_id.as_deref() {
                Some(container_id) => {
                    match self.containers.runtime().inspect(container_id).await {
                        Ok(Some(state)) => !state.running,
                        Ok(None) => true,
                        Err(e) => {
                            warn!("janitor inspect of {container_id} failed: {e}");
                            false
                        }
                    }
                }
                None => session.status == SessionStatus::Active,
            };

            if doomed {
                info!("janitor marking session {} dead", session.id);
                if let Err(e) = self.store.mark_session_dead(session.id).await {
                    warn!("janitor could not mark {} dead: {e}", session.id);
                }
            }
        }
    }

    /// Walk every labeled container. Containers whose session row is gone
    /// are orphans (a crash between create and store write, or a deletion
    /// that lost the race) and are removed. Inside the running owned ones:
    /// kill mux sessions no store row references, and prune stale worktree
    /// registrations in the bare clone. Pruning runs in-container because
    /// that is the world where live worktree paths resolve.
    async fn reap_container_state(&self) {
        let known: HashSet<String> = match self.store.list_pty_mux_names().await {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                warn!("janitor could not list mux names: {e}");
                return;
            }
        };

        let containers = match self
            .containers
            .runtime()
            .list_by_label(labels::SESSION, None)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!("janitor could not list containers: {e}");
                return;
            }
        };

        for container in containers {
            if !self.container_has_session(&container.labels).await {
                info!("janitor removing orphan container {}", container.id);
                self.containers.destroy(&container.id).await;
                continue;
            }
            if !container.running {
                continue;
            }

            self.reap_orphan_mux_sessions(&container.id, &known).await;

            if let Some(env_id) = container.labels.get(labels::ENVIRONMENT) {
                let argv = vec![
                    "git".to_string(),
                    "-C".to_string(),
                    format!("/repos/{env_id}"),
                    "worktree".to_string(),
                    "prune".to_string(),
                ];
                if let Err(e) = self.containers.exec_capture(&container.id, argv).await {
                    debug!("worktree prune in {} failed: {e}", container.id);
                }
            }
        }
    }

    async fn container_has_session(
        &self,
        labels_map: &std::collections::HashMap<String, String>,
    ) -> bool {
        let Some(session_id) = labels_map
            .get(labels::SESSION)
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
        else {
            return false;
        };
        match self.store.get_session(session_id).await {
            Ok(row) => row.is_some(),
            // A store hiccup must not cost anyone a live container.
            Err(e) => {
                warn!("janitor could not resolve session {session_id}: {e}");
                true
            }
        }
    }

    async fn reap_orphan_mux_sessions(&self, container_id: &str, known: &HashSet<String>) {
        let listed = match self
            .containers
            .exec_capture(container_id, pty_mux::list_sessions_argv())
            .await
        {
            Ok(out) if out.success() => out.stdout,
            // Non-zero usually means no mux server is running yet.
            Ok(_) => return,
            Err(e) => {
                debug!("listing mux sessions in {container_id} failed: {e}");
                return;
            }
        };

        for name in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if known.contains(name) {
                continue;
            }
            info!("janitor killing orphan mux session {name} in {container_id}");
            if let Err(e) = self
                .containers
                .exec_capture(container_id, pty_mux::kill_session_argv(name))
                .await
            {
                warn!("killing mux session {name} failed: {e}");
            }
        }
    }
}
