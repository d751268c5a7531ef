// ABOUTME: Host-side bare clone cache: one bare repository per environment,
// fetched on demand and mounted into session containers

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::keyed_mutex::KeyedMutex;

const CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Refspec mirroring every remote head into a local head, so worktrees can
/// check branches out without remote-tracking indirection.
const HEADS_REFSPEC: &str = "+refs/heads/*:refs/heads/*";

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("repository unavailable at {url}: {cause}")]
    RepoUnavailable { url: String, cause: String },
    #[error("git command failed: {0}")]
    GitFailure(String),
    #[error("git command timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maintains `<data_root>/repos/<env_id>` bare clones. Never touches
/// `/workspace`; worktrees are created inside containers.
#[derive(Clone)]
pub struct RepoCache {
    data_root: PathBuf,
    /// Serializes clone/fetch per environment; concurrent ensures for the
    /// same environment must not race a half-finished clone.
    locks: Arc<KeyedMutex<Uuid>>,
}

impl RepoCache {
    pub fn new(data_root: PathBuf) -> Self {
        Self {
            data_root,
            locks: Arc::new(KeyedMutex::new()),
        }
    }

    pub fn repo_path(&self, env_id: Uuid) -> PathBuf {
        self.data_root.join("repos").join(env_id.to_string())
    }

    /// Idempotently make sure a valid bare clone with at least one local
    /// branch exists, returning its host path. Partial clones left by
    /// earlier failures are removed and retried.
    pub async fn ensure(&self, env_id: Uuid, url: &str) -> Result<PathBuf, RepoError> {
        let _guard = self.locks.lock(env_id).await;
        let path = self.repo_path(env_id);

        if path.exists() && !is_bare_repo(&path) {
            warn!(
                "removing partial repository directory {} before re-cloning",
                path.display()
            );
            tokio::fs::remove_dir_all(&path).await?;
        }

        if !path.exists() {
            self.clone_bare(url, &path).await?;
        }

        if self.branches(env_id).await?.is_empty() {
            debug!("bare clone for {env_id} has no local branches, fetching heads");
            self.fetch_heads(&path).await.map_err(|e| {
                RepoError::RepoUnavailable {
                    url: url.to_string(),
                    cause: e.to_string(),
                }
            })?;
        }

        Ok(path)
    }

    /// Best-effort refresh of local heads; network trouble is logged, not fatal.
    pub async fn fetch(&self, env_id: Uuid) {
        let _guard = self.locks.lock(env_id).await;
        let path = self.repo_path(env_id);
        if !path.exists() {
            return;
        }
        if let Err(e) = self.fetch_heads(&path).await {
            warn!("fetch for environment {env_id} failed (non-fatal): {e}");
        }
    }

    /// Local branch names in the bare clone, empty when the clone is absent.
    pub async fn branches(&self, env_id: Uuid) -> Result<Vec<String>, RepoError> {
        let path = self.repo_path(env_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let output = run_git(
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            Some(&path),
            QUERY_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            return Err(RepoError::GitFailure(stderr_of(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn clone_bare(&self, url: &str, path: &Path) -> Result<(), RepoError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!("cloning bare repository {} into {}", url, path.display());

        let path_str = path.to_string_lossy().to_string();
        let result = run_git(&["clone", "--bare", url, &path_str], None, CLONE_TIMEOUT).await;

        let failure = match result {
            Ok(output) if output.status.success() => {
                // Make sure every head exists locally before first use.
                return self.fetch_heads(path).await.map_err(|e| {
                    RepoError::RepoUnavailable {
                        url: url.to_string(),
                        cause: e.to_string(),
                    }
                });
            }
            Ok(output) => stderr_of(&output),
            Err(e) => e.to_string(),
        };

        // Never leave a half-cloned directory behind.
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(path).await;
        }
        Err(RepoError::RepoUnavailable {
            url: url.to_string(),
            cause: failure,
        })
    }

    async fn fetch_heads(&self, path: &Path) -> Result<(), RepoError> {
        let output = run_git(
            &["fetch", "origin", HEADS_REFSPEC],
            Some(path),
            FETCH_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            return Err(RepoError::GitFailure(stderr_of(&output)));
        }
        Ok(())
    }
}

fn is_bare_repo(path: &Path) -> bool {
    path.join("config").exists() && path.join("HEAD").exists()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

async fn run_git(
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<Output, RepoError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RepoError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_origin(dir: &Path) {
        let run = |args: Vec<&str>, cwd: &Path| {
            let cwd = cwd.to_path_buf();
            let args: Vec<String> = args.into_iter().map(String::from).collect();
            async move {
                let output = Command::new("git")
                    .args(&args)
                    .current_dir(&cwd)
                    .output()
                    .await
                    .unwrap();
                assert!(
                    output.status.success(),
                    "git {:?} failed: {}",
                    args,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        };
        run(vec!["init", "-b", "main", "."], dir).await;
        run(vec!["config", "user.email", "test@example.com"], dir).await;
        run(vec!["config", "user.name", "Test"], dir).await;
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        run(vec!["add", "."], dir).await;
        run(vec!["commit", "-m", "initial"], dir).await;
    }

    #[tokio::test]
    async fn ensure_clones_and_is_idempotent() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path()).await;
        let data_root = TempDir::new().unwrap();

        let cache = RepoCache::new(data_root.path().to_path_buf());
        let env_id = Uuid::new_v4();
        let url = origin.path().to_string_lossy().to_string();

        let first = cache.ensure(env_id, &url).await.unwrap();
        assert!(first.join("HEAD").exists());
        assert_eq!(cache.branches(env_id).await.unwrap(), vec!["main"]);

        // Second call must not re-clone or fail.
        let second = cache.ensure(env_id, &url).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ensure_cleans_up_after_failed_clone() {
        let data_root = TempDir::new().unwrap();
        let cache = RepoCache::new(data_root.path().to_path_buf());
        let env_id = Uuid::new_v4();

        let err = cache
            .ensure(env_id, "/nonexistent/repository/path")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::RepoUnavailable { .. }));
        assert!(!cache.repo_path(env_id).exists());
    }

    #[tokio::test]
    async fn ensure_replaces_partial_directory() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path()).await;
        let data_root = TempDir::new().unwrap();
        let cache = RepoCache::new(data_root.path().to_path_buf());
        let env_id = Uuid::new_v4();

        // A directory without git innards simulates a crash mid-clone.
        let partial = cache.repo_path(env_id);
        tokio::fs::create_dir_all(&partial).await.unwrap();
        tokio::fs::write(partial.join("junk"), b"x").await.unwrap();

        let url = origin.path().to_string_lossy().to_string();
        cache.ensure(env_id, &url).await.unwrap();
        assert!(cache.repo_path(env_id).join("config").exists());
        assert!(!cache.repo_path(env_id).join("junk").exists());
    }

    #[tokio::test]
    async fn branches_of_missing_repo_is_empty() {
        let data_root = TempDir::new().unwrap();
        let cache = RepoCache::new(data_root.path().to_path_buf());
        assert!(cache.branches(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
