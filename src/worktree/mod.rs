// ABOUTME: Container-native worktree coordination: ensure /workspace is a
// checkout of the session branch rooted at the mounted bare clone

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::docker::{bare_clone_mount_path, CapturedOutput, ContainerError, ContainerManager};

const WORKSPACE: &str = "/workspace";
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const HEADS_REFSPEC: &str = "+refs/heads/*:refs/heads/*";

lazy_static! {
    /// Progress noise git prints on stderr during healthy worktree setup.
    static ref BENIGN_STDERR: Regex = Regex::new(
        r"(?m)^(Preparing worktree|Updating files|HEAD is now at|Switched to|branch '.*' set up|remote:|Receiving objects|Resolving deltas|From )"
    )
    .expect("benign stderr pattern");
}

#[derive(Error, Debug)]
pub enum WorktreeError {
    #[error("bare repository mount missing at {path}")]
    MountMissing { path: String },
    #[error("mount at {path} is read-only: the bare repository must be mounted read-write")]
    MountReadOnly { path: String },
    #[error("permission denied writing to mount at {path}")]
    MountPermissionDenied { path: String },
    #[error("repository has no branches and no default branch could be determined")]
    BranchNotFoundAndNoDefault,
    #[error("no space left on device while preparing worktree")]
    DiskFull,
    #[error("git worktree operation failed: {stderr}")]
    GitWorktreeError { stderr: String },
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

/// Creates and repairs per-branch worktrees inside session containers. The
/// bare clone lives at `/repos/<env_id>` (mounted rw); the checkout always
/// lands at `/workspace`.
#[derive(Clone)]
pub struct WorktreeCoordinator {
    containers: Arc<ContainerManager>,
}

impl WorktreeCoordinator {
    pub fn new(containers: Arc<ContainerManager>) -> Self {
        Self { containers }
    }

    /// Converge `/workspace` inside the container onto a checkout of
    /// `branch`. Idempotent; stale or corrupt worktrees left by container
    /// restarts are reset and rebuilt.
    pub async fn ensure_worktree(
        &self,
        container_id: &str,
        env_id: Uuid,
        branch: &str,
    ) -> Result<(), WorktreeError> {
        let repo = bare_clone_mount_path(env_id);

        self.preflight(container_id, &repo).await?;

        if self.workspace_on_branch(container_id, branch).await? {
            debug!("worktree in {container_id} already on {branch}");
            return Ok(());
        }

        self.reset_workspace(container_id, &repo).await;

        let branches = self.branch_inventory(container_id, &repo).await?;
        if branches.is_empty() {
            return Err(WorktreeError::BranchNotFoundAndNoDefault);
        }

        if branches.iter().any(|b| b == branch) {
            info!("checking out existing branch {branch} in {container_id}");
            let out = self
                .git(
                    container_id,
                    &["-C", &repo, "worktree", "add", WORKSPACE, branch],
                )
                .await?;
            self.expect_success(&repo, &out)?;
        } else {
            let base = pick_default_branch(&branches)
                .ok_or(WorktreeError::BranchNotFoundAndNoDefault)?;
            info!("creating branch {branch} from {base} in {container_id}");
            let out = self
                .git(
                    container_id,
                    &["-C", &repo, "worktree", "add", "-b", branch, WORKSPACE, &base],
                )
                .await?;
            self.expect_success(&repo, &out)?;
        }

        // Postflight: the checkout must answer git status cleanly.
        let out = self
            .git(container_id, &["-C", WORKSPACE, "status", "--porcelain"])
            .await?;
        if !out.success() {
            return Err(classify_stderr(&repo, &out.stderr));
        }
        let noise = filter_benign(&out.stderr);
        if !noise.is_empty() {
            return Err(WorktreeError::GitWorktreeError { stderr: noise });
        }

        Ok(())
    }

    /// Verify the mount exists, is a git dir, and is writable. A read-only
    /// bare-clone mount is the most common misconfiguration; the error
    /// names the path so the operator can find it.
    async fn preflight(&self, container_id: &str, repo: &str) -> Result<(), WorktreeError> {
        let check = self
            .sh(
                container_id,
                &format!("test -d {repo} && test -f {repo}/HEAD"),
            )
            .await?;
        if !check.success() {
            return Err(WorktreeError::MountMissing {
                path: repo.to_string(),
            });
        }

        let probe = self
            .sh(
                container_id,
                &format!("touch {repo}/.write-probe && rm -f {repo}/.write-probe"),
            )
            .await?;
        if !probe.success() {
            return Err(classify_stderr(repo, &probe.stderr));
        }
        Ok(())
    }

    async fn workspace_on_branch(
        &self,
        container_id: &str,
        branch: &str,
    ) -> Result<bool, WorktreeError> {
        let has_git = self
            .sh(container_id, &format!("test -e {WORKSPACE}/.git"))
            .await?;
        if !has_git.success() {
            return Ok(false);
        }
        let current = self
            .git(container_id, &["-C", WORKSPACE, "branch", "--show-current"])
            .await?;
        Ok(current.success() && current.stdout.trim() == branch)
    }

    /// Drop whatever is at /workspace and unregister any worktree still
    /// pointing there. Registrations routinely outlive their directories
    /// when containers restart, so every failure here is non-fatal.
    async fn reset_workspace(&self, container_id: &str, repo: &str) {
        let _ = self
            .git(
                container_id,
                &["-C", repo, "worktree", "remove", "--force", WORKSPACE],
            )
            .await;
        if let Err(e) = self.sh(container_id, &format!("rm -rf {WORKSPACE}")).await {
            warn!("clearing {WORKSPACE} in {container_id} failed: {e}");
        }
        let _ = self.git(container_id, &["-C", repo, "worktree", "prune"]).await;
    }

    /// Local branches of the bare clone, fetching once if it looks empty.
    async fn branch_inventory(
        &self,
        container_id: &str,
        repo: &str,
    ) -> Result<Vec<String>, WorktreeError> {
        let listed = self.list_branches(container_id, repo).await?;
        if !listed.is_empty() {
            return Ok(listed);
        }
        debug!("bare clone {repo} has no branches, fetching heads once");
        let fetch = self
            .containers
            .exec_capture_with_timeout(
                container_id,
                vec![
                    "git".into(),
                    "-C".into(),
                    repo.into(),
                    "fetch".into(),
                    "origin".into(),
                    HEADS_REFSPEC.into(),
                ],
                FETCH_TIMEOUT,
            )
            .await?;
        if !fetch.success() {
            warn!("fetch inside {container_id} failed: {}", fetch.stderr.trim());
        }
        self.list_branches(container_id, repo).await
    }

    async fn list_branches(
        &self,
        container_id: &str,
        repo: &str,
    ) -> Result<Vec<String>, WorktreeError> {
        let out = self
            .git(
                container_id,
                &["-C", repo, "for-each-ref", "--format=%(refname:short)", "refs/heads"],
            )
            .await?;
        if !out.success() {
            return Err(classify_stderr(repo, &out.stderr));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn expect_success(&self, repo: &str, out: &CapturedOutput) -> Result<(), WorktreeError> {
        if out.success() {
            Ok(())
        } else {
            Err(classify_stderr(repo, &out.stderr))
        }
    }

    async fn git(
        &self,
        container_id: &str,
        args: &[&str],
    ) -> Result<CapturedOutput, WorktreeError> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        Ok(self.containers.exec_capture(container_id, argv).await?)
    }

    async fn sh(
        &self,
        container_id: &str,
        script: &str,
    ) -> Result<CapturedOutput, WorktreeError> {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        Ok(self.containers.exec_capture(container_id, argv).await?)
    }
}

/// Default base branch when the requested branch does not exist yet:
/// `main`, then `master`, then whatever is listed first.
fn pick_default_branch(branches: &[String]) -> Option<String> {
    for preferred in ["main", "master"] {
        if branches.iter().any(|b| b == preferred) {
            return Some(preferred.to_string());
        }
    }
    branches.first().cloned()
}

/// Map git/tool stderr onto the typed failure taxonomy.
fn classify_stderr(repo: &str, stderr: &str) -> WorktreeError {
    if stderr.contains("Read-only file system") {
        return WorktreeError::MountReadOnly {
            path: repo.to_string(),
        };
    }
    if stderr.contains("No space left") {
        return WorktreeError::DiskFull;
    }
    if stderr.contains("Permission denied") {
        return WorktreeError::MountPermissionDenied {
            path: repo.to_string(),
        };
    }
    WorktreeError::GitWorktreeError {
        stderr: filter_benign(stderr),
    }
}

fn filter_benign(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !BENIGN_STDERR.is_match(l))
        .collect::<Vec<_>>()
        .join("\n")
}
