//! Collaborators backed by the `git` command line and a shell validation
//! command.
//!
//! Every item gets a branch `foreman/<id>` checked out in its own worktree
//! under the worktree root. Workers commit on that branch; uncommitted edits
//! in a worktree are not part of the workspace. The repository root itself
//! stays on the mainline branch and is only touched by the integration
//! pipeline.
//!
//! Requires git 2.38 or later (`merge-tree --write-tree`).

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, warn};

use crate::collab::{
    InfraError, InfraResult, MainlineHandle, MainlinePublisher, MergeResult, ValidationReport,
    ValidationRunner, ValidationTarget, WorkspaceProvider,
};
use crate::config::{IntegrationConfig, STATE_DIR};
use crate::model::ItemId;

/// Branch namespace for item workspaces.
pub const BRANCH_PREFIX: &str = "foreman/";

/// Lines of command output kept in a failing validation report.
const REPORT_TAIL_LINES: usize = 20;

fn run_git(dir: &Path, args: &[&str]) -> InfraResult<Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| InfraError::permanent(format!("git {}", args.join(" ")), err.to_string()))
}

/// Run git and return trimmed stdout, mapping a non-zero exit to an error
/// of the given transience.
fn git_ok(dir: &Path, operation: &str, args: &[&str], transient: bool) -> InfraResult<String> {
    let output = run_git(dir, args)?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = format!("git {}: {stderr}", args.join(" "));
    Err(if transient {
        InfraError::transient(operation, message)
    } else {
        InfraError::permanent(operation, message)
    })
}

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

/// Branch-plus-worktree per item.
#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    repo: PathBuf,
    mainline: String,
    remote: Option<String>,
    worktree_root: PathBuf,
}

impl GitWorkspaces {
    /// Workspaces for `repo`, with worktrees under `<repo>/.foreman/worktrees`.
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>, config: &IntegrationConfig) -> Self {
        let repo = repo.into();
        let worktree_root = repo.join(STATE_DIR).join("worktrees");
        Self {
            repo,
            mainline: config.mainline.clone(),
            remote: None,
            worktree_root,
        }
    }

    #[must_use]
    pub fn with_worktree_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.worktree_root = root.into();
        self
    }

    /// Also delete workspace branches on `remote` when destroying.
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Checkout directory of a workspace reference.
    #[must_use]
    pub fn worktree_path(&self, workspace: &str) -> PathBuf {
        let name = workspace.strip_prefix(BRANCH_PREFIX).unwrap_or(workspace);
        self.worktree_root.join(name)
    }

    fn branch_exists(&self, branch: &str) -> InfraResult<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = run_git(&self.repo, &["rev-parse", "--verify", "--quiet", &reference])?;
        Ok(output.status.success())
    }
}

impl WorkspaceProvider for GitWorkspaces {
    fn create(&self, item: &ItemId) -> InfraResult<String> {
        let branch = format!("{BRANCH_PREFIX}{item}");
        let path = self.worktree_path(&branch);
        if path.exists() {
            debug!(item_id = %item, %branch, "reusing existing worktree");
            return Ok(branch);
        }
        let path_arg = path.to_string_lossy().into_owned();
        if self.branch_exists(&branch)? {
            git_ok(&self.repo, "create", &["worktree", "add", &path_arg, &branch], false)?;
        } else {
            git_ok(
                &self.repo,
                "create",
                &["worktree", "add", "-b", &branch, &path_arg, &self.mainline],
                false,
            )?;
        }
        debug!(item_id = %item, %branch, path = %path.display(), "workspace created");
        Ok(branch)
    }

    fn has_changes(&self, workspace: &str) -> InfraResult<bool> {
        let output = run_git(
            &self.repo,
            &["merge-tree", "--write-tree", &self.mainline, workspace],
        )?;
        match output.status.code() {
            Some(0) => {}
            // Conflicts mean the workspace certainly differs.
            Some(1) => return Ok(true),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(InfraError::permanent("diff", stderr.trim().to_string()));
            }
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let merged_tree = stdout.lines().next().unwrap_or_default().trim().to_string();
        let mainline_tree = git_ok(
            &self.repo,
            "diff",
            &["rev-parse", &format!("{}^{{tree}}", self.mainline)],
            false,
        )?;
        Ok(merged_tree != mainline_tree)
    }

    fn merge(&self, workspace: &str) -> InfraResult<MergeResult> {
        let output = run_git(&self.repo, &["merge", "--squash", workspace])?;
        if output.status.success() {
            return Ok(MergeResult::Merged);
        }

        let unmerged = git_ok(
            &self.repo,
            "merge",
            &["diff", "--name-only", "--diff-filter=U"],
            false,
        )?;
        let paths: Vec<String> = unmerged.lines().map(str::to_string).collect();
        // A squash merge has no MERGE_HEAD, so `merge --abort` cannot undo it.
        git_ok(&self.repo, "merge", &["reset", "--hard", "HEAD"], false)?;

        if paths.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InfraError::permanent("merge", stderr.trim().to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(MergeResult::Conflict {
            paths,
            detail: stdout.trim().to_string(),
        })
    }

    fn destroy(&self, workspace: &str) -> InfraResult<()> {
        let path = self.worktree_path(workspace);
        if path.exists() {
            let path_arg = path.to_string_lossy().into_owned();
            git_ok(
                &self.repo,
                "destroy",
                &["worktree", "remove", "--force", &path_arg],
                false,
            )?;
        }
        if self.branch_exists(workspace)? {
            git_ok(&self.repo, "destroy", &["branch", "-D", workspace], false)?;
        }
        if let Some(remote) = &self.remote {
            let output = run_git(&self.repo, &["push", remote, "--delete", workspace])?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(workspace, remote = %remote, stderr = %stderr.trim(), "remote branch not deleted");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mainline
// ---------------------------------------------------------------------------

/// The repository root, checked out on the mainline branch.
#[derive(Debug, Clone)]
pub struct GitMainline {
    repo: PathBuf,
    mainline: String,
    remote: Option<String>,
}

impl GitMainline {
    /// Local-only mainline; `sync` and `publish` do nothing.
    #[must_use]
    pub fn local(repo: impl Into<PathBuf>, config: &IntegrationConfig) -> Self {
        Self {
            repo: repo.into(),
            mainline: config.mainline.clone(),
            remote: None,
        }
    }

    /// Mainline shared through `config.remote`.
    #[must_use]
    pub fn shared(repo: impl Into<PathBuf>, config: &IntegrationConfig) -> Self {
        Self {
            remote: Some(config.remote.clone()),
            ..Self::local(repo, config)
        }
    }
}

impl MainlinePublisher for GitMainline {
    fn sync(&self) -> InfraResult<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        git_ok(&self.repo, "sync", &["fetch", remote, &self.mainline], true)?;
        let upstream = format!("{remote}/{}", self.mainline);
        git_ok(&self.repo, "sync", &["reset", "--hard", &upstream], false)?;
        Ok(())
    }

    fn snapshot(&self) -> InfraResult<MainlineHandle> {
        git_ok(&self.repo, "snapshot", &["rev-parse", "HEAD"], false).map(MainlineHandle)
    }

    fn restore(&self, handle: &MainlineHandle) -> InfraResult<()> {
        git_ok(&self.repo, "restore", &["reset", "--hard", &handle.0], false)?;
        Ok(())
    }

    fn commit(&self, message: &str, item: &ItemId) -> InfraResult<MainlineHandle> {
        let trailer = format!("Foreman-Item: {item}");
        git_ok(
            &self.repo,
            "commit",
            &["commit", "--quiet", "-m", message, "-m", &trailer],
            false,
        )?;
        self.snapshot()
    }

    fn publish(&self) -> InfraResult<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let refspec = format!("HEAD:{}", self.mainline);
        git_ok(&self.repo, "publish", &["push", remote, &refspec], true)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Runs the configured validation command in the repository root.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    repo: PathBuf,
    command: Vec<String>,
}

impl CommandValidator {
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>, config: &IntegrationConfig) -> Self {
        Self {
            repo: repo.into(),
            command: config.validation_command.clone(),
        }
    }
}

impl ValidationRunner for CommandValidator {
    fn run(&self, target: &ValidationTarget<'_>) -> InfraResult<ValidationReport> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(InfraError::permanent("validate", "no validation command"));
        };
        debug!(item_id = %target.item.id, base = %target.base, program, "running validation");
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.repo)
            .env("FOREMAN_ITEM", target.item.id.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| InfraError::permanent("validate", format!("spawn {program}: {err}")))?;

        if output.status.success() {
            return Ok(ValidationReport::pass());
        }

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let lines: Vec<&str> = combined.lines().collect();
        let tail = lines[lines.len().saturating_sub(REPORT_TAIL_LINES)..]
            .iter()
            .map(|l| (*l).to_string())
            .collect();
        Ok(ValidationReport::fail(
            format!(
                "`{}` exited with code {}",
                self.command.join(" "),
                output.status.code().unwrap_or(-1)
            ),
            tail,
        ))
    }
}
