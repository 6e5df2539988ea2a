//! Change lifecycle — branch, commit, publish, propose, integrate, resync.
//!
//! Code-change cards never write to the main line directly. Each one gets a
//! uniquely named branch, a conventional commit, a pushed change request,
//! and an auto-merge; any failure unwinds back to the main branch so the
//! working tree is never left stranded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::dispatch::exec::{self, CmdOutput};
use crate::error::LifecycleError;

/// Accepted conventional-commit prefixes. The gate rejects anything else
/// before a branch exists; defaulting an unprefixed message is the caller's
/// decision, never done silently here.
pub const CONVENTIONAL_PREFIXES: &[&str] = &[
    "feat:", "fix:", "docs:", "chore:", "refactor:", "test:", "style:", "perf:",
];

/// Check whether a commit message carries a conventional prefix.
pub fn has_conventional_prefix(message: &str) -> bool {
    CONVENTIONAL_PREFIXES.iter().any(|p| message.starts_with(p))
}

/// Executes the change protocol for one card.
pub struct ChangeLifecycle {
    repo_root: PathBuf,
    main_branch: String,
    remote: String,
    timeout: Duration,
}

impl ChangeLifecycle {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            repo_root: config.workspace_root.clone(),
            main_branch: config.main_branch.clone(),
            remote: config.git_remote.clone(),
            timeout: config.command_timeout,
        }
    }

    /// Create a lifecycle against an explicit repository root.
    pub fn with_repo(repo_root: &Path, main_branch: &str, remote: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            main_branch: main_branch.to_string(),
            remote: remote.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Run the full protocol for a card. Returns a human-readable summary on
    /// success; on failure the tree has been returned to the main branch
    /// best-effort and the error names the failed step.
    pub async fn run(
        &self,
        correlation_id: &str,
        message: &str,
    ) -> Result<String, LifecycleError> {
        if !has_conventional_prefix(message) {
            return Err(LifecycleError::MessageRejected(message.to_string()));
        }

        let branch = format!("card/{}", branch_safe(correlation_id));

        match self.run_steps(&branch, message).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(branch = %branch, error = %e, "Change lifecycle failed; returning to main");
                self.recover(&branch).await;
                Err(e)
            }
        }
    }

    async fn run_steps(&self, branch: &str, message: &str) -> Result<String, LifecycleError> {
        self.git(&["checkout", "-b", branch], "isolate").await?;

        self.git(&["add", "-A"], "stage").await?;
        let status = self.git(&["status", "--porcelain"], "stage").await?;
        if status.stdout.trim().is_empty() {
            // Nothing staged: unwind the empty branch and report success.
            self.git(&["checkout", &self.main_branch], "stage").await?;
            self.git(&["branch", "-D", branch], "stage").await?;
            info!(branch = %branch, "No changes staged; lifecycle is a no-op");
            return Ok("no changes to integrate".to_string());
        }

        self.git(&["commit", "-m", message], "commit").await?;
        self.git(&["push", "-u", &self.remote, branch], "publish")
            .await?;

        self.gh(&["pr", "create", "--fill", "--head", branch], "propose")
            .await?;
        self.gh(
            &["pr", "merge", branch, "--merge", "--delete-branch"],
            "integrate",
        )
        .await?;

        self.git(&["checkout", &self.main_branch], "resync").await?;
        self.git(&["pull", &self.remote, &self.main_branch], "resync")
            .await?;
        // The merge usually removed the local branch already; a leftover
        // reference is deleted here and a missing one is not an error.
        let _ = self.try_git(&["branch", "-D", branch]).await;

        info!(branch = %branch, "Change integrated");
        Ok(format!("merged {branch}"))
    }

    /// Best-effort return to the main branch after a failed step.
    async fn recover(&self, branch: &str) {
        let _ = self.try_git(&["checkout", &self.main_branch]).await;
        let _ = self.try_git(&["branch", "-D", branch]).await;
    }

    /// The branch the working tree currently sits on.
    pub async fn current_branch(&self) -> Result<String, LifecycleError> {
        let out = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"], "inspect")
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Whether a local branch exists.
    pub async fn branch_exists(&self, branch: &str) -> bool {
        self.try_git(&["rev-parse", "--verify", branch])
            .await
            .map(|out| out.success())
            .unwrap_or(false)
    }

    async fn git(&self, args: &[&str], step: &'static str) -> Result<CmdOutput, LifecycleError> {
        let out = self.try_git(args).await.map_err(|e| LifecycleError::Step {
            step,
            detail: e.to_string(),
        })?;
        if !out.success() {
            return Err(LifecycleError::Step {
                step,
                detail: out.result_text().trim().to_string(),
            });
        }
        Ok(out)
    }

    async fn try_git(&self, args: &[&str]) -> Result<CmdOutput, crate::error::ExecError> {
        exec::run_argv("git", args, &self.repo_root, self.timeout).await
    }

    async fn gh(&self, args: &[&str], step: &'static str) -> Result<CmdOutput, LifecycleError> {
        let out = exec::run_argv("gh", args, &self.repo_root, self.timeout)
            .await
            .map_err(|e| LifecycleError::Step {
                step,
                detail: e.to_string(),
            })?;
        if !out.success() {
            return Err(LifecycleError::Step {
                step,
                detail: out.result_text().trim().to_string(),
            });
        }
        Ok(out)
    }
}

/// Restrict a correlation id to characters git accepts in a ref name.
fn branch_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
