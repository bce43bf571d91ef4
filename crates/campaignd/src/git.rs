//! Git operations used by the safety and recovery layers.
//!
//! Every call runs `git` as a supervised child with a timeout and captured
//! output. `LC_ALL=C` keeps messages stable for the few places that read them.

use crate::supervisor::{CommandOutput, CommandSpec, ResourceLimits, Supervisor, SupervisorError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),
    #[error("unexpected git output: {0}")]
    InvalidOutput(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// One line of `git stash list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// Reflog selector, e.g. `stash@{0}`. Shifts as stashes are pushed or dropped.
    pub selector: String,
    /// Stash commit SHA. Stable.
    pub sha: String,
    pub subject: String,
}

/// Git runner bound to one work tree.
#[derive(Debug, Clone)]
pub struct Git {
    supervisor: Supervisor,
    root: PathBuf,
    limits: ResourceLimits,
}

impl Git {
    pub fn new(supervisor: Supervisor, root: impl Into<PathBuf>, timeout_sec: u32) -> Self {
        Self {
            supervisor,
            root: root.into(),
            limits: ResourceLimits::timeout_secs(timeout_sec),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .current_dir(&self.root)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0");
        debug!(args = %args.join(" "), "running git");
        Ok(self.supervisor.run(&spec, self.limits).await?)
    }

    /// Run and require exit 0; returns stdout.
    async fn run_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    pub async fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok_and(|out| out.success() && out.stdout.trim() == "true")
    }

    pub async fn ensure_repository(&self) -> Result<()> {
        if self.is_repository().await {
            Ok(())
        } else {
            Err(GitError::NotARepo(self.root.clone()))
        }
    }

    pub async fn current_branch(&self) -> Result<String> {
        Ok(self
            .run_ok(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string())
    }

    pub async fn head_commit(&self) -> Result<String> {
        Ok(self.run_ok(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    /// True when `hash` names an existing commit.
    pub async fn commit_exists(&self, hash: &str) -> Result<bool> {
        let spec = format!("{hash}^{{commit}}");
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", &spec])
            .await?
            .success())
    }

    /// `git status --porcelain` lines; empty means clean.
    pub async fn status_porcelain(&self) -> Result<Vec<String>> {
        Ok(self
            .run_ok(&["status", "--porcelain"])
            .await?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Paths whose work-tree state differs from `reference`: tracked changes
    /// plus untracked, non-ignored files. Sorted and deduplicated.
    pub async fn changed_since(&self, reference: &str) -> Result<Vec<String>> {
        let tracked = self.run_ok(&["diff", "--name-only", reference, "--"]).await?;
        let untracked = self
            .run_ok(&["ls-files", "--others", "--exclude-standard"])
            .await?;
        let paths: BTreeSet<String> = tracked
            .lines()
            .chain(untracked.lines())
            .filter(|l| !l.trim().is_empty())
            .map(ToString::to_string)
            .collect();
        Ok(paths.into_iter().collect())
    }

    /// Paths left in a conflicted state, e.g. after a stash apply.
    pub async fn unmerged_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .run_ok(&["diff", "--name-only", "--diff-filter=U"])
            .await?
            .lines()
            .map(ToString::to_string)
            .collect())
    }

    /// Tracked files, relative to the work tree root.
    pub async fn ls_files(&self) -> Result<Vec<String>> {
        Ok(self
            .run_ok(&["ls-files"])
            .await?
            .lines()
            .map(ToString::to_string)
            .collect())
    }

    /// Snapshot tracked and untracked changes. Returns the stash commit SHA,
    /// or `None` when there was nothing to save.
    pub async fn stash_push(&self, message: &str) -> Result<Option<String>> {
        let output = self
            .run_ok(&["stash", "push", "--include-untracked", "-m", message])
            .await?;
        if output.contains("No local changes to save") {
            return Ok(None);
        }
        let sha = self
            .run_ok(&["rev-parse", "--verify", "refs/stash"])
            .await?
            .trim()
            .to_string();
        if sha.is_empty() {
            return Err(GitError::InvalidOutput(
                "stash push succeeded but refs/stash is empty".to_string(),
            ));
        }
        Ok(Some(sha))
    }

    pub async fn stash_list(&self) -> Result<Vec<StashEntry>> {
        let output = self
            .run_ok(&["stash", "list", "--format=%gd%x09%H%x09%s"])
            .await?;
        Ok(parse_stash_list(&output))
    }

    pub async fn find_stash_by_sha(&self, sha: &str) -> Result<Option<StashEntry>> {
        Ok(self.stash_list().await?.into_iter().find(|e| e.sha == sha))
    }

    /// Newest stash whose subject contains `needle`.
    pub async fn find_stash_by_message(&self, needle: &str) -> Result<Option<StashEntry>> {
        Ok(self
            .stash_list()
            .await?
            .into_iter()
            .find(|e| e.subject.contains(needle)))
    }

    /// Apply a stash commit. With `restore_index` the staged state is restored too.
    pub async fn stash_apply(&self, reference: &str, restore_index: bool) -> Result<()> {
        if restore_index {
            self.run_ok(&["stash", "apply", "--index", reference]).await?;
        } else {
            self.run_ok(&["stash", "apply", reference]).await?;
        }
        Ok(())
    }

    pub async fn stash_drop(&self, selector: &str) -> Result<()> {
        self.run_ok(&["stash", "drop", selector]).await?;
        Ok(())
    }

    /// Drop every stash, including ones this tool did not create.
    pub async fn stash_clear(&self) -> Result<()> {
        self.run_ok(&["stash", "clear"]).await?;
        Ok(())
    }

    pub async fn reset_hard(&self, reference: &str) -> Result<()> {
        self.run_ok(&["reset", "--hard", reference]).await?;
        Ok(())
    }

    /// Remove untracked files and directories. Ignored files survive.
    pub async fn clean_untracked(&self) -> Result<usize> {
        let output = self.run_ok(&["clean", "-fd"]).await?;
        Ok(output.lines().filter(|l| l.starts_with("Removing ")).count())
    }

    /// Write a gzipped tar of HEAD to `dest`.
    pub async fn archive_head(&self, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run_ok(&["archive", "--format=tar.gz", "-o", &dest, "HEAD"])
            .await?;
        Ok(())
    }

    pub async fn create_branch(&self, name: &str, start: &str) -> Result<()> {
        self.run_ok(&["branch", name, start]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.run_ok(&["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let reference = format!("refs/heads/{name}");
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", &reference])
            .await?
            .success())
    }

    pub async fn checkout(&self, reference: &str) -> Result<()> {
        self.run_ok(&["checkout", reference]).await?;
        Ok(())
    }

    /// Copy `paths` from `source` into the work tree and index without
    /// switching branches.
    pub async fn checkout_paths(&self, source: &str, paths: &[&str]) -> Result<()> {
        let mut args = vec!["checkout", source, "--"];
        args.extend_from_slice(paths);
        self.run_ok(&args).await?;
        Ok(())
    }
}

fn parse_stash_list(output: &str) -> Vec<StashEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let selector = parts.next()?.trim();
            let sha = parts.next()?.trim();
            let subject = parts.next().unwrap_or_default().trim();
            if selector.is_empty() || sha.is_empty() {
                return None;
            }
            Some(StashEntry {
                selector: selector.to_string(),
                sha: sha.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}
