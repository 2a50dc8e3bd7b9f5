use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("working tree is dirty; commit or stash before running: {0}")]
    DirtyTree(String),

    #[error("another run holds the repository lock")]
    Locked,

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("commit would be empty")]
    EmptyCommit,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exclusive run lock under the metadata directory. Released on drop;
/// concurrent runs against the same repository fail fast at entry.
#[derive(Debug)]
pub struct RunLock {
    file: Option<std::fs::File>,
}

impl RunLock {
    pub fn acquire(repo_root: &Path) -> Result<Self, RepoError> {
        let dir = restitch_config::metadata_dir(repo_root);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file: Some(file) }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(RepoError::Locked),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

#[derive(Debug, Clone)]
enum OriginalRef {
    Branch(String),
    Detached(String),
}

/// Owns the repository for the duration of a run: creates the repair
/// branch, records commits on it, and restores the original checkout on
/// exit.
pub struct RepoController {
    root: PathBuf,
    original: OriginalRef,
    branch: String,
    base_commit: String,
    _lock: RunLock,
}

impl RepoController {
    pub fn open(root: &Path, stamp: &str) -> Result<Self, RepoError> {
        if !is_git_repo(root) {
            return Err(RepoError::NotARepo(root.to_path_buf()));
        }
        let lock = RunLock::acquire(root)?;

        let status = filtered_status(root)?;
        if !status.trim().is_empty() {
            return Err(RepoError::DirtyTree(
                status.lines().take(5).collect::<Vec<_>>().join(", "),
            ));
        }

        let original = match git(root, &["symbolic-ref", "--short", "-q", "HEAD"]) {
            Ok(name) if !name.trim().is_empty() => OriginalRef::Branch(name.trim().to_string()),
            _ => OriginalRef::Detached(git(root, &["rev-parse", "HEAD"])?.trim().to_string()),
        };
        let base_commit = git(root, &["rev-parse", "HEAD"])?.trim().to_string();

        let branch = format!("restitch/{stamp}");
        git(root, &["checkout", "-b", &branch])?;
        tracing::info!(branch = %branch, base = %base_commit, "opened repair branch");

        Ok(Self {
            root: root.to_path_buf(),
            original,
            branch,
            base_commit,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch_name(&self) -> &str {
        &self.branch
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    /// Stage everything outside the metadata directory and commit on the
    /// repair branch. Rejects empty commits.
    pub fn commit(&self, message: &str) -> Result<String, RepoError> {
        git(&self.root, &["add", "-A", "--", ".", &format!(":!{}", restitch_config::METADATA_DIR)])?;
        let staged = git(&self.root, &["diff", "--cached", "--name-only"])?;
        if staged.trim().is_empty() {
            return Err(RepoError::EmptyCommit);
        }
        git(&self.root, &["commit", "-m", message])?;
        Ok(git(&self.root, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn revert(&self, commit_id: &str) -> Result<(), RepoError> {
        git(&self.root, &["revert", "--no-edit", commit_id]).map(|_| ())
    }

    pub fn reset_hard(&self, refspec: &str) -> Result<(), RepoError> {
        git(&self.root, &["reset", "--hard", refspec]).map(|_| ())
    }

    /// Discard everything the run did: hard-reset the repair branch to the
    /// pre-run tip and drop untracked files outside the metadata directory.
    pub fn rollback(&self) -> Result<(), RepoError> {
        self.reset_hard(&self.base_commit)?;
        git(
            &self.root,
            &["clean", "-fd", "-e", restitch_config::METADATA_DIR],
        )?;
        Ok(())
    }

    pub fn restore_original(&self) -> Result<(), RepoError> {
        let target = match &self.original {
            OriginalRef::Branch(name) => name.clone(),
            OriginalRef::Detached(commit) => commit.clone(),
        };
        git(&self.root, &["checkout", &target]).map(|_| ())
    }

    pub fn branch_commit_count(&self) -> Result<usize, RepoError> {
        let count = git(
            &self.root,
            &["rev-list", "--count", &format!("{}..{}", self.base_commit, self.branch)],
        )?;
        Ok(count.trim().parse().unwrap_or(0))
    }

    /// Delete the repair branch when it carries no commits; leave it in
    /// place otherwise. Must run after `restore_original`.
    pub fn cleanup(&self) -> Result<(), RepoError> {
        if self.branch_commit_count()? == 0 {
            git(&self.root, &["branch", "-D", &self.branch])?;
            tracing::debug!(branch = %self.branch, "deleted empty repair branch");
        }
        Ok(())
    }

    /// Porcelain status with the metadata directory's own entries dropped;
    /// the run's bookkeeping never counts as tree dirt.
    pub fn status_porcelain(&self) -> Result<String, RepoError> {
        filtered_status(&self.root)
    }
}

fn filtered_status(root: &Path) -> Result<String, RepoError> {
    let raw = git(root, &["status", "--porcelain"])?;
    Ok(raw
        .lines()
        .filter(|line| {
            let path = line.get(3..).unwrap_or("").trim_start();
            !path.starts_with(restitch_config::METADATA_DIR)
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

pub fn is_git_repo(root: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(root)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn git(root: &Path, args: &[&str]) -> Result<String, RepoError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(RepoError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
