//! Per-layer snapshots of the destination directory.
//!
//! A [`Snapshotter`] records each applied layer as its own branch + commit.
//! [`GitSnapshotter`] drives the `git` binary; [`NoopSnapshotter`] is used
//! for flattened pulls where no history is kept.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use layerpull_hub::LayerId;
use tokio::process::Command;
use tracing::debug;

/// Errors raised by a snapshot backend.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot root has not been initialised")]
    NotInitialized,

    #[error("`git {args}` exited with {status}: {stderr}")]
    Command {
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Branch name for the layer at `position` in the chain.
pub fn branch_name(position: usize, layer: &LayerId) -> String {
    format!("layer{}_{}", position, layer)
}

/// Commit message for the layer at `position` in the chain.
pub fn commit_message(position: usize) -> String {
    format!("adding layer {}", position)
}

/// Capability the pull driver needs from a version-control backend.
#[async_trait]
pub trait Snapshotter: Send {
    /// Create the snapshot root at `root`. Called once, before any layer is applied.
    async fn init_root(&mut self, root: &Path) -> Result<(), SnapshotError>;

    /// Open a new branch from the current head.
    async fn branch(&mut self, name: &str) -> Result<(), SnapshotError>;

    /// Stage every change under the root and commit it.
    async fn commit_all(&mut self, message: &str) -> Result<(), SnapshotError>;
}

/// Snapshotter that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotter;

#[async_trait]
impl Snapshotter for NoopSnapshotter {
    async fn init_root(&mut self, _root: &Path) -> Result<(), SnapshotError> {
        Ok(())
    }

    async fn branch(&mut self, _name: &str) -> Result<(), SnapshotError> {
        Ok(())
    }

    async fn commit_all(&mut self, _message: &str) -> Result<(), SnapshotError> {
        Ok(())
    }
}

/// Snapshotter backed by a git repository at the destination.
#[derive(Debug, Clone)]
pub struct GitSnapshotter {
    git: PathBuf,
    root: Option<PathBuf>,
    author_name: String,
    author_email: String,
}

impl Default for GitSnapshotter {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            root: None,
            author_name: "layerpull".to_string(),
            author_email: "layerpull@localhost".to_string(),
        }
    }
}

impl GitSnapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific git binary instead of the one on `PATH`.
    pub fn git_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.git = path.into();
        self
    }

    /// Identity recorded on every layer commit.
    pub fn author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    async fn git(&self, root: &Path, args: &[&str]) -> Result<(), SnapshotError> {
        debug!(root = %root.display(), args = ?args, "running git");
        let output = Command::new(&self.git)
            .arg("-c")
            .arg("commit.gpgsign=false")
            .args(args)
            .current_dir(root)
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(SnapshotError::Command {
                args: args.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn root(&self) -> Result<&Path, SnapshotError> {
        self.root.as_deref().ok_or(SnapshotError::NotInitialized)
    }
}

#[async_trait]
impl Snapshotter for GitSnapshotter {
    async fn init_root(&mut self, root: &Path) -> Result<(), SnapshotError> {
        self.git(root, &["init", "-q"]).await?;
        self.root = Some(root.to_path_buf());
        Ok(())
    }

    async fn branch(&mut self, name: &str) -> Result<(), SnapshotError> {
        let root = self.root()?.to_path_buf();
        self.git(&root, &["checkout", "-q", "-b", name]).await
    }

    async fn commit_all(&mut self, message: &str) -> Result<(), SnapshotError> {
        let root = self.root()?.to_path_buf();
        self.git(&root, &["add", "-A"]).await?;
        self.git(&root, &["commit", "-q", "--allow-empty", "-m", message])
            .await
    }
}
