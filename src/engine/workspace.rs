use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::models::SourceFile;

const ALLOCATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceOwner {
    Job,
    Session(String),
}

impl WorkspaceOwner {
    fn prefix(&self) -> &'static str {
        match self {
            WorkspaceOwner::Job => "job",
            WorkspaceOwner::Session(_) => "debug",
        }
    }
}

/// An exclusively owned working directory. Dropping an unreleased workspace
/// removes it synchronously, so a panicking owner still cleans up.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    created_at: DateTime<Utc>,
    owner: WorkspaceOwner,
    released: bool,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes each file under its own name and returns the absolute paths in
    /// submission order.
    pub async fn write_files(&self, files: &[SourceFile]) -> anyhow::Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            let path = self.root.join(&file.name);
            tokio::fs::write(&path, file.contents.as_bytes())
                .await
                .with_context(|| format!("failed to write source file {}", path.display()))?;
            paths.push(path);
        }
        Ok(paths)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %self.root.display(),
                error = %err,
                "failed to remove dropped workspace"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn allocate(&self, owner: WorkspaceOwner) -> anyhow::Result<Workspace> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;

        for _ in 0..ALLOCATE_ATTEMPTS {
            let root = self
                .base_dir
                .join(format!("{}-{}", owner.prefix(), Uuid::new_v4().as_simple()));
            // create_dir (not create_dir_all) fails on an existing path, so a
            // directory is never handed to two owners.
            match tokio::fs::create_dir(&root).await {
                Ok(()) => {
                    tracing::debug!(path = %root.display(), "workspace allocated");
                    return Ok(Workspace {
                        root,
                        created_at: Utc::now(),
                        owner,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create workspace {}", root.display()));
                }
            }
        }
        anyhow::bail!("could not allocate a unique workspace name")
    }

    /// Best-effort recursive removal. Never fails the caller.
    pub async fn release(&self, mut workspace: Workspace) {
        workspace.released = true;
        match tokio::fs::remove_dir_all(&workspace.root).await {
            Ok(()) => tracing::debug!(
                path = %workspace.root.display(),
                owner = ?workspace.owner,
                held_ms = (Utc::now() - workspace.created_at).num_milliseconds(),
                "workspace released"
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %workspace.root.display(),
                error = %err,
                "failed to release workspace"
            ),
        }
    }
}
