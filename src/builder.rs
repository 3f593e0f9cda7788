//! Environment builder: materializes one side from a set of repository heads
//!
//! A build runs in three stages for every tracked repository (clone or fetch,
//! hard reset, clean) and then hands the side's checkouts to the backend
//! launcher. Everything happens under `<workspace>/<side>`, so a build never
//! touches the side that is serving.

use crate::config::RepoConfig;
use crate::signature::{RepositoryHead, Signature};
use crate::state::{Environment, Side};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Why a build attempt failed. All variants are retryable on the next poll.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("backend failed to launch: {0}")]
    Launch(String),

    #[error("backend did not become healthy at {address} within {waited_secs}s")]
    Unhealthy { address: SocketAddr, waited_secs: u64 },

    #[error("no head for tracked repository '{0}'")]
    MissingHead(String),
}

/// Working-copy operations, normally backed by the `git` CLI
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Clone `remote` into `path` unless a working copy is already there
    async fn ensure_clone(&self, remote: &str, path: &Path) -> Result<(), BuildError>;

    /// Fetch from the remote and hard-reset to `commit`
    async fn fetch_and_reset(&self, path: &Path, commit: &str) -> Result<(), BuildError>;

    /// Remove untracked and ignored files
    async fn clean_working_tree(&self, path: &Path) -> Result<(), BuildError>;
}

/// Checkout directories of one side, keyed by repository name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideDirs {
    pub side: Side,
    pub root: PathBuf,
    pub repos: BTreeMap<String, PathBuf>,
}

/// Starts and stops the backend process of a side
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Build and start the backend for `dirs.side`; returns once it serves traffic
    async fn start_backend(&self, dirs: &SideDirs) -> Result<SocketAddr, BuildError>;

    /// Stop the backend of `side`, if one is running
    async fn stop_backend(&self, side: Side);

    /// Stop every backend (process shutdown)
    async fn stop_all(&self);
}

/// Drives checkout and launch for a side
pub struct EnvironmentBuilder {
    workspace: PathBuf,
    repos: Vec<RepoConfig>,
    checkout: Arc<dyn Checkout>,
    launcher: Arc<dyn BackendLauncher>,
}

impl EnvironmentBuilder {
    pub fn new(
        workspace: impl Into<PathBuf>,
        repos: Vec<RepoConfig>,
        checkout: Arc<dyn Checkout>,
        launcher: Arc<dyn BackendLauncher>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            repos,
            checkout,
            launcher,
        }
    }

    /// Directory layout for `side`
    pub fn side_dirs(&self, side: Side) -> SideDirs {
        let root = self.workspace.join(side.as_str());
        let repos = self
            .repos
            .iter()
            .map(|r| (r.name.clone(), root.join(r.relative_path())))
            .collect();
        SideDirs { side, root, repos }
    }

    /// Build `side` at `heads`. On error the side is left stopped.
    pub async fn build(
        &self,
        side: Side,
        heads: &[RepositoryHead],
        signature: &Signature,
    ) -> Result<Environment, BuildError> {
        let started = Instant::now();
        let dirs = self.side_dirs(side);

        // The previous backend of this side is not serving; free its port and tree
        self.launcher.stop_backend(side).await;

        tokio::fs::create_dir_all(&dirs.root)
            .await
            .map_err(|source| BuildError::Io {
                path: dirs.root.clone(),
                source,
            })?;

        for repo in &self.repos {
            let commit = heads
                .iter()
                .find(|h| h.name == repo.name)
                .map(|h| h.commit.as_str())
                .ok_or_else(|| BuildError::MissingHead(repo.name.clone()))?;
            let path = &dirs.repos[&repo.name];

            debug!(%side, repo = %repo.name, commit, path = %path.display(), "Preparing checkout");
            self.checkout.ensure_clone(&repo.remote, path).await?;
            self.checkout.fetch_and_reset(path, commit).await?;
            self.checkout.clean_working_tree(path).await?;
        }

        info!(%side, signature = %signature.short(), "Checkouts ready, starting backend");
        let address = match self.launcher.start_backend(&dirs).await {
            Ok(addr) => addr,
            Err(e) => {
                self.launcher.stop_backend(side).await;
                return Err(e);
            }
        };

        info!(
            %side,
            %address,
            elapsed_secs = started.elapsed().as_secs(),
            "Environment built"
        );

        Ok(Environment {
            side,
            address,
            built_signature: signature.clone(),
            ready: true,
        })
    }
}
