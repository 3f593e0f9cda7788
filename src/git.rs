//! Working copies managed through the `git` CLI

use crate::builder::{BuildError, Checkout};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// [`Checkout`] implementation that shells out to `git`
#[derive(Debug, Clone)]
pub struct GitCheckout {
    program: String,
}

impl Default for GitCheckout {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCheckout {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Run git with `args`, optionally inside `dir`, failing on non-zero exit
    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<(), BuildError> {
        let command_line = format!("{} {}", self.program, args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        // Never block on a credential prompt
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        debug!(command = %command_line, dir = ?dir, "Running git");

        let output = cmd.output().await.map_err(|e| BuildError::Command {
            command: command_line.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Command {
                command: command_line,
                message: format!("{} ({})", stderr.trim(), output.status),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn ensure_clone(&self, remote: &str, path: &Path) -> Result<(), BuildError> {
        match tokio::fs::metadata(path.join(".git")).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BuildError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| BuildError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        info!(remote, path = %path.display(), "Cloning repository");
        let path_str = path.to_string_lossy().into_owned();
        self.run(None, &["clone", remote, path_str.as_str()]).await
    }

    async fn fetch_and_reset(&self, path: &Path, commit: &str) -> Result<(), BuildError> {
        self.run(Some(path), &["fetch", "origin"]).await?;
        self.run(Some(path), &["reset", "--hard", commit]).await
    }

    async fn clean_working_tree(&self, path: &Path) -> Result<(), BuildError> {
        self.run(Some(path), &["clean", "-d", "-f", "-x"]).await
    }
}
