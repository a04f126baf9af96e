//! Fetching repositories into the GOPATH.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::error::{QfarmError, Result};

/// Source of repository checkouts.
#[cfg_attr(test, mockall::automock)]
pub trait SourceFetcher: Send + Sync {
    /// Download or update a repository and its test dependencies.
    fn download(&self, repo: &str) -> Result<()>;
    /// Identifier of the checked-out commit.
    fn last_commit(&self, repo: &str) -> Result<String>;
    /// Location of the checkout.
    fn checkout_path(&self, repo: &str) -> PathBuf;
}

/// Fetcher driving `go get` and `git`.
#[derive(Debug, Clone)]
pub struct GoGetFetcher {
    config: Arc<WorkerConfig>,
}

impl GoGetFetcher {
    /// Fetcher using the configured toolchain and GOPATH.
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self { config }
    }
}

impl SourceFetcher for GoGetFetcher {
    fn download(&self, repo: &str) -> Result<()> {
        let pattern = format!("{}/...", repo.trim_end_matches('/'));
        let mut command = Command::new(&self.config.go_binary);
        command
            .args(["get", "-u", "-t", &pattern])
            .env("GOPATH", &self.config.gopath);
        run(command, &format!("go get {pattern}"))?;
        Ok(())
    }

    fn last_commit(&self, repo: &str) -> Result<String> {
        let mut command = Command::new("git");
        command
            .args(["rev-parse", "HEAD"])
            .current_dir(self.checkout_path(repo))
            .env("GIT_TERMINAL_PROMPT", "0");
        let hash = run(command, "git rev-parse HEAD")?;
        let hash = hash.trim();
        if hash.is_empty() {
            return Err(QfarmError::Execution(format!(
                "git rev-parse HEAD printed nothing for {repo}"
            )));
        }
        Ok(hash.to_string())
    }

    fn checkout_path(&self, repo: &str) -> PathBuf {
        self.config.checkout_path(repo)
    }
}

fn run(mut command: Command, label: &str) -> Result<String> {
    let output = command
        .output()
        .map_err(|err| QfarmError::Execution(format!("{label} failed: {err}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(QfarmError::Execution(format!("{label} failed: {detail}")));
    }
    Ok(stdout)
}
