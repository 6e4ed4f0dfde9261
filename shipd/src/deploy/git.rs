//! Source fetch with the git CLI

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::deploy::hooks::{FetchedSource, SourceFetcher};
use crate::engine::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::ShipError;
use crate::utils::tail;

/// Clones a ref into a fresh release directory
pub struct GitFetcher {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl GitFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "git".to_string(),
        }
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<CommandOutput, ShipError> {
        let mut spec = CommandSpec::new(
            self.binary.clone(),
            args.iter().map(|s| s.to_string()).collect(),
        );
        if let Some(cwd) = cwd {
            spec = spec.current_dir(cwd);
        }
        self.runner.run(&spec).await
    }

    async fn git_ok(&self, args: &[&str], cwd: Option<&Path>) -> Result<CommandOutput, ShipError> {
        let output = self.git(args, cwd).await?;
        if !output.success() {
            return Err(ShipError::BuildError(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                tail(&output.stderr, 500)
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, remote: &str, reference: &str, target: &Path) -> Result<FetchedSource, ShipError> {
        info!("Fetching {} ({}) into {}", remote, reference, target.display());
        let target_str = target.display().to_string();

        let shallow = self
            .git(
                &["clone", "--depth", "1", "--branch", reference, remote, &target_str],
                None,
            )
            .await?;

        if !shallow.success() {
            // Commit hashes cannot be cloned by --branch
            debug!(
                "Shallow clone of {} failed, retrying full clone: {}",
                reference,
                tail(&shallow.stderr, 200)
            );
            self.git_ok(&["clone", remote, &target_str], None).await?;
            self.git_ok(&["checkout", reference], Some(target)).await?;
        }

        let head = self.git_ok(&["rev-parse", "HEAD"], Some(target)).await?;
        let commit = head.stdout.trim().to_string();
        info!("Fetched commit {}", commit);
        Ok(FetchedSource { commit })
    }
}
