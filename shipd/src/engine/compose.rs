//! Compose projects through the engine gateway

use std::path::Path;

use tracing::{debug, info};

use crate::engine::docker::{check, EngineGateway};
use crate::engine::policy::validate_compose_args;
use crate::engine::runner::CommandOutput;
use crate::errors::ShipError;
use crate::utils::tail;

/// Standalone compose binary used when the engine has no compose plugin
pub const LEGACY_COMPOSE_BINARY: &str = "docker-compose";

fn plugin_missing(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("is not a docker command")
        || stderr.contains("unknown command")
        || stderr.contains("unknown shorthand flag: 'f' in -f")
}

impl EngineGateway {
    /// Run `compose <args>`, falling back to the standalone binary
    pub async fn compose(&self, args: Vec<String>, cwd: Option<&Path>) -> Result<CommandOutput, ShipError> {
        let mut full = vec!["compose".to_string()];
        full.extend(args.iter().cloned());

        let output = self.exec(full, cwd, None).await?;
        if output.success() || !plugin_missing(&output) {
            return Ok(output);
        }

        debug!("Compose plugin unavailable, trying {}", LEGACY_COMPOSE_BINARY);
        validate_compose_args(&args)?;
        self.exec_program(LEGACY_COMPOSE_BINARY, args, cwd, None).await
    }

    /// Build and start a compose project in the background
    pub async fn compose_up(
        &self,
        project_dir: &Path,
        compose_file: &str,
        project: &str,
        env_file: Option<&Path>,
    ) -> Result<(), ShipError> {
        info!("Starting compose project {} ({})", project, compose_file);
        let mut args = vec![
            "-f".to_string(),
            project_dir.join(compose_file).display().to_string(),
            "-p".to_string(),
            project.to_string(),
        ];
        if let Some(env_file) = env_file {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }
        args.extend(
            ["up", "-d", "--build", "--remove-orphans"]
                .iter()
                .map(|s| s.to_string()),
        );

        let output = self.compose(args, Some(project_dir)).await?;
        if !output.success() {
            return Err(ShipError::BuildError(format!(
                "compose up failed for {}: {}",
                project,
                tail(&output.stderr, 800)
            )));
        }
        Ok(())
    }

    /// Stop and remove a compose project's containers; volumes are kept
    pub async fn compose_down(&self, project: &str) -> Result<(), ShipError> {
        let args = vec![
            "-p".to_string(),
            project.to_string(),
            "down".to_string(),
            "--remove-orphans".to_string(),
        ];
        let output = self.compose(args, None).await?;
        check(output, "compose down").map(|_| ())
    }
}
