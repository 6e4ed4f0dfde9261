//! Deployment strategy resolution

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ShipError;
use crate::filesys::dir::Dir;
use crate::models::app::AppMetadata;
use crate::models::config::{DeployConfig, Runtime};

/// Compose file names recognized in a release, in lookup order
pub const COMPOSE_FILES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// User-supplied Dockerfile name
pub const DOCKERFILE: &str = "Dockerfile";

/// How an application is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    /// Source checked out into a release and built on the host
    Git,

    /// Pre-built image pulled from a registry
    Image,
}

/// Resolve the delivery strategy.
///
/// Only an explicit `image` declaration selects the image pipeline; anything
/// else, including no declaration, is `git`.
pub fn resolve_deploy_strategy(metadata: &AppMetadata) -> DeployStrategy {
    match metadata.deploy_strategy.as_deref() {
        Some("image") => DeployStrategy::Image,
        _ => DeployStrategy::Git,
    }
}

/// How a git release is turned into running containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerStrategy {
    /// The release ships its own compose file
    UserCompose { compose_file: String },

    /// The release ships its own Dockerfile
    UserDockerfile,

    /// Generated compose project with dependency services
    AutoCompose,

    /// Generated single-service Dockerfile
    AutoDockerfile,
}

impl DockerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStrategy::UserCompose { .. } => "user-compose",
            DockerStrategy::UserDockerfile => "user-dockerfile",
            DockerStrategy::AutoCompose => "auto-compose",
            DockerStrategy::AutoDockerfile => "auto-dockerfile",
        }
    }

    /// Whether the strategy runs a compose project rather than one container
    pub fn is_compose(&self) -> bool {
        matches!(
            self,
            DockerStrategy::UserCompose { .. } | DockerStrategy::AutoCompose
        )
    }

    /// Whether the strategy synthesizes files into the release
    pub fn is_generated(&self) -> bool {
        matches!(self, DockerStrategy::AutoCompose | DockerStrategy::AutoDockerfile)
    }
}

impl fmt::Display for DockerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the container-build strategy for a release; first match wins:
/// user compose file, user Dockerfile, declared dependencies, generated
/// Dockerfile.
pub async fn detect_docker_strategy(release_dir: &Dir, config: &DeployConfig) -> DockerStrategy {
    let strategy = if let Some(file) = release_dir.find_first(&COMPOSE_FILES).await {
        let compose_file = file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| COMPOSE_FILES[0].to_string());
        DockerStrategy::UserCompose { compose_file }
    } else if release_dir.file(DOCKERFILE).is_file().await {
        DockerStrategy::UserDockerfile
    } else if config.has_dependencies() {
        DockerStrategy::AutoCompose
    } else {
        DockerStrategy::AutoDockerfile
    };
    debug!("Detected docker strategy {} for {}", strategy, release_dir.path().display());
    strategy
}

/// Whether the release ships its own container files
pub async fn has_user_container_files(release_dir: &Dir) -> bool {
    release_dir.find_first(&COMPOSE_FILES).await.is_some()
        || release_dir.file(DOCKERFILE).is_file().await
}

/// Marker files per runtime, checked in order
const RUNTIME_MARKERS: [(Runtime, &[&str]); 9] = [
    (Runtime::Bun, &["bun.lockb", "bun.lock", "bunfig.toml"]),
    (Runtime::Deno, &["deno.json", "deno.jsonc"]),
    (Runtime::Node, &["package.json"]),
    (
        Runtime::Python,
        &["requirements.txt", "pyproject.toml", "Pipfile", "setup.py"],
    ),
    (Runtime::Go, &["go.mod"]),
    (Runtime::Rust, &["Cargo.toml"]),
    (Runtime::Ruby, &["Gemfile"]),
    (Runtime::Php, &["composer.json"]),
    (Runtime::Java, &["pom.xml", "build.gradle", "build.gradle.kts"]),
];

/// Detect the runtime from marker files in the release
pub async fn detect_runtime(release_dir: &Dir) -> Result<Runtime, ShipError> {
    for (runtime, markers) in RUNTIME_MARKERS.iter() {
        if release_dir.find_first(markers).await.is_some() {
            debug!("Detected runtime {} for {}", runtime, release_dir.path().display());
            return Ok(*runtime);
        }
    }
    Err(ShipError::ConfigError(format!(
        "Could not detect a runtime in {}. Declare `runtime` in deploy.yml. Supported runtimes: {}",
        release_dir.path().display(),
        Runtime::supported_list()
    )))
}
