//! Git-strategy deployment pipeline
//!
//! One call turns a prepared release directory into the live release:
//!
//! 1. load `deploy.yml` and validate it
//! 2. check the host port
//! 3. detect the runtime and the container strategy
//! 4. generate missing container files, build, replace the running
//!    container or compose project
//! 5. wait for it to run, then switch `current` and persist metadata
//!
//! Any failure runs the same cleanup; cancellation is checked at fixed
//! checkpoints and reported separately.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::deploy::artifacts::{required_secrets, write_artifacts, GENERATED_COMPOSE, GENERATED_DOCKERFILE};
use crate::deploy::hooks::{CredentialResolver, ProxyRegenerator};
use crate::deploy::ports::{check_port_conflict, PortProbe};
use crate::deploy::strategy::{detect_docker_strategy, detect_runtime, has_user_container_files, DockerStrategy};
use crate::engine::docker::{EngineGateway, RunSpec, APP_LABEL};
use crate::engine::health::{wait_for_healthy, HealthOptions, HealthTarget};
use crate::errors::ShipError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::config::{DeployConfig, Runtime};
use crate::models::release::ReleaseStatus;
use crate::storage::versions::VersionStore;
use crate::stream::cancel::CancellationRegistry;
use crate::stream::logs::{DeploymentLog, LogStreams};
use crate::utils::{generate_secret, generate_uuid, is_valid_deployment_id};

/// Release config file names, first found wins
pub const CONFIG_FILES: [&str; 2] = ["deploy.yml", "deploy.yaml"];

/// Tunables shared by both pipelines
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub health: HealthOptions,
    pub keep_versions: usize,
    pub keep_image_releases: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            health: HealthOptions::default(),
            keep_versions: 5,
            keep_image_releases: 10,
        }
    }
}

/// Everything a deployment needs, injected by the orchestrator
#[derive(Clone)]
pub struct DeployContext {
    pub store: Arc<VersionStore>,
    pub gateway: Arc<EngineGateway>,
    pub streams: Arc<LogStreams>,
    pub cancels: Arc<CancellationRegistry>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub proxy: Arc<dyn ProxyRegenerator>,
    pub ports: Arc<dyn PortProbe>,
    pub options: PipelineOptions,
}

/// Per-call deployment options
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Merged into `.env.production` before the container starts
    pub env: BTreeMap<String, String>,

    /// Caller-chosen id, so it can subscribe before the call; a uuid otherwise
    pub deployment_id: Option<String>,

    /// Recorded in metadata when the source came from a remote
    pub git_remote: Option<String>,
}

impl DeployOptions {
    /// The caller's deployment id when it is usable as a log file name,
    /// or a fresh uuid
    pub fn resolve_deployment_id(&self) -> Result<String, ShipError> {
        match &self.deployment_id {
            Some(id) if !is_valid_deployment_id(id) => Err(ShipError::ValidationError(format!(
                "Invalid deployment id '{}'",
                id
            ))),
            Some(id) => Ok(id.clone()),
            None => Ok(generate_uuid()),
        }
    }
}

/// Whether the release directory belongs to this attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// A new release: marked failed and removed when the attempt fails
    Fresh,
    /// An existing release (rollback): left untouched on failure
    Redeploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployStatus::Succeeded => f.write_str("succeeded"),
            DeployStatus::Failed => f.write_str("failed"),
            DeployStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of a deployment entry point
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub app: String,
    pub deployment_id: String,
    pub status: DeployStatus,
    pub message: String,
    pub version_id: Option<u64>,
    pub image_release_id: Option<u64>,
    pub duration: Duration,
}

impl DeployResult {
    pub fn is_success(&self) -> bool {
        self.status == DeployStatus::Succeeded
    }

    pub(crate) fn from_outcome(
        app: &str,
        deployment_id: &str,
        outcome: &Result<String, ShipError>,
        version_id: Option<u64>,
        image_release_id: Option<u64>,
        started: Instant,
    ) -> Self {
        let (status, message) = match outcome {
            Ok(message) => (DeployStatus::Succeeded, message.clone()),
            Err(ShipError::Cancelled) => (DeployStatus::Cancelled, "Deployment cancelled".to_string()),
            Err(e) => (DeployStatus::Failed, e.to_string()),
        };
        Self {
            app: app.to_string(),
            deployment_id: deployment_id.to_string(),
            status,
            message,
            version_id,
            image_release_id: if status == DeployStatus::Succeeded {
                image_release_id
            } else {
                None
            },
            duration: started.elapsed(),
        }
    }

    /// Failure before any deployment work started
    pub fn rejected(app: &str, deployment_id: &str, error: &ShipError) -> Self {
        Self {
            app: app.to_string(),
            deployment_id: deployment_id.to_string(),
            status: DeployStatus::Failed,
            message: error.to_string(),
            version_id: None,
            image_release_id: None,
            duration: Duration::ZERO,
        }
    }
}

/// Image tag of a git-strategy release
pub fn release_image_tag(app: &str, version_id: u64) -> String {
    format!("shipd/{}:v{}", app, version_id)
}

/// Load and validate the release config
pub async fn load_deploy_config(release_dir: &Dir) -> Result<DeployConfig, ShipError> {
    let file = release_dir.find_first(&CONFIG_FILES).await.ok_or_else(|| {
        ShipError::ConfigError(format!(
            "No {} found in {}",
            CONFIG_FILES[0],
            release_dir.path().display()
        ))
    })?;
    let config = DeployConfig::from_yaml(&file.read_string().await?)?;

    if config.start_command.is_none() && !has_user_container_files(release_dir).await {
        return Err(ShipError::ConfigError(
            "A start command is required when the release has no Dockerfile or compose file".to_string(),
        ));
    }
    Ok(config)
}

/// Whether `key` is a portable environment variable name
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check variables against what an `--env-file` can carry: one
/// `KEY=VALUE` line each, value taken verbatim
pub fn validate_env(env: &BTreeMap<String, String>) -> Result<(), ShipError> {
    for (key, value) in env {
        if !is_valid_env_key(key) {
            return Err(ShipError::ValidationError(format!(
                "Invalid environment variable name '{}'",
                key
            )));
        }
        if value.contains(['\n', '\r', '\0']) {
            return Err(ShipError::ValidationError(format!(
                "Value of environment variable '{}' must be a single line",
                key
            )));
        }
    }
    Ok(())
}

/// Parse `KEY=VALUE` lines the way the engine reads an env file: blanks
/// and comments skipped, values kept verbatim
pub fn parse_env(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(|line| line.trim_start().trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter_map(|(key, value)| {
            let key = key.strip_prefix("export ").unwrap_or(key).trim();
            if !is_valid_env_key(key) {
                warn!("Skipping invalid env file entry '{}'", key);
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn render_env(env: &BTreeMap<String, String>) -> Result<String, ShipError> {
    validate_env(env)?;
    Ok(env
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect())
}

/// Overlay `overrides` onto the env file (mode 0600).
///
/// Returns the file path when the file exists afterwards.
pub async fn merge_env_file(
    file: &File,
    overrides: &BTreeMap<String, String>,
) -> Result<Option<PathBuf>, ShipError> {
    let exists = file.exists().await;
    if overrides.is_empty() {
        return Ok(exists.then(|| file.path().to_path_buf()));
    }

    let mut env = if exists {
        parse_env(&file.read_string().await?)
    } else {
        BTreeMap::new()
    };
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    file.write_private(render_env(&env)?.as_bytes()).await?;
    debug!("Wrote {} variables to {}", env.len(), file.path().display());
    Ok(Some(file.path().to_path_buf()))
}

/// Log line for cancellation requests of a running deployment
pub(crate) fn watch_cancellation(cancels: &CancellationRegistry, log: &DeploymentLog) {
    let deployment_id = log.deployment_id().to_string();
    let log = log.clone();
    cancels.on_cancel(&deployment_id, move || {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                log.warn("Cancellation requested, stopping at the next checkpoint")
                    .await;
            });
        }
    });
}

/// Deploy the prepared release `version_id` of `app`.
///
/// The caller holds the application's pipeline lock. Never returns an
/// error: every failure is turned into a failed or cancelled result after
/// cleanup.
pub async fn deploy(
    ctx: &DeployContext,
    app: &str,
    release_dir: &Path,
    version_id: u64,
    options: DeployOptions,
    mode: ReleaseMode,
) -> DeployResult {
    let started = Instant::now();
    let deployment_id = match options.resolve_deployment_id() {
        Ok(id) => id,
        Err(e) => return DeployResult::rejected(app, options.deployment_id.as_deref().unwrap_or_default(), &e),
    };
    if let Err(e) = validate_env(&options.env) {
        return DeployResult::rejected(app, &deployment_id, &e);
    }
    ctx.cancels.begin(&deployment_id);
    let log = DeploymentLog::new(ctx.streams.clone(), &deployment_id, app);
    watch_cancellation(&ctx.cancels, &log);

    let mut run = GitRun {
        ctx,
        app,
        release_dir: Dir::new(release_dir),
        version_id,
        log: log.clone(),
        deployment_id: deployment_id.clone(),
        strategy: None,
        replaced: false,
    };

    log.info(format!("Deploying {} release v{}", app, version_id)).await;
    let outcome = run.execute(&options).await;

    if let Err(e) = &outcome {
        let branch = match ctx.store.load(app).await {
            Ok(metadata) => metadata
                .version(version_id)
                .map(|v| v.branch.clone())
                .unwrap_or_default(),
            Err(_) => String::new(),
        };
        if e.is_cancelled() {
            log.warn("Deployment cancelled, cleaning up").await;
        } else {
            error!(
                app,
                branch = %branch,
                version = version_id,
                duration_ms = started.elapsed().as_millis() as u64,
                "Deployment failed: {}",
                e
            );
            log.error(format!("Deployment failed: {}", e)).await;
        }
        run.cleanup(mode, e).await;
    }

    let result = DeployResult::from_outcome(app, &deployment_id, &outcome, Some(version_id), None, started);
    log.info(format!(
        "Deployment {} in {:.1}s",
        result.status,
        result.duration.as_secs_f64()
    ))
    .await;
    log.finish();
    ctx.cancels.unregister(&deployment_id);
    result
}

struct GitRun<'a> {
    ctx: &'a DeployContext,
    app: &'a str,
    release_dir: Dir,
    version_id: u64,
    log: DeploymentLog,
    deployment_id: String,
    strategy: Option<DockerStrategy>,
    /// Whether the previous containers were already taken down
    replaced: bool,
}

impl GitRun<'_> {
    fn checkpoint(&self) -> Result<(), ShipError> {
        self.ctx.cancels.checkpoint(&self.deployment_id)
    }

    async fn set_status(&self, status: ReleaseStatus) -> Result<(), ShipError> {
        let current = self
            .ctx
            .store
            .load(self.app)
            .await?
            .version(self.version_id)
            .map(|v| v.status)
            .ok_or_else(|| {
                ShipError::NotFound(format!("Version {} of '{}' not found", self.version_id, self.app))
            })?;
        // Redeploys of a finished release keep its status until it goes live
        if current.is_deployable() {
            return Ok(());
        }
        self.ctx
            .store
            .update_version_status(self.app, self.version_id, status, None)
            .await
    }

    async fn execute(&mut self, options: &DeployOptions) -> Result<String, ShipError> {
        let ctx = self.ctx;
        let app = self.app;

        let config = load_deploy_config(&self.release_dir).await?;
        self.log
            .info(format!("Loaded config: port {}", config.port))
            .await;

        let apps = ctx.store.list_apps().await?;
        check_port_conflict(app, config.port, &apps, &ctx.gateway, ctx.ports.as_ref()).await?;

        let strategy = detect_docker_strategy(&self.release_dir, &config).await;
        self.log.info(format!("Container strategy: {}", strategy)).await;

        let runtime: Option<Runtime> = match config.runtime {
            Some(runtime) => Some(runtime),
            None if strategy.is_generated() => Some(detect_runtime(&self.release_dir).await?),
            None => detect_runtime(&self.release_dir).await.ok(),
        };
        if let Some(runtime) = runtime {
            self.log.info(format!("Runtime: {}", runtime)).await;
        }

        self.set_status(ReleaseStatus::Building).await?;

        let env_file = merge_env_file(&ctx.store.app_layout(app).env_file(), &options.env).await?;

        if let (true, Some(runtime)) = (strategy.is_generated(), runtime) {
            let secrets = if strategy == DockerStrategy::AutoCompose {
                Some(self.ensure_secrets(&config).await?)
            } else {
                None
            };
            write_artifacts(
                &self.release_dir,
                runtime,
                &config,
                secrets.as_ref().map(|s| (s, env_file.as_deref())),
            )
            .await?;
            self.log.info("Generated container files").await;
        }

        self.checkpoint()?;
        let image_tag = release_image_tag(app, self.version_id);
        match &strategy {
            DockerStrategy::UserDockerfile => {
                self.log.info(format!("Building image {}", image_tag)).await;
                ctx.gateway.build(self.release_dir.path(), None, &image_tag).await?;
            }
            DockerStrategy::AutoDockerfile => {
                self.log.info(format!("Building image {}", image_tag)).await;
                ctx.gateway
                    .build(self.release_dir.path(), Some(GENERATED_DOCKERFILE), &image_tag)
                    .await?;
            }
            // Compose builds as part of `up`
            DockerStrategy::UserCompose { .. } | DockerStrategy::AutoCompose => {}
        }

        self.set_status(ReleaseStatus::Deploying).await?;
        self.checkpoint()?;

        self.log.info("Replacing running containers").await;
        self.strategy = Some(strategy.clone());
        self.replaced = true;
        stop_app_containers(&ctx.gateway, app).await;

        let target = match &strategy {
            DockerStrategy::UserCompose { compose_file } => {
                ctx.gateway
                    .compose_up(self.release_dir.path(), compose_file, app, env_file.as_deref())
                    .await?;
                HealthTarget::ComposeProject(app.to_string())
            }
            DockerStrategy::AutoCompose => {
                ctx.gateway
                    .compose_up(self.release_dir.path(), GENERATED_COMPOSE, app, env_file.as_deref())
                    .await?;
                HealthTarget::ComposeProject(app.to_string())
            }
            DockerStrategy::UserDockerfile | DockerStrategy::AutoDockerfile => {
                let spec = RunSpec {
                    name: app.to_string(),
                    image: image_tag.clone(),
                    ports: vec![(config.port, config.port)],
                    env_file: env_file.clone(),
                    env: vec![("PORT".to_string(), config.port.to_string())],
                    labels: vec![(APP_LABEL.to_string(), app.to_string())],
                    restart: Some("unless-stopped".to_string()),
                };
                ctx.gateway.run(&spec).await?;
                HealthTarget::Container(app.to_string())
            }
        };

        wait_for_healthy(&ctx.gateway, &target, ctx.options.health, &self.log).await?;
        self.checkpoint()?;

        if !ctx.store.set_current_version(app, self.version_id).await? {
            return Err(ShipError::Internal(format!(
                "Release v{} disappeared before it could go live",
                self.version_id
            )));
        }
        self.log.info(format!("v{} is now current", self.version_id)).await;

        self.persist_metadata(&config, runtime, options).await?;

        match ctx.store.clean_old_versions(app, ctx.options.keep_versions).await {
            Ok(removed) if !removed.is_empty() => {
                self.log
                    .info(format!("Removed {} old release(s)", removed.len()))
                    .await
            }
            Ok(_) => {}
            Err(e) => warn!(app, "Release retention failed: {}", e),
        }

        if let Err(e) = ctx.proxy.regenerate(app).await {
            self.log
                .warn(format!("Proxy regeneration failed: {}", e))
                .await;
        }

        Ok(format!("Deployed {} v{}", app, self.version_id))
    }

    /// Dependency passwords, generated once per application
    async fn ensure_secrets(&self, config: &DeployConfig) -> Result<BTreeMap<String, String>, ShipError> {
        let required = required_secrets(config);
        self.ctx
            .store
            .update(self.app, |metadata| {
                for name in required {
                    metadata
                        .generated_secrets
                        .entry(name.to_string())
                        .or_insert_with(generate_secret);
                }
                Ok(metadata.generated_secrets.clone())
            })
            .await
    }

    async fn persist_metadata(
        &self,
        config: &DeployConfig,
        runtime: Option<Runtime>,
        options: &DeployOptions,
    ) -> Result<(), ShipError> {
        let working_dir = self.ctx.store.app_layout(self.app).current_link().path().to_path_buf();
        let version_id = self.version_id;
        self.ctx
            .store
            .update(self.app, |metadata| {
                let branch = metadata
                    .version(version_id)
                    .map(|v| v.branch.clone())
                    .filter(|b| !b.is_empty());
                metadata.runtime = runtime;
                metadata.start_command = config.start_command.clone();
                metadata.working_dir = Some(working_dir);
                metadata.port = Some(config.port);
                metadata.domain = config.domain.clone();
                metadata.build_steps = config.build_steps.clone();
                if branch.is_some() {
                    metadata.git_branch = branch;
                }
                if options.git_remote.is_some() {
                    metadata.git_remote = options.git_remote.clone();
                }
                metadata.current_version_id = Some(version_id);
                // A git release takes over from an earlier image deployment
                metadata.deploy_strategy = None;
                Ok(())
            })
            .await
    }

    /// Best-effort cleanup after a failed or cancelled attempt
    async fn cleanup(&self, mode: ReleaseMode, cause: &ShipError) {
        let ctx = self.ctx;
        if self.replaced {
            stop_app_containers(&ctx.gateway, self.app).await;
        }

        if mode == ReleaseMode::Redeploy {
            return;
        }

        let message = if cause.is_cancelled() {
            "cancelled".to_string()
        } else {
            cause.to_string()
        };
        if let Err(e) = ctx
            .store
            .update_version_status(self.app, self.version_id, ReleaseStatus::Failed, Some(message))
            .await
        {
            debug!(app = self.app, "Could not mark v{} failed: {}", self.version_id, e);
        }
        match ctx.store.remove_version(self.app, self.version_id).await {
            Ok(()) => {
                self.log
                    .info(format!("Removed release v{}", self.version_id))
                    .await
            }
            Err(e) => warn!(app = self.app, "Could not remove v{}: {}", self.version_id, e),
        }
        if let Some(strategy) = &self.strategy {
            debug!(app = self.app, %strategy, "Cleanup finished");
        }
    }
}

/// Stop and remove the application's container and compose project
pub async fn stop_app_containers(gateway: &EngineGateway, app: &str) {
    gateway.stop_and_remove(app).await;
    if let Err(e) = gateway.compose_down(app).await {
        debug!("compose down {} skipped: {}", app, e);
    }
    info!("Stopped previous containers of {}", app);
}
