//! Orchestrator state and entry points

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::locks::KeyedLocks;
use crate::app::options::OrchestratorOptions;
use crate::deploy::git::GitFetcher;
use crate::deploy::hooks::{CredentialResolver, NoCredentials, NoProxy, ProxyRegenerator, SourceFetcher};
use crate::deploy::image::{self, ImageDeployment};
use crate::deploy::pipeline::{
    self, stop_app_containers, DeployContext, DeployOptions, DeployResult, ReleaseMode,
};
use crate::deploy::ports::{PortProbe, SystemPortProbe};
use crate::deploy::rollback;
use crate::engine::docker::{ContainerSummary, EngineGateway, APP_LABEL, COMPOSE_PROJECT_LABEL};
use crate::engine::runner::{CommandRunner, TokioCommandRunner};
use crate::errors::ShipError;
use crate::models::app::ImageSettings;
use crate::models::release::ReleaseStatus;
use crate::storage::versions::{CreatedVersion, VersionStore, VersionsView};
use crate::stream::cancel::CancellationRegistry;
use crate::stream::logs::{DeploymentLog, LogLine, LogStreams};
use crate::utils::{generate_uuid, is_valid_app_name};
use crate::workers::janitor;

/// External collaborators, replaceable in tests
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub proxy: Arc<dyn ProxyRegenerator>,
    pub ports: Arc<dyn PortProbe>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        Self {
            fetcher: Arc::new(GitFetcher::new(runner.clone())),
            runner,
            credentials: Arc::new(NoCredentials),
            proxy: Arc::new(NoProxy),
            ports: Arc::new(SystemPortProbe),
        }
    }
}

/// The deployment orchestrator.
///
/// Deployments of one application are serialized by a per-application
/// lock held for the whole pipeline; different applications run
/// concurrently.
pub struct Orchestrator {
    ctx: DeployContext,
    fetcher: Arc<dyn SourceFetcher>,
    pipelines: KeyedLocks,
    janitor: janitor::Options,
}

impl Orchestrator {
    pub fn new(options: OrchestratorOptions, collaborators: Collaborators) -> Self {
        let gateway = Arc::new(EngineGateway::new(collaborators.runner.clone(), &options.engine));
        let streams = Arc::new(LogStreams::new(
            options.layout.deployment_logs_dir(),
            options.stream_capacity,
        ));
        let ctx = DeployContext {
            store: Arc::new(VersionStore::new(options.layout.clone())),
            gateway,
            streams,
            cancels: Arc::new(CancellationRegistry::new()),
            credentials: collaborators.credentials,
            proxy: collaborators.proxy,
            ports: collaborators.ports,
            options: options.pipeline,
        };
        Self {
            ctx,
            fetcher: collaborators.fetcher,
            pipelines: KeyedLocks::new(),
            janitor: options.janitor,
        }
    }

    /// Create the storage directories and build the orchestrator
    pub async fn init(options: OrchestratorOptions, collaborators: Collaborators) -> Result<Self, ShipError> {
        options.layout.setup().await?;
        info!("Orchestrator storage at {}", options.layout.apps_dir.display());
        Ok(Self::new(options, collaborators))
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        &self.ctx.store
    }

    pub fn gateway(&self) -> &Arc<EngineGateway> {
        &self.ctx.gateway
    }

    pub fn streams(&self) -> &Arc<LogStreams> {
        &self.ctx.streams
    }

    pub fn cancels(&self) -> &Arc<CancellationRegistry> {
        &self.ctx.cancels
    }

    /// Whether a pipeline currently runs for `app`
    pub fn is_deploying(&self, app: &str) -> bool {
        self.pipelines.is_locked(app)
    }

    /// Reserve a deployment id so callers can subscribe before starting
    pub fn new_deployment_id(&self) -> String {
        let id = generate_uuid();
        self.ctx.streams.open(&id);
        self.ctx.cancels.register(&id);
        id
    }

    // =============================== DEPLOYMENTS ================================== //

    /// Allocate a release for `app` (registering the app on first use)
    pub async fn create_version(&self, app: &str, commit: &str, branch: &str) -> Result<CreatedVersion, ShipError> {
        self.ctx.store.create_version(app, commit, branch).await
    }

    /// Deploy a prepared release directory.
    ///
    /// Only `pending` releases from [`create_version`](Self::create_version)
    /// are accepted; earlier releases go through [`rollback`](Self::rollback).
    pub async fn deploy(
        &self,
        app: &str,
        release_dir: &Path,
        version_id: u64,
        options: DeployOptions,
    ) -> DeployResult {
        let _guard = self.pipelines.lock(app).await;
        if let Err(e) = self.check_fresh_release(app, release_dir, version_id).await {
            warn!(app, version = version_id, "Deployment rejected: {}", e);
            let id = options.deployment_id.unwrap_or_else(generate_uuid);
            let mut result = DeployResult::rejected(app, &id, &e);
            result.version_id = Some(version_id);
            return result;
        }
        pipeline::deploy(&self.ctx, app, release_dir, version_id, options, ReleaseMode::Fresh).await
    }

    async fn check_fresh_release(&self, app: &str, release_dir: &Path, version_id: u64) -> Result<(), ShipError> {
        let metadata = self.ctx.store.load(app).await?;
        let release = metadata
            .version(version_id)
            .ok_or_else(|| ShipError::NotFound(format!("Version {} of '{}' not found", version_id, app)))?;
        if release.status != ReleaseStatus::Pending {
            return Err(ShipError::ValidationError(format!(
                "Version {} of '{}' is {}, only pending releases can be deployed; use rollback",
                version_id,
                app,
                release.status.as_str()
            )));
        }

        let expected = self.ctx.store.app_layout(app).release_dir(version_id);
        let same_dir = expected.path() == release_dir
            || match (
                tokio::fs::canonicalize(expected.path()).await,
                tokio::fs::canonicalize(release_dir).await,
            ) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
        if !same_dir {
            return Err(ShipError::ValidationError(format!(
                "{} is not the release directory of version {} of '{}'",
                release_dir.display(),
                version_id,
                app
            )));
        }
        Ok(())
    }

    /// Fetch `branch` of `remote` into a new release and deploy it
    pub async fn deploy_from_source(
        &self,
        app: &str,
        remote: &str,
        branch: &str,
        options: DeployOptions,
    ) -> DeployResult {
        let started = Instant::now();
        let deployment_id = match options.resolve_deployment_id() {
            Ok(id) => id,
            Err(e) => return DeployResult::rejected(app, options.deployment_id.as_deref().unwrap_or_default(), &e),
        };
        let options = DeployOptions {
            deployment_id: Some(deployment_id.clone()),
            git_remote: Some(remote.to_string()),
            ..options
        };

        let _guard = self.pipelines.lock(app).await;
        let created = match self.ctx.store.create_version(app, "", branch).await {
            Ok(created) => created,
            Err(e) => return DeployResult::rejected(app, &deployment_id, &e),
        };

        self.ctx.cancels.begin(&deployment_id);
        let log = DeploymentLog::new(self.ctx.streams.clone(), &deployment_id, app);
        log.info(format!("Fetching {} ({})", remote, branch)).await;
        let fetched = match self.fetcher.fetch(remote, branch, &created.release_dir).await {
            Ok(fetched) => fetched,
            Err(e) => {
                log.error(format!("Source fetch failed: {}", e)).await;
                self.discard_version(app, created.id, &e).await;
                log.finish();
                self.ctx.cancels.unregister(&deployment_id);
                let mut result = DeployResult::rejected(app, &deployment_id, &e);
                result.version_id = Some(created.id);
                result.duration = started.elapsed();
                return result;
            }
        };

        let version_id = created.id;
        let commit = fetched.commit.clone();
        if let Err(e) = self
            .ctx
            .store
            .update(app, |metadata| {
                if let Some(release) = metadata.version_mut(version_id) {
                    release.commit = commit;
                }
                Ok(())
            })
            .await
        {
            warn!(app, version = version_id, "Could not record commit: {}", e);
        }
        log.info(format!("Fetched commit {}", fetched.commit)).await;

        pipeline::deploy(
            &self.ctx,
            app,
            &created.release_dir,
            version_id,
            options,
            ReleaseMode::Fresh,
        )
        .await
    }

    async fn discard_version(&self, app: &str, id: u64, cause: &ShipError) {
        let store = &self.ctx.store;
        let _ = store
            .update_version_status(app, id, ReleaseStatus::Failed, Some(cause.to_string()))
            .await;
        if let Err(e) = store.remove_version(app, id).await {
            warn!(app, version = id, "Could not remove release: {}", e);
        }
    }

    /// Roll back to `target` (release id, commit prefix, digest or image
    /// ref), or to the previous release
    pub async fn rollback(&self, app: &str, target: Option<&str>, options: DeployOptions) -> DeployResult {
        let _guard = self.pipelines.lock(app).await;
        rollback::rollback(&self.ctx, app, target, options).await
    }

    /// Run a pre-built image as the new release of `app`
    pub async fn update_from_image(&self, app: &str, image: ImageSettings, options: DeployOptions) -> DeployResult {
        if !is_valid_app_name(app) {
            let e = ShipError::ValidationError(format!("Invalid application name '{}'", app));
            let id = options.deployment_id.unwrap_or_else(generate_uuid);
            return DeployResult::rejected(app, &id, &e);
        }
        let _guard = self.pipelines.lock(app).await;
        image::update_from_image(&self.ctx, app, ImageDeployment::new(image), options).await
    }

    pub async fn list_versions(&self, app: &str) -> Result<VersionsView, ShipError> {
        self.ctx.store.list_versions(app).await
    }

    // ================================ STREAMS ===================================== //

    /// Progress lines of a running deployment
    pub fn subscribe(&self, deployment_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        self.ctx.streams.subscribe(deployment_id)
    }

    pub fn subscribe_stream(&self, deployment_id: &str) -> Option<impl Stream<Item = LogLine>> {
        self.ctx.streams.subscribe_stream(deployment_id)
    }

    /// Full durable log of a deployment, running or finished
    pub async fn deployment_log(&self, deployment_id: &str) -> Result<String, ShipError> {
        self.ctx.streams.read_log(deployment_id).await
    }

    /// Request cancellation; returns false when the id is unknown
    pub fn cancel(&self, deployment_id: &str) -> bool {
        self.ctx.cancels.cancel(deployment_id)
    }

    // ============================== APPLICATIONS ================================== //

    /// Stop everything of `app` and delete its releases and metadata
    pub async fn delete_app(&self, app: &str) -> Result<(), ShipError> {
        self.ctx.store.load(app).await?;
        let _guard = self.pipelines.lock(app).await;
        stop_app_containers(&self.ctx.gateway, app).await;
        self.ctx.store.delete_app(app).await?;
        if let Err(e) = self.ctx.proxy.regenerate(app).await {
            warn!(app, "Proxy regeneration after delete failed: {}", e);
        }
        info!(app, "Application deleted");
        Ok(())
    }

    /// Containers belonging to `app`, standalone or compose
    pub async fn app_status(&self, app: &str) -> Result<Vec<ContainerSummary>, ShipError> {
        self.ctx.store.load(app).await?;
        let gateway = &self.ctx.gateway;
        let mut containers = gateway
            .list_containers(&[format!("label={}={}", APP_LABEL, app)])
            .await?;
        for container in gateway
            .list_containers(&[format!("label={}={}", COMPOSE_PROJECT_LABEL, app)])
            .await?
        {
            if !containers.iter().any(|c| c.name == container.name) {
                containers.push(container);
            }
        }
        Ok(containers)
    }

    pub async fn restart_app(&self, app: &str) -> Result<(), ShipError> {
        let containers = self.app_status(app).await?;
        if containers.is_empty() {
            return Err(ShipError::NotFound(format!("'{}' has no containers", app)));
        }
        for container in &containers {
            self.ctx.gateway.restart(&container.name).await?;
        }
        info!(app, count = containers.len(), "Restarted containers");
        Ok(())
    }

    /// Last `lines` log lines of each container of `app`
    pub async fn app_logs(&self, app: &str, lines: usize) -> Result<String, ShipError> {
        let containers = self.app_status(app).await?;
        let mut output = String::new();
        for container in &containers {
            let logs = self.ctx.gateway.logs(&container.name, lines).await?;
            if containers.len() > 1 {
                output.push_str(&format!("==> {} <==\n", container.name));
            }
            output.push_str(&logs);
        }
        Ok(output)
    }

    // ================================ WORKERS ===================================== //

    /// Start the janitor sweeping idle streams and cancellation entries
    pub fn spawn_janitor(&self, shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>) -> JoinHandle<()> {
        let options = self.janitor.clone();
        let streams = self.ctx.streams.clone();
        let cancels = self.ctx.cancels.clone();
        tokio::spawn(async move {
            janitor::run(
                &options,
                streams.as_ref(),
                cancels.as_ref(),
                tokio::time::sleep,
                shutdown_signal,
            )
            .await;
        })
    }
}
