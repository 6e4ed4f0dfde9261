//! Image-strategy deployments: run a pre-built image, no build step

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::deploy::pipeline::{
    merge_env_file, stop_app_containers, validate_env, watch_cancellation, DeployContext, DeployOptions,
    DeployResult,
};
use crate::deploy::ports::check_port_conflict;
use crate::deploy::registry::login_material;
use crate::engine::docker::{RunSpec, APP_LABEL};
use crate::engine::health::{wait_for_healthy, HealthTarget};
use crate::errors::ShipError;
use crate::models::app::ImageSettings;
use crate::models::release::{repository_of, ImageRelease, PullPolicy, RegistryProvider};
use crate::stream::logs::DeploymentLog;

/// Lower-case the repository part of an image reference, keeping the tag
/// or digest as given
pub fn normalize_image_ref(image_ref: &str) -> Result<String, ShipError> {
    let image_ref = image_ref.trim();
    if image_ref.is_empty() || image_ref.chars().any(char::is_whitespace) {
        return Err(ShipError::ValidationError(format!(
            "Invalid image reference '{}'",
            image_ref
        )));
    }
    let repository = repository_of(image_ref);
    if repository.is_empty() {
        return Err(ShipError::ValidationError(format!(
            "Image reference '{}' has no repository",
            image_ref
        )));
    }
    Ok(format!(
        "{}{}",
        repository.to_lowercase(),
        &image_ref[repository.len()..]
    ))
}

/// Keep the newest `keep` releases; returns the pruned ones
pub fn prune_image_releases(releases: &mut Vec<ImageRelease>, keep: usize) -> Vec<ImageRelease> {
    releases.sort_by_key(|r| r.id);
    let excess = releases.len().saturating_sub(keep);
    releases.drain(..excess).collect()
}

/// Pick the image release to roll back to.
///
/// With a target: the newest release whose digest matches, else whose
/// image reference matches exactly, else whose id matches. Without one:
/// the release before the newest.
pub fn select_image_rollback_target<'a>(
    releases: &'a [ImageRelease],
    target: Option<&str>,
) -> Option<&'a ImageRelease> {
    let Some(target) = target.map(str::trim) else {
        return releases.len().checked_sub(2).map(|idx| &releases[idx]);
    };

    let digest_matches = |r: &&ImageRelease| {
        r.image_digest.as_deref().is_some_and(|digest| {
            digest == target || digest.strip_prefix("sha256:") == Some(target)
        })
    };
    releases
        .iter()
        .rev()
        .find(digest_matches)
        .or_else(|| releases.iter().rev().find(|r| r.image_ref == target))
        .or_else(|| {
            target
                .parse::<u64>()
                .ok()
                .and_then(|id| releases.iter().find(|r| r.id == id))
        })
}

/// An image deployment request
#[derive(Debug, Clone)]
pub struct ImageDeployment {
    pub image: ImageSettings,

    /// Reference to pull and run instead of `image.image_ref`, e.g. a
    /// digest-pinned rollback target
    pub run_ref: Option<String>,
}

impl ImageDeployment {
    pub fn new(image: ImageSettings) -> Self {
        Self { image, run_ref: None }
    }
}

/// Run `request` as the new live container of `app`.
///
/// The caller holds the application's pipeline lock. History is only
/// touched after the container runs.
pub async fn update_from_image(
    ctx: &DeployContext,
    app: &str,
    request: ImageDeployment,
    options: DeployOptions,
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

    let mut run = ImageRun {
        ctx,
        app,
        log: log.clone(),
        deployment_id: deployment_id.clone(),
        logged_in: None,
        replaced: false,
    };

    log.info(format!("Deploying {} from image {}", app, request.image.image_ref))
        .await;
    let outcome = run.execute(request, &options.env).await;

    let release_id = match &outcome {
        Ok((_, id)) => Some(*id),
        Err(e) => {
            if e.is_cancelled() {
                log.warn("Deployment cancelled, cleaning up").await;
            } else {
                error!(
                    app,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Image deployment failed: {}",
                    e
                );
                log.error(format!("Deployment failed: {}", e)).await;
            }
            run.cleanup().await;
            None
        }
    };

    let outcome = outcome.map(|(message, _)| message);
    let result = DeployResult::from_outcome(app, &deployment_id, &outcome, None, release_id, started);
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

struct ImageRun<'a> {
    ctx: &'a DeployContext,
    app: &'a str,
    log: DeploymentLog,
    deployment_id: String,
    /// Registry server to log out of on failure
    logged_in: Option<String>,
    replaced: bool,
}

impl ImageRun<'_> {
    async fn execute(
        &mut self,
        request: ImageDeployment,
        env: &BTreeMap<String, String>,
    ) -> Result<(String, u64), ShipError> {
        let ctx = self.ctx;
        let app = self.app;

        let mut settings = request.image;
        let Some((host_port, container_port)) = settings.ports() else {
            return Err(ShipError::ConfigError(format!(
                "Image deployment of '{}' needs a container or host port",
                app
            )));
        };
        settings.image_ref = normalize_image_ref(&settings.image_ref)?;
        let run_ref = match &request.run_ref {
            Some(pinned) => normalize_image_ref(pinned)?,
            None => settings.image_ref.clone(),
        };

        let apps = ctx.store.list_apps().await?;
        check_port_conflict(app, host_port, &apps, &ctx.gateway, ctx.ports.as_ref()).await?;

        let mut registry = None;
        if let Some(credential_id) = &settings.registry_credential_id {
            let credential = ctx.credentials.resolve(credential_id).await?;
            let provider = credential.provider;
            let login = login_material(&ctx.gateway.runner(), credential).await?;
            self.log.info(format!("Logging in to {}", login.server)).await;
            ctx.gateway
                .login(&login.server, &login.username, login.password)
                .await?;
            self.logged_in = Some(login.server.clone());
            registry = Some((login.server, provider));
        }

        self.checkpoint()?;
        match settings.pull_policy {
            PullPolicy::Always => {
                self.log.info(format!("Pulling {}", run_ref)).await;
                ctx.gateway.pull(&run_ref).await?;
            }
            PullPolicy::IfNotPresent => {
                if ctx.gateway.image_exists(&run_ref).await? {
                    self.log.info(format!("Using local image {}", run_ref)).await;
                } else {
                    self.log.info(format!("Pulling {}", run_ref)).await;
                    ctx.gateway.pull(&run_ref).await?;
                }
            }
        }

        self.checkpoint()?;
        let env_file = merge_env_file(&ctx.store.app_layout(app).env_file(), env).await?;

        self.log.info("Replacing running containers").await;
        self.replaced = true;
        stop_app_containers(&ctx.gateway, app).await;

        let spec = RunSpec {
            name: app.to_string(),
            image: run_ref.clone(),
            ports: vec![(host_port, container_port)],
            env_file,
            env: vec![("PORT".to_string(), container_port.to_string())],
            labels: vec![(APP_LABEL.to_string(), app.to_string())],
            restart: Some("unless-stopped".to_string()),
        };
        ctx.gateway.run(&spec).await?;

        wait_for_healthy(
            &ctx.gateway,
            &HealthTarget::Container(app.to_string()),
            ctx.options.health,
            &self.log,
        )
        .await?;

        let image_digest = match ctx.gateway.inspect_digest(&run_ref).await {
            Ok(digest) => digest,
            Err(e) => {
                debug!("Digest lookup for {} failed: {}", run_ref, e);
                None
            }
        };
        if let Some(digest) = &image_digest {
            self.log.info(format!("Image digest {}", digest)).await;
        }

        let keep = ctx.options.keep_image_releases;
        let (registry_server, registry_provider): (Option<String>, Option<RegistryProvider>) =
            match registry {
                Some((server, provider)) => (Some(server), Some(provider)),
                None => (None, None),
            };
        let (release_id, pruned) = ctx
            .store
            .update(app, |metadata| {
                let id = metadata.next_image_release_id();
                metadata.image_releases.push(ImageRelease {
                    id,
                    deployed_at: Utc::now(),
                    image_ref: settings.image_ref.clone(),
                    image_digest,
                    container_port,
                    host_port,
                    pull_policy: settings.pull_policy,
                    registry_credential_id: settings.registry_credential_id.clone(),
                    registry_server,
                    registry_provider,
                });
                metadata.last_image_release_id = id;
                metadata.current_image_release_id = Some(id);
                let pruned = prune_image_releases(&mut metadata.image_releases, keep);
                metadata.deploy_strategy = Some("image".to_string());
                metadata.image = Some(settings);
                Ok((id, pruned.len()))
            })
            .await?;
        if pruned > 0 {
            self.log
                .info(format!("Pruned {} old image release(s)", pruned))
                .await;
        }

        if let Err(e) = ctx.proxy.regenerate(app).await {
            self.log
                .warn(format!("Proxy regeneration failed: {}", e))
                .await;
        }

        Ok((format!("Deployed {} image release {}", app, release_id), release_id))
    }

    fn checkpoint(&self) -> Result<(), ShipError> {
        self.ctx.cancels.checkpoint(&self.deployment_id)
    }

    async fn cleanup(&self) {
        if self.replaced {
            self.ctx.gateway.stop_and_remove(self.app).await;
        }
        if let Some(server) = &self.logged_in {
            if let Err(e) = self.ctx.gateway.logout(server).await {
                warn!("Logout from {} failed: {}", server, e);
            }
        }
    }
}
