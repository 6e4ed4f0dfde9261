//! Rollback to an earlier release by full redeploy

use tracing::info;

use crate::deploy::image::{select_image_rollback_target, update_from_image, ImageDeployment};
use crate::deploy::pipeline::{deploy, DeployContext, DeployOptions, DeployResult, ReleaseMode};
use crate::deploy::strategy::{resolve_deploy_strategy, DeployStrategy};
use crate::errors::ShipError;
use crate::models::app::{AppMetadata, ImageSettings};
use crate::models::release::{ImageRelease, PullPolicy, Release};

/// Find the git release to roll back to.
///
/// `target` is a release id or a commit prefix. Without one, the newest
/// deployable release older than the current one is used.
pub fn find_git_target<'a>(metadata: &'a AppMetadata, target: Option<&str>) -> Result<&'a Release, ShipError> {
    let current = metadata.current_version_id;

    let release = match target.map(str::trim).filter(|t| !t.is_empty()) {
        Some(target) => {
            let by_id = target
                .trim_start_matches('v')
                .parse::<u64>()
                .ok()
                .and_then(|id| metadata.version(id));
            by_id
                .or_else(|| {
                    metadata
                        .versions
                        .iter()
                        .rev()
                        .find(|v| !v.commit.is_empty() && v.commit.starts_with(target))
                })
                .ok_or_else(|| {
                    ShipError::RollbackError(format!(
                        "No release of '{}' matches '{}'",
                        metadata.name, target
                    ))
                })?
        }
        None => metadata
            .versions
            .iter()
            .rev()
            .filter(|v| Some(v.id) != current && v.status.is_deployable())
            .find(|v| current.map_or(true, |c| v.id < c))
            .ok_or_else(|| {
                ShipError::RollbackError(format!(
                    "'{}' has no earlier successful release to roll back to",
                    metadata.name
                ))
            })?,
    };

    if Some(release.id) == current {
        return Err(ShipError::RollbackError(format!(
            "v{} is already the current release of '{}'",
            release.id, metadata.name
        )));
    }
    if !release.status.is_deployable() {
        return Err(ShipError::RollbackError(format!(
            "v{} has status {} and cannot be rolled back to",
            release.id, release.status
        )));
    }
    Ok(release)
}

/// Find the image release to roll back to
pub fn find_image_target<'a>(
    metadata: &'a AppMetadata,
    target: Option<&str>,
) -> Result<&'a ImageRelease, ShipError> {
    let release = select_image_rollback_target(&metadata.image_releases, target).ok_or_else(|| {
        ShipError::RollbackError(match target {
            Some(target) => format!("No image release of '{}' matches '{}'", metadata.name, target),
            None => format!("'{}' has no previous image release", metadata.name),
        })
    })?;
    if Some(release.id) == metadata.current_image_release_id {
        return Err(ShipError::RollbackError(format!(
            "Image release {} is already current for '{}'",
            release.id, metadata.name
        )));
    }
    Ok(release)
}

/// Settings that re-run an image release, pinned to its digest and always
/// pulled
pub fn image_rollback_request(release: &ImageRelease) -> ImageDeployment {
    ImageDeployment {
        image: ImageSettings {
            image_ref: release.image_ref.clone(),
            container_port: Some(release.container_port),
            host_port: Some(release.host_port),
            pull_policy: PullPolicy::Always,
            registry_credential_id: release.registry_credential_id.clone(),
        },
        run_ref: Some(release.pinned_ref()),
    }
}

/// Roll `app` back. Target selection errors are reported before any
/// container is touched.
///
/// The caller holds the application's pipeline lock.
pub async fn rollback(
    ctx: &DeployContext,
    app: &str,
    target: Option<&str>,
    options: DeployOptions,
) -> DeployResult {
    let deployment_id = match options.resolve_deployment_id() {
        Ok(id) => id,
        Err(e) => return DeployResult::rejected(app, options.deployment_id.as_deref().unwrap_or_default(), &e),
    };
    let options = DeployOptions {
        deployment_id: Some(deployment_id.clone()),
        ..options
    };

    let metadata = match ctx.store.load(app).await {
        Ok(metadata) => metadata,
        Err(e) => return DeployResult::rejected(app, &deployment_id, &e),
    };

    match resolve_deploy_strategy(&metadata) {
        DeployStrategy::Git => {
            let release = match find_git_target(&metadata, target) {
                Ok(release) => release,
                Err(e) => return DeployResult::rejected(app, &deployment_id, &e),
            };
            let release_dir = ctx.store.app_layout(app).release_dir(release.id);
            if !release_dir.exists().await {
                let e = ShipError::RollbackError(format!(
                    "Release directory of v{} is missing",
                    release.id
                ));
                return DeployResult::rejected(app, &deployment_id, &e);
            }
            info!(app, version = release.id, "Rolling back");
            deploy(
                ctx,
                app,
                release_dir.path(),
                release.id,
                options,
                ReleaseMode::Redeploy,
            )
            .await
        }
        DeployStrategy::Image => {
            let request = match find_image_target(&metadata, target) {
                Ok(release) => {
                    info!(app, image_release = release.id, "Rolling back image");
                    image_rollback_request(release)
                }
                Err(e) => return DeployResult::rejected(app, &deployment_id, &e),
            };
            update_from_image(ctx, app, request, options).await
        }
    }
}
