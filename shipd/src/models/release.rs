//! Release models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a git-strategy release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    /// Created, no work started
    Pending,

    /// Image or compose project being built
    Building,

    /// Containers being replaced and health-checked
    Deploying,

    /// Live release behind the `current` pointer
    Active,

    /// Previously active, superseded by a newer release
    Success,

    /// Terminal failure
    Failed,
}

impl ReleaseStatus {
    /// Whether a release in this status can be served again (rollback target)
    pub fn is_deployable(&self) -> bool {
        matches!(self, ReleaseStatus::Active | ReleaseStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Building => "building",
            ReleaseStatus::Deploying => "deploying",
            ReleaseStatus::Active => "active",
            ReleaseStatus::Success => "success",
            ReleaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One git-strategy deployment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Monotonic per-application id
    pub id: u64,

    /// Commit the release was built from
    pub commit: String,

    /// Branch or ref the commit was fetched from
    pub branch: String,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    pub status: ReleaseStatus,

    /// Last status message (failure reason, etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Release {
    /// Directory name of this release under `releases/`
    pub fn dir_name(&self) -> String {
        release_dir_name(self.id)
    }
}

pub fn release_dir_name(id: u64) -> String {
    format!("v{}", id)
}

/// When to pull an image before running it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    #[default]
    Always,
    IfNotPresent,
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullPolicy::Always => f.write_str("always"),
            PullPolicy::IfNotPresent => f.write_str("if-not-present"),
        }
    }
}

/// Registry flavour; decides how login material is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryProvider {
    Ecr,
    Ghcr,
    DockerHub,
    Generic,
}

/// One image-strategy deployment, appended after a verified run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRelease {
    pub id: u64,
    pub deployed_at: DateTime<Utc>,

    /// Normalized image reference
    pub image_ref: String,

    /// Resolved `sha256:` digest, when the engine reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,

    pub container_port: u16,
    pub host_port: u16,
    pub pull_policy: PullPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_credential_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_server: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_provider: Option<RegistryProvider>,
}

impl ImageRelease {
    /// Reference pinned to the captured digest when available
    pub fn pinned_ref(&self) -> String {
        match &self.image_digest {
            Some(digest) => format!("{}@{}", repository_of(&self.image_ref), digest),
            None => self.image_ref.clone(),
        }
    }
}

/// Strip the tag or digest from an image reference
pub fn repository_of(image_ref: &str) -> &str {
    let without_digest = image_ref.split('@').next().unwrap_or(image_ref);
    // A ':' after the last '/' is a tag, before it a registry port
    match without_digest.rfind(':') {
        Some(idx) if !without_digest[idx..].contains('/') => &without_digest[..idx],
        _ => without_digest,
    }
}
