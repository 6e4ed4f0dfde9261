//! Application metadata persisted as `app.json`

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::config::Runtime;
use crate::models::release::{ImageRelease, PullPolicy, Release};

/// Image-strategy settings for an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSettings {
    /// Image reference as declared by the operator
    pub image_ref: String,

    /// Port the process listens on inside the container
    #[serde(default)]
    pub container_port: Option<u16>,

    /// Port published on the host
    #[serde(default)]
    pub host_port: Option<u16>,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Opaque id resolved through the credential resolver
    #[serde(default)]
    pub registry_credential_id: Option<String>,
}

impl ImageSettings {
    pub fn new(image_ref: impl Into<String>, port: u16) -> Self {
        Self {
            image_ref: image_ref.into(),
            container_port: Some(port),
            host_port: Some(port),
            pull_policy: PullPolicy::default(),
            registry_credential_id: None,
        }
    }

    /// `(host, container)` port pair, each defaulting to the other
    pub fn ports(&self) -> Option<(u16, u16)> {
        match (self.host_port, self.container_port) {
            (Some(host), Some(container)) => Some((host, container)),
            (Some(port), None) | (None, Some(port)) => Some((port, port)),
            (None, None) => None,
        }
    }
}

/// Everything the orchestrator knows about one application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,

    /// Declared strategy; only the literal `image` selects the image pipeline
    #[serde(default)]
    pub deploy_strategy: Option<String>,

    #[serde(default)]
    pub runtime: Option<Runtime>,

    #[serde(default)]
    pub start_command: Option<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub git_remote: Option<String>,

    #[serde(default)]
    pub git_branch: Option<String>,

    #[serde(default)]
    pub build_steps: Vec<String>,

    /// Git-strategy release history, oldest first
    #[serde(default)]
    pub versions: Vec<Release>,

    #[serde(default)]
    pub current_version_id: Option<u64>,

    /// Highest release id ever issued
    #[serde(default)]
    pub last_version_id: u64,

    #[serde(default)]
    pub image: Option<ImageSettings>,

    /// Image-strategy release history, oldest first
    #[serde(default)]
    pub image_releases: Vec<ImageRelease>,

    #[serde(default)]
    pub current_image_release_id: Option<u64>,

    /// Highest image release id ever issued
    #[serde(default)]
    pub last_image_release_id: u64,

    /// Credentials generated for auto-provisioned services, keyed by service
    #[serde(default)]
    pub generated_secrets: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            deploy_strategy: None,
            runtime: None,
            start_command: None,
            working_dir: None,
            port: None,
            domain: None,
            git_remote: None,
            git_branch: None,
            build_steps: Vec::new(),
            versions: Vec::new(),
            current_version_id: None,
            last_version_id: 0,
            image: None,
            image_releases: Vec::new(),
            current_image_release_id: None,
            last_image_release_id: 0,
            generated_secrets: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn version(&self, id: u64) -> Option<&Release> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn version_mut(&mut self, id: u64) -> Option<&mut Release> {
        self.versions.iter_mut().find(|v| v.id == id)
    }

    /// Next release id: never reuses an id, even after removals
    pub fn next_version_id(&self) -> u64 {
        let max_existing = self.versions.iter().map(|v| v.id).max().unwrap_or(0);
        self.last_version_id.max(max_existing) + 1
    }

    /// Next image release id: never reuses an id, even after pruning
    pub fn next_image_release_id(&self) -> u64 {
        let max_existing = self.image_releases.iter().map(|r| r.id).max().unwrap_or(0);
        self.last_image_release_id.max(max_existing) + 1
    }

    /// Host port this application claims, whichever strategy it uses
    pub fn claimed_port(&self) -> Option<u16> {
        self.port.or_else(|| {
            self.image
                .as_ref()
                .and_then(|image| image.ports())
                .map(|(host, _)| host)
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
