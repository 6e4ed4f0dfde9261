//! Orchestrator configuration options

use std::time::Duration;

use crate::deploy::pipeline::PipelineOptions;
use crate::engine::health::HealthOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{EngineSettings, Settings};
use crate::workers::janitor;

/// Main orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Container engine configuration
    pub engine: EngineSettings,

    /// Health waits and retention
    pub pipeline: PipelineOptions,

    /// Per-subscriber log buffer
    pub stream_capacity: usize,

    /// Janitor worker options
    pub janitor: janitor::Options,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            engine: EngineSettings::default(),
            pipeline: PipelineOptions::default(),
            stream_capacity: 1024,
            janitor: janitor::Options::default(),
        }
    }
}

impl From<&Settings> for OrchestratorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            layout: StorageLayout::new(&settings.apps_dir, &settings.logs_dir),
            engine: settings.engine.clone(),
            pipeline: PipelineOptions {
                health: HealthOptions {
                    interval: Duration::from_secs(settings.health.interval_secs.max(1)),
                    timeout: Duration::from_secs(settings.health.timeout_secs),
                },
                keep_versions: settings.retention.versions,
                keep_image_releases: settings.retention.image_releases.max(1),
            },
            stream_capacity: settings.streams.channel_capacity,
            janitor: janitor::Options {
                interval: Duration::from_secs(settings.streams.sweep_interval_secs.max(1)),
                idle_ttl: Duration::from_secs(settings.streams.idle_ttl_secs),
            },
        }
    }
}
