//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit process logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// Directory holding one subdirectory per application
    #[serde(default = "default_apps_dir")]
    pub apps_dir: String,

    /// Directory for process and per-deployment logs
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// Container engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Health wait configuration
    #[serde(default)]
    pub health: HealthSettings,

    /// Release retention
    #[serde(default)]
    pub retention: RetentionSettings,

    /// Log stream and cancellation bookkeeping
    #[serde(default)]
    pub streams: StreamSettings,
}

fn default_apps_dir() -> String {
    "/var/lib/shipd/apps".to_string()
}

fn default_logs_dir() -> String {
    "/var/log/shipd".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            apps_dir: default_apps_dir(),
            logs_dir: default_logs_dir(),
            engine: EngineSettings::default(),
            health: HealthSettings::default(),
            retention: RetentionSettings::default(),
            streams: StreamSettings::default(),
        }
    }
}

/// Container engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Engine binary (`docker`, `podman`, ...)
    #[serde(default = "default_engine_binary")]
    pub binary: String,

    /// Command used to retry low-impact operations with elevated privileges
    #[serde(default = "default_elevate_command")]
    pub elevate_command: Vec<String>,

    /// Allow the elevated retry at all
    #[serde(default = "default_true")]
    pub allow_elevation: bool,
}

fn default_engine_binary() -> String {
    "docker".to_string()
}

fn default_elevate_command() -> Vec<String> {
    vec!["sudo".to_string(), "-n".to_string()]
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            elevate_command: default_elevate_command(),
            allow_elevation: true,
        }
    }
}

/// Health wait settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_health_interval() -> u64 {
    2
}

fn default_health_timeout() -> u64 {
    60
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
        }
    }
}

/// Release retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Successful git releases kept besides the current one
    #[serde(default = "default_keep_versions")]
    pub versions: usize,

    /// Image releases kept in history
    #[serde(default = "default_keep_image_releases")]
    pub image_releases: usize,
}

fn default_keep_versions() -> usize {
    5
}

fn default_keep_image_releases() -> usize {
    10
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            versions: default_keep_versions(),
            image_releases: default_keep_image_releases(),
        }
    }
}

/// Stream bookkeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Idle time after which a deployment's stream and cancel state are dropped
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// How often the janitor sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-subscriber buffer before lagging subscribers drop lines
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_idle_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}
