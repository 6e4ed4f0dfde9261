//! Error types for shipd

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum ShipError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Port conflict: {0}")]
    PortConflict(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Container engine error: {0}")]
    EngineError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Health check failed: {0}")]
    HealthCheckError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Rollback error: {0}")]
    RollbackError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShipError {
    /// Whether this error is the cooperative-cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ShipError::Cancelled)
    }
}

impl From<anyhow::Error> for ShipError {
    fn from(err: anyhow::Error) -> Self {
        ShipError::Internal(err.to_string())
    }
}
