//! Collaborators the orchestrator consumes but does not own

use std::path::Path;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;

use crate::errors::ShipError;
use crate::models::release::RegistryProvider;

/// Result of fetching source into a release directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    /// Resolved commit hash
    pub commit: String,
}

/// Fetches application source at a ref into a directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, remote: &str, reference: &str, target: &Path) -> Result<FetchedSource, ShipError>;
}

/// Login material for a registry
#[derive(Debug)]
pub struct RegistryCredential {
    pub server: String,
    pub username: String,
    /// Token or password; for ECR the AWS secret access key
    pub password: SecretString,
    pub provider: RegistryProvider,
    /// AWS access key id, ECR only
    pub access_key_id: Option<String>,
}

/// Looks up stored registry credentials by id
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_id: &str) -> Result<RegistryCredential, ShipError>;
}

/// Regenerates the reverse-proxy configuration after a deployment
#[async_trait]
pub trait ProxyRegenerator: Send + Sync {
    async fn regenerate(&self, app: &str) -> Result<(), ShipError>;
}

/// Resolver for hosts without a credential store
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(&self, credential_id: &str) -> Result<RegistryCredential, ShipError> {
        Err(ShipError::NotFound(format!(
            "Registry credential '{}' not found",
            credential_id
        )))
    }
}

/// Regenerator for hosts without a managed proxy
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxy;

#[async_trait]
impl ProxyRegenerator for NoProxy {
    async fn regenerate(&self, app: &str) -> Result<(), ShipError> {
        debug!("No proxy configured, skipping regeneration for {}", app);
        Ok(())
    }
}
