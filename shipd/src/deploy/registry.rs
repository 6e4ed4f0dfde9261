//! Registry login material

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::deploy::hooks::RegistryCredential;
use crate::engine::runner::{CommandRunner, CommandSpec};
use crate::errors::ShipError;
use crate::models::release::RegistryProvider;
use crate::utils::tail;

/// Username and password ready for `login --password-stdin`
#[derive(Debug)]
pub struct RegistryLogin {
    pub server: String,
    pub username: String,
    pub password: SecretString,
}

/// Region of an ECR host `<account>.dkr.ecr.<region>.amazonaws.com`
pub fn ecr_region(server: &str) -> Option<String> {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()?;
    let labels: Vec<&str> = host.split('.').collect();
    match labels.as_slice() {
        [_, "dkr", "ecr", region, "amazonaws", "com"] if !region.is_empty() => Some(region.to_string()),
        [_, "dkr", "ecr", region, "amazonaws", "com", "cn"] if !region.is_empty() => Some(region.to_string()),
        _ => None,
    }
}

/// Registry host of an image reference; Docker Hub when none is given
pub fn registry_of(image_ref: &str) -> String {
    match image_ref.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => "docker.io".to_string(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcrAuthResponse {
    authorization_data: Vec<EcrAuthData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcrAuthData {
    authorization_token: String,
}

/// Decode an ECR authorization token (`base64("AWS:<password>")`)
pub fn decode_ecr_token(token: &str) -> Result<(String, SecretString), ShipError> {
    let decoded = BASE64
        .decode(token.trim())
        .map_err(|e| ShipError::RegistryError(format!("Invalid ECR token: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ShipError::RegistryError("ECR token is not UTF-8".to_string()))?;
    let (user, password) = decoded
        .split_once(':')
        .ok_or_else(|| ShipError::RegistryError("Malformed ECR token".to_string()))?;
    Ok((user.to_string(), SecretString::from(password.to_string())))
}

/// Turn stored credentials into login material, exchanging ECR keys for
/// a short-lived password
pub async fn login_material(
    runner: &Arc<dyn CommandRunner>,
    credential: RegistryCredential,
) -> Result<RegistryLogin, ShipError> {
    if credential.provider != RegistryProvider::Ecr {
        return Ok(RegistryLogin {
            server: credential.server,
            username: credential.username,
            password: credential.password,
        });
    }

    let region = ecr_region(&credential.server).ok_or_else(|| {
        ShipError::RegistryError(format!(
            "Cannot derive an AWS region from registry host {}",
            credential.server
        ))
    })?;
    let access_key_id = credential
        .access_key_id
        .clone()
        .unwrap_or_else(|| credential.username.clone());

    info!("Exchanging ECR credentials for {} ({})", credential.server, region);
    let spec = CommandSpec::new(
        "aws",
        vec![
            "ecr".to_string(),
            "get-authorization-token".to_string(),
            "--region".to_string(),
            region,
            "--output".to_string(),
            "json".to_string(),
        ],
    )
    .secret_env("AWS_ACCESS_KEY_ID", SecretString::from(access_key_id))
    .secret_env(
        "AWS_SECRET_ACCESS_KEY",
        SecretString::from(credential.password.expose_secret().to_string()),
    );

    let output = runner.run(&spec).await?;
    if !output.success() {
        return Err(ShipError::RegistryError(format!(
            "ECR token exchange failed: {}",
            tail(&output.stderr, 300)
        )));
    }

    let response: EcrAuthResponse = serde_json::from_str(&output.stdout)?;
    let token = response
        .authorization_data
        .first()
        .ok_or_else(|| ShipError::RegistryError("ECR returned no authorization data".to_string()))?;
    let (username, password) = decode_ecr_token(&token.authorization_token)?;
    debug!("ECR token obtained for {}", credential.server);

    Ok(RegistryLogin {
        server: credential.server,
        username,
        password,
    })
}
