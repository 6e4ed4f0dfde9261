//! Declarative release configuration (`deploy.yml`)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ShipError;

/// Application runtime used to synthesize a Dockerfile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Bun,
    Deno,
    Python,
    Go,
    Rust,
    Ruby,
    Php,
    Java,
}

impl Runtime {
    pub const ALL: [Runtime; 9] = [
        Runtime::Node,
        Runtime::Bun,
        Runtime::Deno,
        Runtime::Python,
        Runtime::Go,
        Runtime::Rust,
        Runtime::Ruby,
        Runtime::Php,
        Runtime::Java,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Node => "node",
            Runtime::Bun => "bun",
            Runtime::Deno => "deno",
            Runtime::Python => "python",
            Runtime::Go => "go",
            Runtime::Rust => "rust",
            Runtime::Ruby => "ruby",
            Runtime::Php => "php",
            Runtime::Java => "java",
        }
    }

    /// Comma-separated list of supported runtimes for error messages
    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = ShipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "node" | "nodejs" | "node.js" => Ok(Runtime::Node),
            "bun" => Ok(Runtime::Bun),
            "deno" => Ok(Runtime::Deno),
            "python" | "python3" => Ok(Runtime::Python),
            "go" | "golang" => Ok(Runtime::Go),
            "rust" => Ok(Runtime::Rust),
            "ruby" => Ok(Runtime::Ruby),
            "php" => Ok(Runtime::Php),
            "java" => Ok(Runtime::Java),
            other => Err(ShipError::ConfigError(format!(
                "Unsupported runtime '{}'. Supported runtimes: {}",
                other,
                Runtime::supported_list()
            ))),
        }
    }
}

/// Database engine provisioned next to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Postgres,
    Mysql,
    Mariadb,
    Mongo,
}

impl FromStr for DatabaseEngine {
    type Err = ShipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseEngine::Postgres),
            "mysql" => Ok(DatabaseEngine::Mysql),
            "mariadb" => Ok(DatabaseEngine::Mariadb),
            "mongo" | "mongodb" => Ok(DatabaseEngine::Mongo),
            other => Err(ShipError::ConfigError(format!(
                "Unsupported database '{}'. Supported databases: postgres, mysql, mariadb, mongo",
                other
            ))),
        }
    }
}

/// Cache engine provisioned next to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEngine {
    Redis,
}

impl FromStr for CacheEngine {
    type Err = ShipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(CacheEngine::Redis),
            other => Err(ShipError::ConfigError(format!(
                "Unsupported cache '{}'. Supported caches: redis",
                other
            ))),
        }
    }
}

/// Build steps may be written as a list or as a newline-delimited block
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BuildSteps {
    List(Vec<String>),
    Block(String),
}

impl BuildSteps {
    fn into_steps(self) -> Vec<String> {
        let steps = match self {
            BuildSteps::List(steps) => steps,
            BuildSteps::Block(block) => block.lines().map(str::to_string).collect(),
        };
        steps
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Raw file contents before validation
#[derive(Debug, Clone, Default, Deserialize)]
struct RawDeployConfig {
    runtime: Option<String>,
    build: Option<BuildSteps>,
    start: Option<String>,
    port: Option<u16>,
    domain: Option<String>,
    database: Option<String>,
    cache: Option<String>,
}

/// Validated release configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub runtime: Option<Runtime>,
    pub build_steps: Vec<String>,
    pub start_command: Option<String>,
    pub port: u16,
    pub domain: Option<String>,
    pub database: Option<DatabaseEngine>,
    pub cache: Option<CacheEngine>,
}

impl DeployConfig {
    /// Parse and validate YAML contents.
    ///
    /// The start-command requirement depends on which container files the
    /// release ships, so it is checked by the pipeline, not here.
    pub fn from_yaml(contents: &str) -> Result<Self, ShipError> {
        let raw: RawDeployConfig = if contents.trim().is_empty() {
            RawDeployConfig::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| ShipError::ConfigError(format!("Invalid deploy config: {}", e)))?
        };

        let port = match raw.port {
            Some(port) if port > 0 => port,
            Some(_) => {
                return Err(ShipError::ConfigError(
                    "Port must be between 1 and 65535".to_string(),
                ))
            }
            None => {
                return Err(ShipError::ConfigError(
                    "Deploy config must declare a port".to_string(),
                ))
            }
        };

        let runtime: Option<Runtime> = raw
            .runtime
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(str::parse)
            .transpose()?;
        let database: Option<DatabaseEngine> = raw
            .database
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(str::parse)
            .transpose()?;
        let cache: Option<CacheEngine> = raw
            .cache
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(str::parse)
            .transpose()?;

        Ok(Self {
            runtime,
            build_steps: raw.build.map(BuildSteps::into_steps).unwrap_or_default(),
            start_command: raw
                .start
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            port,
            domain: raw.domain.filter(|d| !d.trim().is_empty()),
            database,
            cache,
        })
    }

    /// Whether the release needs generated dependency services
    pub fn has_dependencies(&self) -> bool {
        self.database.is_some() || self.cache.is_some()
    }
}
