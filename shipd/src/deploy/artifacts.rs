//! Generated container artifacts (Dockerfile and compose project)

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::errors::ShipError;
use crate::filesys::dir::Dir;
use crate::models::config::{CacheEngine, DatabaseEngine, DeployConfig, Runtime};

/// Generated Dockerfile name; distinct from `Dockerfile` so a rollback to this
/// release re-detects the same strategy
pub const GENERATED_DOCKERFILE: &str = "Dockerfile.shipd";

/// Generated compose file name
pub const GENERATED_COMPOSE: &str = "compose.shipd.yml";

/// Compose service name of the application itself
pub const APP_SERVICE: &str = "app";

const DB_SERVICE: &str = "db";
const CACHE_SERVICE: &str = "cache";
const DB_USER: &str = "app";
const DB_NAME: &str = "app";

/// Secret keys for auto-provisioned services
pub const DB_PASSWORD_SECRET: &str = "db_password";
pub const DB_ROOT_PASSWORD_SECRET: &str = "db_root_password";

fn base_image(runtime: Runtime) -> &'static str {
    match runtime {
        Runtime::Node => "node:20-alpine",
        Runtime::Bun => "oven/bun:1",
        Runtime::Deno => "denoland/deno:latest",
        Runtime::Python => "python:3.12-slim",
        Runtime::Go => "golang:1.22-alpine",
        Runtime::Rust => "rust:1-slim",
        Runtime::Ruby => "ruby:3.3-slim",
        Runtime::Php => "php:8.3-cli",
        Runtime::Java => "eclipse-temurin:21-jdk",
    }
}

fn default_build_steps(runtime: Runtime) -> Vec<&'static str> {
    match runtime {
        Runtime::Node => vec!["npm install"],
        Runtime::Bun => vec!["bun install"],
        Runtime::Python => vec![
            "if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi",
        ],
        Runtime::Go => vec!["go mod download"],
        Runtime::Rust => vec!["cargo build --release"],
        Runtime::Ruby => vec!["bundle install"],
        Runtime::Deno | Runtime::Php | Runtime::Java => vec![],
    }
}

/// Render a single-service Dockerfile from the runtime and start command
pub fn render_dockerfile(runtime: Runtime, config: &DeployConfig) -> Result<String, ShipError> {
    let start = config.start_command.as_deref().ok_or_else(|| {
        ShipError::ConfigError("A start command is required to generate a Dockerfile".to_string())
    })?;

    let mut lines = vec![
        "# Generated by shipd".to_string(),
        format!("FROM {}", base_image(runtime)),
        "WORKDIR /app".to_string(),
        "COPY . .".to_string(),
        format!("ENV PORT={}", config.port),
    ];

    if config.build_steps.is_empty() {
        lines.extend(default_build_steps(runtime).into_iter().map(|s| format!("RUN {}", s)));
    } else {
        lines.extend(config.build_steps.iter().map(|s| format!("RUN {}", s)));
    }

    lines.push(format!("EXPOSE {}", config.port));
    lines.push(format!("CMD [\"sh\", \"-c\", {}]", serde_json::to_string(start)?));

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    Ok(dockerfile)
}

#[derive(Debug, Serialize)]
struct ComposeProject {
    services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, serde_yaml::Mapping>,
}

#[derive(Debug, Default, Serialize)]
struct ComposeService {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<ComposeBuild>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env_file: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    depends_on: BTreeMap<String, DependsOn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<Healthcheck>,
    restart: String,
}

#[derive(Debug, Serialize)]
struct ComposeBuild {
    context: String,
    dockerfile: String,
}

#[derive(Debug, Serialize)]
struct DependsOn {
    condition: String,
}

#[derive(Debug, Serialize)]
struct Healthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
}

impl Healthcheck {
    fn new(test: &[&str]) -> Self {
        Self {
            test: test.iter().map(|s| s.to_string()).collect(),
            interval: "5s".to_string(),
            timeout: "5s".to_string(),
            retries: 10,
        }
    }
}

/// Secrets the generated compose project needs for `config`
pub fn required_secrets(config: &DeployConfig) -> Vec<&'static str> {
    match config.database {
        Some(DatabaseEngine::Mysql | DatabaseEngine::Mariadb) => {
            vec![DB_PASSWORD_SECRET, DB_ROOT_PASSWORD_SECRET]
        }
        Some(_) => vec![DB_PASSWORD_SECRET],
        None => vec![],
    }
}

fn secret<'a>(secrets: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, ShipError> {
    secrets
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ShipError::Internal(format!("Missing generated secret '{}'", key)))
}

/// Dependency service and the connection string it injects into the app
fn database_service(
    engine: DatabaseEngine,
    secrets: &BTreeMap<String, String>,
) -> Result<(ComposeService, String), ShipError> {
    let password = secret(secrets, DB_PASSWORD_SECRET)?;
    let mut service = ComposeService {
        restart: "unless-stopped".to_string(),
        ..Default::default()
    };
    let url = match engine {
        DatabaseEngine::Postgres => {
            service.image = Some("postgres:16-alpine".to_string());
            service.environment = env(&[
                ("POSTGRES_USER", DB_USER),
                ("POSTGRES_PASSWORD", password),
                ("POSTGRES_DB", DB_NAME),
            ]);
            service.volumes = vec!["db-data:/var/lib/postgresql/data".to_string()];
            let check = format!("pg_isready -U {} -d {}", DB_USER, DB_NAME);
            service.healthcheck = Some(Healthcheck::new(&["CMD-SHELL", check.as_str()]));
            format!("postgres://{}:{}@{}:5432/{}", DB_USER, password, DB_SERVICE, DB_NAME)
        }
        DatabaseEngine::Mysql => {
            let root = secret(secrets, DB_ROOT_PASSWORD_SECRET)?;
            service.image = Some("mysql:8.4".to_string());
            service.environment = env(&[
                ("MYSQL_USER", DB_USER),
                ("MYSQL_PASSWORD", password),
                ("MYSQL_ROOT_PASSWORD", root),
                ("MYSQL_DATABASE", DB_NAME),
            ]);
            service.volumes = vec!["db-data:/var/lib/mysql".to_string()];
            service.healthcheck = Some(Healthcheck::new(&[
                "CMD-SHELL",
                "mysqladmin ping -h 127.0.0.1 -u root -p$$MYSQL_ROOT_PASSWORD",
            ]));
            format!("mysql://{}:{}@{}:3306/{}", DB_USER, password, DB_SERVICE, DB_NAME)
        }
        DatabaseEngine::Mariadb => {
            let root = secret(secrets, DB_ROOT_PASSWORD_SECRET)?;
            service.image = Some("mariadb:11".to_string());
            service.environment = env(&[
                ("MARIADB_USER", DB_USER),
                ("MARIADB_PASSWORD", password),
                ("MARIADB_ROOT_PASSWORD", root),
                ("MARIADB_DATABASE", DB_NAME),
            ]);
            service.volumes = vec!["db-data:/var/lib/mysql".to_string()];
            service.healthcheck = Some(Healthcheck::new(&[
                "CMD",
                "healthcheck.sh",
                "--connect",
                "--innodb_initialized",
            ]));
            format!("mysql://{}:{}@{}:3306/{}", DB_USER, password, DB_SERVICE, DB_NAME)
        }
        DatabaseEngine::Mongo => {
            service.image = Some("mongo:7".to_string());
            service.environment = env(&[
                ("MONGO_INITDB_ROOT_USERNAME", DB_USER),
                ("MONGO_INITDB_ROOT_PASSWORD", password),
                ("MONGO_INITDB_DATABASE", DB_NAME),
            ]);
            service.volumes = vec!["db-data:/data/db".to_string()];
            service.healthcheck = Some(Healthcheck::new(&[
                "CMD",
                "mongosh",
                "--quiet",
                "--eval",
                "db.adminCommand('ping')",
            ]));
            format!(
                "mongodb://{}:{}@{}:27017/{}?authSource=admin",
                DB_USER, password, DB_SERVICE, DB_NAME
            )
        }
    };
    Ok((service, url))
}

fn cache_service(engine: CacheEngine) -> (ComposeService, String) {
    match engine {
        CacheEngine::Redis => (
            ComposeService {
                image: Some("redis:7-alpine".to_string()),
                volumes: vec!["cache-data:/data".to_string()],
                healthcheck: Some(Healthcheck::new(&["CMD", "redis-cli", "ping"])),
                restart: "unless-stopped".to_string(),
                ..Default::default()
            },
            format!("redis://{}:6379", CACHE_SERVICE),
        ),
    }
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn healthy() -> DependsOn {
    DependsOn {
        condition: "service_healthy".to_string(),
    }
}

/// Render a compose project with the `app` service plus one service per
/// declared dependency
pub fn render_compose(
    config: &DeployConfig,
    secrets: &BTreeMap<String, String>,
    env_file: Option<&Path>,
) -> Result<String, ShipError> {
    let port = config.port.to_string();
    let mut app = ComposeService {
        build: Some(ComposeBuild {
            context: ".".to_string(),
            dockerfile: GENERATED_DOCKERFILE.to_string(),
        }),
        ports: vec![format!("{}:{}", config.port, config.port)],
        env_file: env_file
            .map(|p| vec![p.display().to_string()])
            .unwrap_or_default(),
        environment: env(&[("PORT", port.as_str())]),
        restart: "unless-stopped".to_string(),
        ..Default::default()
    };

    let mut services = BTreeMap::new();
    let mut volumes = BTreeMap::new();

    if let Some(engine) = config.database {
        let (service, url) = database_service(engine, secrets)?;
        app.environment.insert("DATABASE_URL".to_string(), url.clone());
        if engine == DatabaseEngine::Mongo {
            app.environment.insert("MONGODB_URI".to_string(), url);
        }
        app.depends_on.insert(DB_SERVICE.to_string(), healthy());
        services.insert(DB_SERVICE.to_string(), service);
        volumes.insert("db-data".to_string(), serde_yaml::Mapping::new());
    }

    if let Some(engine) = config.cache {
        let (service, url) = cache_service(engine);
        app.environment.insert("REDIS_URL".to_string(), url);
        app.depends_on.insert(CACHE_SERVICE.to_string(), healthy());
        services.insert(CACHE_SERVICE.to_string(), service);
        volumes.insert("cache-data".to_string(), serde_yaml::Mapping::new());
    }

    services.insert(APP_SERVICE.to_string(), app);

    let project = ComposeProject { services, volumes };
    let mut rendered = String::from("# Generated by shipd\n");
    rendered.push_str(&serde_yaml::to_string(&project)?);
    Ok(rendered)
}

/// Write the generated Dockerfile (and compose file when `compose` is set)
/// into the release directory
pub async fn write_artifacts(
    release_dir: &Dir,
    runtime: Runtime,
    config: &DeployConfig,
    compose: Option<(&BTreeMap<String, String>, Option<&Path>)>,
) -> Result<(), ShipError> {
    let dockerfile = render_dockerfile(runtime, config)?;
    release_dir.file(GENERATED_DOCKERFILE).write_string(&dockerfile).await?;

    if let Some((secrets, env_file)) = compose {
        let compose = render_compose(config, secrets, env_file)?;
        release_dir.file(GENERATED_COMPOSE).write_string(&compose).await?;
    }
    Ok(())
}
