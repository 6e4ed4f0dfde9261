//! Container engine primitives

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::engine::health::ContainerStatus;
use crate::engine::policy::{is_high_impact, is_permission_error, validate_engine_args};
use crate::engine::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::ShipError;
use crate::storage::settings::EngineSettings;
use crate::utils::tail;

/// Label put on every container the orchestrator starts
pub const APP_LABEL: &str = "io.shipd.app";

/// Label compose puts on project containers
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// A container to start
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// `(host, container)` port pairs
    pub ports: Vec<(u16, u16)>,
    pub env_file: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub restart: Option<String>,
}

impl RunSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if let Some(restart) = &self.restart {
            args.push("--restart".to_string());
            args.push(restart.clone());
        }
        for (host, container) in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", host, container));
        }
        if let Some(env_file) = &self.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args
    }
}

/// One row of `ps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub state: String,
    pub ports: String,
    pub compose_project: Option<String>,
    pub app_label: Option<String>,
}

/// Safe gateway to the container engine CLI
pub struct EngineGateway {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    elevate_command: Option<Vec<String>>,
}

impl EngineGateway {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &EngineSettings) -> Self {
        Self {
            runner,
            binary: settings.binary.clone(),
            elevate_command: settings
                .allow_elevation
                .then(|| settings.elevate_command.clone())
                .filter(|cmd| !cmd.is_empty()),
        }
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Validate and run an engine invocation, retrying elevated on
    /// permission errors for low-impact operations.
    ///
    /// A non-zero exit is returned as output, not as an error.
    pub async fn exec(
        &self,
        args: Vec<String>,
        cwd: Option<&Path>,
        stdin: Option<SecretString>,
    ) -> Result<CommandOutput, ShipError> {
        validate_engine_args(&args)?;
        self.exec_program(&self.binary.clone(), args, cwd, stdin).await
    }

    pub(crate) async fn exec_program(
        &self,
        program: &str,
        args: Vec<String>,
        cwd: Option<&Path>,
        stdin: Option<SecretString>,
    ) -> Result<CommandOutput, ShipError> {
        let high_impact = is_high_impact(&args);
        let mut spec = CommandSpec::new(program, args);
        if let Some(cwd) = cwd {
            spec = spec.current_dir(cwd);
        }
        if let Some(stdin) = stdin {
            spec = spec.stdin(stdin);
        }

        let output = self.runner.run(&spec).await?;
        if output.success() || !is_permission_error(&output.stderr) {
            return Ok(output);
        }

        if high_impact {
            return Err(ShipError::PermissionDenied(format!(
                "`{} {}` needs access to the container engine and is never retried with elevated privileges. \
                 Grant the shipd user direct engine access (for example `usermod -aG docker <user>`) and retry.",
                program,
                spec.args.first().map(String::as_str).unwrap_or("")
            )));
        }

        let Some(elevated) = self
            .elevate_command
            .as_ref()
            .and_then(|prefix| spec.elevated(prefix))
        else {
            return Err(ShipError::PermissionDenied(format!(
                "Permission denied running `{}`: {}",
                spec,
                tail(&output.stderr, 300)
            )));
        };

        warn!("Permission denied for `{}`, retrying elevated", spec);
        self.runner.run(&elevated).await
    }

    /// Run and turn a non-zero exit into an engine error
    pub async fn exec_ok(
        &self,
        args: Vec<String>,
        cwd: Option<&Path>,
        what: &str,
    ) -> Result<CommandOutput, ShipError> {
        let output = self.exec(args, cwd, None).await?;
        check(output, what)
    }

    /// Build an image from `context`
    pub async fn build(&self, context: &Path, dockerfile: Option<&str>, tag: &str) -> Result<(), ShipError> {
        info!("Building image {} from {}", tag, context.display());
        let mut args = vec!["build".to_string(), "-t".to_string(), tag.to_string()];
        if let Some(dockerfile) = dockerfile {
            args.push("-f".to_string());
            args.push(context.join(dockerfile).display().to_string());
        }
        args.push(context.display().to_string());

        let output = self.exec(args, Some(context), None).await?;
        if !output.success() {
            return Err(ShipError::BuildError(format!(
                "Image build failed for {}: {}",
                tag,
                tail(&output.stderr, 800)
            )));
        }
        Ok(())
    }

    /// Start a detached container; returns its id
    pub async fn run(&self, spec: &RunSpec) -> Result<String, ShipError> {
        info!("Running container {} from {}", spec.name, spec.image);
        let output = self.exec_ok(spec.to_args(), None, "run").await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn stop(&self, name: &str) -> Result<(), ShipError> {
        self.exec_ok(vec!["stop".to_string(), name.to_string()], None, "stop")
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, name: &str) -> Result<(), ShipError> {
        self.exec_ok(
            vec!["rm".to_string(), "-f".to_string(), name.to_string()],
            None,
            "rm",
        )
        .await
        .map(|_| ())
    }

    pub async fn restart(&self, name: &str) -> Result<(), ShipError> {
        self.exec_ok(vec!["restart".to_string(), name.to_string()], None, "restart")
            .await
            .map(|_| ())
    }

    /// Stop and remove a container, ignoring "no such container"
    pub async fn stop_and_remove(&self, name: &str) {
        if let Err(e) = self.stop(name).await {
            debug!("Stop {} skipped: {}", name, e);
        }
        if let Err(e) = self.remove(name).await {
            debug!("Remove {} skipped: {}", name, e);
        }
    }

    /// Container state, or `None` when it does not exist
    pub async fn status(&self, name: &str) -> Result<Option<ContainerStatus>, ShipError> {
        let output = self
            .exec(
                vec![
                    "inspect".to_string(),
                    "--type".to_string(),
                    "container".to_string(),
                    "--format".to_string(),
                    "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}".to_string(),
                    name.to_string(),
                ],
                None,
                None,
            )
            .await?;
        if !output.success() {
            if output.stderr.to_lowercase().contains("no such") {
                return Ok(None);
            }
            return Err(ShipError::EngineError(format!(
                "inspect failed for {}: {}",
                name,
                tail(&output.stderr, 300)
            )));
        }
        Ok(Some(ContainerStatus::parse(output.stdout.trim())))
    }

    /// Last `lines` lines of a container's logs
    pub async fn logs(&self, name: &str, lines: usize) -> Result<String, ShipError> {
        let output = self
            .exec_ok(
                vec![
                    "logs".to_string(),
                    "--tail".to_string(),
                    lines.to_string(),
                    name.to_string(),
                ],
                None,
                "logs",
            )
            .await?;
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    /// Containers matching `ps` filters (`key=value`)
    pub async fn list_containers(&self, filters: &[String]) -> Result<Vec<ContainerSummary>, ShipError> {
        let mut args = vec!["ps".to_string(), "-a".to_string()];
        for filter in filters {
            args.push("--filter".to_string());
            args.push(filter.clone());
        }
        args.push("--format".to_string());
        args.push(format!(
            "{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.Ports}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}",
            COMPOSE_PROJECT_LABEL, APP_LABEL
        ));

        let output = self.exec_ok(args, None, "ps").await?;
        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_ps_line)
            .collect())
    }

    /// Log in to a registry; the password goes through stdin
    pub async fn login(&self, server: &str, username: &str, password: SecretString) -> Result<(), ShipError> {
        info!("Logging in to registry {}", server);
        let output = self
            .exec(
                vec![
                    "login".to_string(),
                    server.to_string(),
                    "-u".to_string(),
                    username.to_string(),
                    "--password-stdin".to_string(),
                ],
                None,
                Some(password),
            )
            .await?;
        if !output.success() {
            return Err(ShipError::RegistryError(format!(
                "Login to {} failed: {}",
                server,
                tail(&output.stderr, 300)
            )));
        }
        Ok(())
    }

    pub async fn logout(&self, server: &str) -> Result<(), ShipError> {
        self.exec_ok(vec!["logout".to_string(), server.to_string()], None, "logout")
            .await
            .map(|_| ())
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<(), ShipError> {
        self.exec_ok(
            vec!["tag".to_string(), source.to_string(), target.to_string()],
            None,
            "tag",
        )
        .await
        .map(|_| ())
    }

    pub async fn push(&self, image: &str) -> Result<(), ShipError> {
        self.exec_ok(vec!["push".to_string(), image.to_string()], None, "push")
            .await
            .map(|_| ())
    }

    pub async fn pull(&self, image: &str) -> Result<(), ShipError> {
        info!("Pulling image {}", image);
        let output = self.exec(vec!["pull".to_string(), image.to_string()], None, None).await?;
        if !output.success() {
            return Err(ShipError::RegistryError(format!(
                "Pull failed for {}: {}",
                image,
                tail(&output.stderr, 300)
            )));
        }
        Ok(())
    }

    /// Whether the image is present locally
    pub async fn image_exists(&self, image: &str) -> Result<bool, ShipError> {
        let output = self
            .exec(
                vec!["image".to_string(), "inspect".to_string(), image.to_string()],
                None,
                None,
            )
            .await?;
        Ok(output.success())
    }

    /// Repository digest (`sha256:...`) of a local image
    pub async fn inspect_digest(&self, image: &str) -> Result<Option<String>, ShipError> {
        let output = self
            .exec(
                vec![
                    "image".to_string(),
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{range .RepoDigests}}{{println .}}{{end}}".to_string(),
                    image.to_string(),
                ],
                None,
                None,
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().split_once('@').map(|(_, digest)| digest.to_string()))
            .find(|digest| digest.starts_with("sha256:")))
    }

    /// Disk usage summary; doubles as an engine access check
    pub async fn system_df(&self) -> Result<String, ShipError> {
        let output = self
            .exec_ok(vec!["system".to_string(), "df".to_string()], None, "system df")
            .await?;
        Ok(output.stdout)
    }
}

/// Turn a non-zero exit into an engine error naming the operation
pub fn check(output: CommandOutput, what: &str) -> Result<CommandOutput, ShipError> {
    if output.success() {
        Ok(output)
    } else {
        Err(ShipError::EngineError(format!(
            "{} failed (exit {}): {}",
            what,
            output.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            tail(&output.stderr, 500)
        )))
    }
}

fn parse_ps_line(line: &str) -> ContainerSummary {
    let mut fields = line.split('\t');
    let mut next = || {
        fields
            .next()
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let name = next();
    let state = next();
    let ports = next();
    let compose_project = Some(next()).filter(|s| !s.is_empty());
    let app_label = Some(next()).filter(|s| !s.is_empty());
    ContainerSummary {
        name,
        state,
        ports,
        compose_project,
        app_label,
    }
}
