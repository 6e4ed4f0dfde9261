//! Container status parsing and the bounded health wait

use std::time::Duration;

use tokio::time::Instant;

use crate::engine::docker::{EngineGateway, COMPOSE_PROJECT_LABEL};
use crate::errors::ShipError;
use crate::stream::logs::DeploymentLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    /// States a container never leaves on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "starting" => Some(HealthState::Starting),
            "healthy" => Some(HealthState::Healthy),
            "unhealthy" => Some(HealthState::Unhealthy),
            _ => None,
        }
    }
}

/// State plus the optional health probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub health: Option<HealthState>,
}

impl ContainerStatus {
    /// Parse `<state>|<health>` as printed by the inspect template
    pub fn parse(s: &str) -> Self {
        let (state, health) = s.split_once('|').unwrap_or((s, ""));
        Self {
            state: ContainerState::parse(state),
            health: HealthState::parse(health),
        }
    }
}

/// What to wait on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTarget {
    Container(String),
    /// Every container of the project must be running
    ComposeProject(String),
}

impl std::fmt::Display for HealthTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthTarget::Container(name) => write!(f, "container {}", name),
            HealthTarget::ComposeProject(project) => write!(f, "compose project {}", project),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

enum Probe {
    Running(Option<HealthState>),
    Pending(String),
    Failed(String),
}

async fn probe(gateway: &EngineGateway, target: &HealthTarget) -> Result<Probe, ShipError> {
    match target {
        HealthTarget::Container(name) => Ok(match gateway.status(name).await? {
            None => Probe::Pending("not created yet".to_string()),
            Some(status) if status.state == ContainerState::Running => Probe::Running(status.health),
            Some(status) if status.state.is_terminal() => {
                Probe::Failed(format!("container {} is {:?}", name, status.state).to_lowercase())
            }
            Some(status) => Probe::Pending(format!("{:?}", status.state).to_lowercase()),
        }),
        HealthTarget::ComposeProject(project) => {
            let containers = gateway
                .list_containers(&[format!("label={}={}", COMPOSE_PROJECT_LABEL, project)])
                .await?;
            if containers.is_empty() {
                return Ok(Probe::Pending("no containers yet".to_string()));
            }
            if let Some(dead) = containers
                .iter()
                .find(|c| ContainerState::parse(&c.state).is_terminal())
            {
                return Ok(Probe::Failed(format!(
                    "container {} is {}",
                    dead.name, dead.state
                )));
            }
            match containers
                .iter()
                .find(|c| ContainerState::parse(&c.state) != ContainerState::Running)
            {
                Some(pending) => Ok(Probe::Pending(format!("{} is {}", pending.name, pending.state))),
                None => Ok(Probe::Running(None)),
            }
        }
    }
}

/// Poll until the target runs, fails, or the timeout elapses.
///
/// A running container with an unhealthy probe still counts as up; the
/// probe result is only reported.
pub async fn wait_for_healthy(
    gateway: &EngineGateway,
    target: &HealthTarget,
    options: HealthOptions,
    log: &DeploymentLog,
) -> Result<(), ShipError> {
    log.info(format!(
        "Waiting for {} (timeout {}s)",
        target,
        options.timeout.as_secs()
    ))
    .await;

    let deadline = Instant::now() + options.timeout;
    let mut last = String::from("unknown");
    loop {
        match probe(gateway, target).await? {
            Probe::Running(health) => {
                match health {
                    Some(HealthState::Healthy) => {
                        log.info(format!("{} is running and healthy", target)).await
                    }
                    Some(HealthState::Unhealthy) => {
                        log.warn(format!(
                            "{} is running but its health check reports unhealthy",
                            target
                        ))
                        .await
                    }
                    _ => log.info(format!("{} is running", target)).await,
                }
                return Ok(());
            }
            Probe::Failed(reason) => {
                return Err(ShipError::HealthCheckError(format!(
                    "{} stopped before becoming healthy: {}",
                    target, reason
                )));
            }
            Probe::Pending(state) => last = state,
        }

        if Instant::now() + options.interval > deadline {
            return Err(ShipError::HealthCheckError(format!(
                "{} did not start within {}s (last state: {})",
                target,
                options.timeout.as_secs(),
                last
            )));
        }
        tokio::time::sleep(options.interval).await;
    }
}
