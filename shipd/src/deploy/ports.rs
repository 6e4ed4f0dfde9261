//! Host port arbitration between applications

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::debug;

use crate::engine::docker::{ContainerSummary, EngineGateway};
use crate::errors::ShipError;
use crate::models::app::AppMetadata;

/// Whether a host port is currently bound
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_bound(&self, port: u16) -> bool;
}

/// Probes by trying to bind the port on all interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortProbe;

#[async_trait]
impl PortProbe for SystemPortProbe {
    async fn is_bound(&self, port: u16) -> bool {
        match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::AddrInUse => true,
            Err(e) => {
                // e.g. PermissionDenied on privileged ports
                debug!("Port probe for {} inconclusive: {}", port, e);
                false
            }
        }
    }
}

/// Application a container belongs to, when it can be told
fn owning_app(container: &ContainerSummary, apps: &[AppMetadata]) -> Option<String> {
    container
        .app_label
        .clone()
        .or_else(|| container.compose_project.clone())
        .or_else(|| {
            apps.iter()
                .find(|app| app.name == container.name)
                .map(|app| app.name.clone())
        })
}

fn claimed_by_other<'a>(app: &str, port: u16, apps: &'a [AppMetadata]) -> Option<&'a AppMetadata> {
    apps.iter()
        .find(|other| other.name != app && other.claimed_port() == Some(port))
}

/// Fail when `port` is in use by anything other than `app`.
///
/// An unbound port still fails when another application's metadata claims
/// it. A bound port is fine when the publisher is this application's
/// container or compose project; otherwise the error names the occupying
/// application when it is known.
pub async fn check_port_conflict(
    app: &str,
    port: u16,
    apps: &[AppMetadata],
    gateway: &EngineGateway,
    probe: &dyn PortProbe,
) -> Result<(), ShipError> {
    if !probe.is_bound(port).await {
        return match claimed_by_other(app, port, apps) {
            Some(other) => Err(ShipError::PortConflict(format!(
                "Port {} is already assigned to application '{}'",
                port, other.name
            ))),
            None => Ok(()),
        };
    }

    let publishers = gateway
        .list_containers(&[format!("publish={}", port)])
        .await
        .unwrap_or_else(|e| {
            debug!("Could not list publishers of port {}: {}", port, e);
            Vec::new()
        });

    let owners: Vec<Option<String>> = publishers.iter().map(|c| owning_app(c, apps)).collect();
    if owners.iter().any(|owner| owner.as_deref() == Some(app))
        || publishers.iter().any(|c| c.name == app)
    {
        debug!("Port {} is held by {} itself", port, app);
        return Ok(());
    }

    let named = owners
        .into_iter()
        .flatten()
        .next()
        .or_else(|| claimed_by_other(app, port, apps).map(|other| other.name.clone()));

    Err(ShipError::PortConflict(match named {
        Some(owner) => format!("Port {} is in use by application '{}'", port, owner),
        None => format!("Port {} is already in use on this host", port),
    }))
}
