//! Container engine gateway tests

mod common;

use std::sync::Arc;

use tokio_test::assert_ok;

use common::{failed, ok, FakeRunner};
use shipd::engine::docker::EngineGateway;
use shipd::engine::health::{ContainerState, HealthState};
use shipd::errors::ShipError;
use shipd::storage::settings::EngineSettings;

const SOCKET_DENIED: &str = "permission denied while trying to connect to the Docker daemon socket at unix:///var/run/docker.sock";

fn gateway(runner: &Arc<FakeRunner>) -> EngineGateway {
    EngineGateway::new(runner.clone(), &EngineSettings::default())
}

fn args(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

#[tokio::test]
async fn test_disallowed_invocations_never_reach_the_engine() {
    let runner = FakeRunner::new();
    let gateway = gateway(&runner);

    for line in [
        "exec blog sh",
        "run --privileged nginx",
        "run --network host nginx",
        "run --pid=host nginx",
        "run -v /etc:/etc nginx",
        "run --mount type=bind,src=/,dst=/host nginx",
        "system prune -af",
        "image rm nginx",
        "compose -p blog exec app sh",
        "compose -p blog down -v",
    ] {
        let err = gateway.exec(args(line), None, None).await.unwrap_err();
        assert!(matches!(err, ShipError::ValidationError(_)), "{}: {}", line, err);
    }
    assert!(runner.calls().is_empty());

    // Named volumes are fine
    assert_ok!(gateway.exec(args("run -d -v data:/var/lib/data nginx"), None, None).await);
}

#[tokio::test]
async fn test_low_impact_permission_error_retries_elevated() {
    let runner = FakeRunner::new();
    runner.respond("docker ps", failed(SOCKET_DENIED));
    runner.respond("sudo -n docker ps", ok("blog\trunning\t0.0.0.0:3000->3000/tcp\t\tblog\n"));
    let gateway = gateway(&runner);

    let containers = assert_ok!(gateway.list_containers(&["label=io.shipd.app=blog".to_string()]).await);
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].app_label.as_deref(), Some("blog"));

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].program, "sudo");
    assert_eq!(&calls[1].args[..3], &["-n", "docker", "ps"]);
}

#[tokio::test]
async fn test_high_impact_permission_error_is_not_retried() {
    let runner = FakeRunner::new();
    runner.respond("docker run", failed(SOCKET_DENIED));
    runner.respond("docker build", failed(SOCKET_DENIED));
    let gateway = gateway(&runner);

    let err = gateway.exec(args("run -d nginx"), None, None).await.unwrap_err();
    assert!(matches!(err, ShipError::PermissionDenied(_)));
    assert!(err.to_string().contains("usermod -aG docker"));

    let err = gateway
        .build(std::path::Path::new("/srv/blog"), None, "shipd/blog:v1")
        .await
        .unwrap_err();
    assert!(matches!(err, ShipError::PermissionDenied(_)));

    assert_eq!(runner.count("sudo"), 0);
}

#[tokio::test]
async fn test_elevation_can_be_disabled() {
    let runner = FakeRunner::new();
    runner.respond("docker restart", failed(SOCKET_DENIED));
    let settings = EngineSettings {
        allow_elevation: false,
        ..Default::default()
    };
    let gateway = EngineGateway::new(runner.clone(), &settings);

    let err = gateway.restart("blog").await.unwrap_err();
    assert!(matches!(err, ShipError::PermissionDenied(_)));
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_compose_falls_back_to_standalone_binary() {
    let runner = FakeRunner::new();
    runner.respond(
        "docker compose",
        failed("docker: 'compose' is not a docker command.\nSee 'docker --help'"),
    );
    let gateway = gateway(&runner);

    assert_ok!(gateway.compose_down("blog").await);
    let last = runner.calls().pop().unwrap();
    assert_eq!(last.program, "docker-compose");
    assert_eq!(last.args, vec!["-p", "blog", "down", "--remove-orphans"]);
}

#[tokio::test]
async fn test_compose_up_failure_is_build_error() {
    let runner = FakeRunner::new();
    runner.respond("up -d", failed("service \"web\" failed to build"));
    let gateway = gateway(&runner);

    let err = gateway
        .compose_up(std::path::Path::new("/srv/blog/releases/v1"), "compose.yml", "blog", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShipError::BuildError(_)));
    assert!(err.to_string().contains("failed to build"));
}

#[tokio::test]
async fn test_container_status() {
    let runner = FakeRunner::new();
    let gateway = gateway(&runner);

    runner.respond("inspect --type container", ok("running|healthy\n"));
    let status = assert_ok!(gateway.status("blog").await).unwrap();
    assert_eq!(status.state, ContainerState::Running);
    assert_eq!(status.health, Some(HealthState::Healthy));

    runner.respond("inspect --type container", ok("restarting|\n"));
    let status = assert_ok!(gateway.status("blog").await).unwrap();
    assert_eq!(status.state, ContainerState::Restarting);
    assert_eq!(status.health, None);

    runner.respond("inspect --type container", failed("Error: No such container: blog"));
    assert!(assert_ok!(gateway.status("blog").await).is_none());

    runner.respond("inspect --type container", failed("Cannot connect to the Docker daemon"));
    assert!(gateway.status("blog").await.is_err());
}

#[tokio::test]
async fn test_inspect_digest() {
    let runner = FakeRunner::new();
    let gateway = gateway(&runner);

    runner.respond(
        "image inspect --format",
        ok("ghcr.io/acme/api@sha256:0a1b2c\nmirror.local/acme/api@sha256:0a1b2c\n"),
    );
    assert_eq!(
        assert_ok!(gateway.inspect_digest("ghcr.io/acme/api:1").await).as_deref(),
        Some("sha256:0a1b2c")
    );

    // Locally built images have no repository digest
    runner.respond("image inspect --format", ok("\n"));
    assert_eq!(assert_ok!(gateway.inspect_digest("shipd/blog:v1").await), None);
}

#[tokio::test]
async fn test_run_returns_container_id() {
    let runner = FakeRunner::new();
    runner.respond("docker run", ok("f00dfacecafe\n"));
    let gateway = gateway(&runner);

    let spec = shipd::engine::docker::RunSpec {
        name: "blog".to_string(),
        image: "shipd/blog:v1".to_string(),
        ports: vec![(3000, 3000)],
        env_file: None,
        env: vec![],
        labels: vec![],
        restart: None,
    };
    assert_eq!(assert_ok!(gateway.run(&spec).await), "f00dfacecafe");
}
