//! Deployment pipeline and rollback tests

mod common;

use std::collections::BTreeMap;

use tokio_test::assert_ok;

use common::{failed, ok, FakeFetcher, Harness, NODE_CONFIG};
use shipd::deploy::pipeline::{DeployOptions, DeployStatus};
use shipd::models::release::ReleaseStatus;

const NODE_FILES: [(&str, &str); 2] = [("deploy.yml", NODE_CONFIG), ("package.json", "{}")];

#[tokio::test]
async fn test_auto_dockerfile_deploy() {
    let h = Harness::new().await;
    let created = h.prepare("blog", &NODE_FILES).await;

    let result = h.deploy("blog", &created).await;
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(result.version_id, Some(1));

    // Generated Dockerfile built and run on the declared port
    assert!(created.release_dir.join("Dockerfile.shipd").exists());
    let build = h.runner.find("docker build").unwrap();
    assert!(build.line().contains("-t shipd/blog:v1"));
    assert!(build.line().contains("Dockerfile.shipd"));
    let run = h.runner.find("docker run -d").unwrap();
    assert!(run.args.windows(2).any(|w| w == ["-p", "3000:3000"]));
    assert!(run.args.windows(2).any(|w| w == ["--label", "io.shipd.app=blog"]));
    assert_eq!(run.args.last().map(String::as_str), Some("shipd/blog:v1"));

    let layout = h.orchestrator.store().app_layout("blog");
    assert_eq!(layout.current_link().target().await, Some(created.release_dir.clone()));

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(1));
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Active);
    assert_eq!(metadata.port, Some(3000));
    assert_eq!(metadata.start_command.as_deref(), Some("node server.js"));
    assert_eq!(metadata.git_branch.as_deref(), Some("main"));
    assert_eq!(metadata.working_dir.as_deref(), Some(layout.current_link().path()));
    assert_eq!(h.proxy.count(), 1);
}

#[tokio::test]
async fn test_second_deploy_supersedes_first() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    assert!(h.deploy_node("blog").await.is_success());

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(2));
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Success);
    assert_eq!(metadata.version(2).unwrap().status, ReleaseStatus::Active);

    // Previous container replaced before the new one starts
    let lines = h.runner.lines();
    let second_run = lines.iter().rposition(|l| l.contains("docker run -d")).unwrap();
    let last_remove = lines.iter().rposition(|l| l == "docker rm -f blog").unwrap();
    assert!(last_remove < second_run);
}

#[tokio::test]
async fn test_env_overrides_reach_container() {
    let h = Harness::new().await;
    let created = h.prepare("blog", &NODE_FILES).await;
    let mut env = BTreeMap::new();
    env.insert("API_KEY".to_string(), "k3y".to_string());

    let result = h
        .orchestrator
        .deploy(
            "blog",
            &created.release_dir,
            created.id,
            DeployOptions {
                env,
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_success(), "{}", result.message);

    let env_file = h.orchestrator.store().app_layout("blog").env_file();
    let contents = assert_ok!(env_file.read_string().await);
    assert!(contents.contains("API_KEY=k3y"));
    let run = h.runner.find("docker run -d").unwrap();
    assert!(run.args.windows(2).any(|w| w[0] == "--env-file" && w[1].ends_with(".env.production")));
}

#[tokio::test]
async fn test_invalid_env_override_is_rejected() {
    let h = Harness::new().await;
    let created = h.prepare("blog", &NODE_FILES).await;
    let env = BTreeMap::from([("NOT-A-NAME".to_string(), "1".to_string())]);

    let result = h
        .orchestrator
        .deploy(
            "blog",
            &created.release_dir,
            created.id,
            DeployOptions {
                env,
                ..Default::default()
            },
        )
        .await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("NOT-A-NAME"));
    assert!(h.runner.calls().is_empty());
    assert!(!h.orchestrator.store().app_layout("blog").env_file().exists().await);
}

#[tokio::test]
async fn test_user_compose_outranks_database() {
    let h = Harness::new().await;
    h.runner.respond(
        "label=com.docker.compose.project=shop",
        ok("shop-web-1\trunning\t0.0.0.0:8080->8080/tcp\tshop\t\nshop-db-1\trunning\t\tshop\t\n"),
    );
    let created = h
        .prepare(
            "shop",
            &[
                ("deploy.yml", "port: 8080\ndatabase: postgres\n"),
                ("docker-compose.yml", "services:\n  web:\n    build: .\n"),
            ],
        )
        .await;

    let result = h.deploy("shop", &created).await;
    assert!(result.is_success(), "{}", result.message);

    assert_eq!(h.runner.count("docker build"), 0);
    assert_eq!(h.runner.count("docker run -d"), 0);
    let up = h.runner.find("docker compose -f").unwrap();
    assert!(up.line().contains("docker-compose.yml"));
    assert!(up.args.windows(2).any(|w| w == ["-p", "shop"]));
    assert!(up.line().ends_with("up -d --build --remove-orphans"));
    assert!(!created.release_dir.join("compose.shipd.yml").exists());
    assert!(!created.release_dir.join("Dockerfile.shipd").exists());
}

#[tokio::test]
async fn test_auto_compose_keeps_generated_secrets() {
    let h = Harness::new().await;
    h.runner.respond(
        "label=com.docker.compose.project=blog",
        ok("blog-app-1\trunning\t\tblog\t\nblog-db-1\trunning\t\tblog\t\n"),
    );
    let files = [
        ("deploy.yml", "port: 3000\nstart: npm start\ndatabase: postgres\n"),
        ("package.json", "{}"),
    ];

    let first = h.prepare("blog", &files).await;
    assert!(h.deploy("blog", &first).await.is_success());
    assert!(first.release_dir.join("compose.shipd.yml").exists());
    let secrets = h.orchestrator.store().load("blog").await.unwrap().generated_secrets;
    assert!(secrets.contains_key("db_password"));

    let second = h.prepare("blog", &files).await;
    assert!(h.deploy("blog", &second).await.is_success());
    let again = h.orchestrator.store().load("blog").await.unwrap().generated_secrets;
    assert_eq!(secrets, again);
}

#[tokio::test]
async fn test_config_error_touches_no_containers() {
    let h = Harness::new().await;
    let created = h.prepare("blog", &[("package.json", "{}")]).await;

    let result = h.deploy("blog", &created).await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("deploy.yml"));
    assert!(h.runner.calls().is_empty());

    // Failed fresh releases are removed
    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert!(metadata.version(created.id).is_none());
    assert!(!created.release_dir.exists());
}

#[tokio::test]
async fn test_missing_start_command_is_config_error() {
    let h = Harness::new().await;
    let created = h
        .prepare("blog", &[("deploy.yml", "port: 3000\n"), ("package.json", "{}")])
        .await;

    let result = h.deploy("blog", &created).await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("start command"));
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_port_claimed_by_other_app() {
    let h = Harness::new().await;
    assert_ok!(
        h.orchestrator
            .store()
            .update("api", |metadata| {
                metadata.port = Some(3000);
                Ok(())
            })
            .await
    );

    let created = h.prepare("blog", &NODE_FILES).await;
    let result = h.deploy("blog", &created).await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("'api'"), "{}", result.message);
    assert_eq!(h.runner.count("docker build"), 0);
    assert_eq!(h.runner.count("docker run"), 0);
}

#[tokio::test]
async fn test_bound_port_names_publishing_app() {
    let h = Harness::new().await;
    h.probe.bind(3000);
    h.runner.respond(
        "publish=3000",
        ok("api-web\trunning\t0.0.0.0:3000->3000/tcp\t\tapi\n"),
    );

    let result = h.deploy_node("blog").await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("in use by application 'api'"), "{}", result.message);
    assert_eq!(h.runner.count("docker run"), 0);
}

#[tokio::test]
async fn test_bound_port_held_by_same_app() {
    let h = Harness::new().await;
    h.probe.bind(3000);
    h.runner.respond(
        "publish=3000",
        ok("blog\trunning\t0.0.0.0:3000->3000/tcp\t\tblog\n"),
    );

    let result = h.deploy_node("blog").await;
    assert!(result.is_success(), "{}", result.message);
}

#[tokio::test]
async fn test_bound_port_with_unknown_owner() {
    let h = Harness::new().await;
    h.probe.bind(3000);

    let result = h.deploy_node("blog").await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("already in use on this host"));
}

#[tokio::test]
async fn test_running_but_unhealthy_is_accepted() {
    let h = Harness::new().await;
    h.runner.respond("inspect --type container", ok("running|unhealthy\n"));

    let result = h.deploy_node("blog").await;
    assert!(result.is_success(), "{}", result.message);

    let log = h.orchestrator.deployment_log(&result.deployment_id).await.unwrap();
    assert!(log.contains("[WARN]"));
    assert!(log.contains("unhealthy"));
}

#[tokio::test]
async fn test_exited_container_fails_deploy() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    h.runner.respond("inspect --type container", ok("exited|\n"));

    let result = h.deploy_node("blog").await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("Health check failed"));

    // The new container is removed and v1 stays current
    assert_eq!(h.runner.lines().last().map(String::as_str), Some("docker compose -p blog down --remove-orphans"));
    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(1));
    assert!(metadata.version(2).is_none());
}

#[tokio::test]
async fn test_health_wait_times_out() {
    let h = Harness::new().await;
    h.runner.respond("inspect --type container", ok("created|\n"));

    let result = h.deploy_node("blog").await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("did not start"), "{}", result.message);
    assert!(result.message.contains("created"));
}

#[tokio::test]
async fn test_build_failure_reports_output() {
    let h = Harness::new().await;
    h.runner.respond("docker build", failed("npm ERR! missing script: build"));

    let result = h.deploy_node("blog").await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("missing script"));
    assert_eq!(h.runner.count("docker run"), 0);
    // Nothing was replaced, so nothing is torn down
    assert_eq!(h.runner.count("docker rm -f blog"), 0);
}

#[tokio::test]
async fn test_cancellation_cleans_up() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());

    let deployment_id = h.orchestrator.new_deployment_id();
    let cancels = h.orchestrator.cancels().clone();
    let id = deployment_id.clone();
    h.runner.on("docker run -d", move || {
        cancels.cancel(&id);
    });

    let created = h.prepare("blog", &NODE_FILES).await;
    let result = h
        .orchestrator
        .deploy(
            "blog",
            &created.release_dir,
            created.id,
            DeployOptions {
                deployment_id: Some(deployment_id.clone()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(result.status, DeployStatus::Cancelled);
    assert_eq!(result.deployment_id, deployment_id);
    assert!(!created.release_dir.exists());

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(1));
    assert!(metadata.version(created.id).is_none());

    // The container started by the cancelled attempt is removed
    let lines = h.runner.lines();
    let run = lines.iter().rposition(|l| l.contains("docker run -d")).unwrap();
    assert!(lines[run..].iter().any(|l| l == "docker rm -f blog"));

    // Registry entry is released once the pipeline ends
    assert!(!h.orchestrator.cancel(&deployment_id));
}

#[tokio::test]
async fn test_deploy_from_source_records_commit() {
    let h = Harness::new().await;
    let result = h
        .orchestrator
        .deploy_from_source("blog", "https://git.example.com/blog.git", "main", DeployOptions::default())
        .await;
    assert!(result.is_success(), "{}", result.message);

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.version(1).unwrap().commit, "9c1e5a7d3b2f");
    assert_eq!(metadata.git_remote.as_deref(), Some("https://git.example.com/blog.git"));
}

#[tokio::test]
async fn test_failed_fetch_discards_release() {
    let fetcher = FakeFetcher {
        fail: true,
        ..Default::default()
    };
    let h = Harness::with(|_| {}, fetcher).await;
    let result = h
        .orchestrator
        .deploy_from_source("blog", "https://git.example.com/blog.git", "nope", DeployOptions::default())
        .await;

    assert_eq!(result.status, DeployStatus::Failed);
    assert_eq!(result.version_id, Some(1));
    assert!(h.runner.calls().is_empty());
    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert!(metadata.versions.is_empty());

    // Ids are not reused after a discarded release
    let created = h.prepare("blog", &NODE_FILES).await;
    assert_eq!(created.id, 2);
}

#[tokio::test]
async fn test_retention_after_deploys() {
    let h = Harness::with(|options| options.pipeline.keep_versions = 2, FakeFetcher::default()).await;
    for _ in 0..5 {
        assert!(h.deploy_node("blog").await.is_success());
    }

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    let ids: Vec<u64> = metadata.versions.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![3, 4, 5]);
    let releases = h.orchestrator.store().app_layout("blog").releases_dir();
    assert!(!releases.subdir("v1").exists().await);
    assert!(releases.subdir("v3").exists().await);
}

#[tokio::test]
async fn test_concurrent_deploys_are_serialized() {
    let h = Harness::new().await;
    let first = h.prepare("blog", &NODE_FILES).await;
    let second = h.prepare("blog", &NODE_FILES).await;

    let a = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .deploy("blog", &first.release_dir, first.id, DeployOptions::default())
                .await
        })
    };
    let b = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .deploy("blog", &second.release_dir, second.id, DeployOptions::default())
                .await
        })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.is_success() && b.is_success());

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    let active = metadata
        .versions
        .iter()
        .filter(|v| v.status == ReleaseStatus::Active)
        .count();
    assert_eq!(active, 1);
    assert!(!h.orchestrator.is_deploying("blog"));
}

#[tokio::test]
async fn test_rollback_to_previous_release() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    assert!(h.deploy_node("blog").await.is_success());
    h.runner.clear();

    let result = h.orchestrator.rollback("blog", None, DeployOptions::default()).await;
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(result.version_id, Some(1));

    // Full redeploy of the old release
    assert!(h.runner.find("-t shipd/blog:v1").is_some());
    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(1));
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Active);
    assert_eq!(metadata.version(2).unwrap().status, ReleaseStatus::Success);
    let layout = h.orchestrator.store().app_layout("blog");
    assert_eq!(
        layout.current_link().target().await,
        Some(layout.release_dir(1).path().to_path_buf())
    );
}

#[tokio::test]
async fn test_rollback_by_commit_prefix() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    assert!(h.deploy_node("blog").await.is_success());

    let result = h
        .orchestrator
        .rollback("blog", Some("abc1234"), DeployOptions::default())
        .await;
    // Both releases share the commit; the newest match is the current one
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("already the current"));

    let result = h.orchestrator.rollback("blog", Some("v1"), DeployOptions::default()).await;
    assert!(result.is_success(), "{}", result.message);
}

#[tokio::test]
async fn test_rollback_to_current_is_rejected_without_engine_calls() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    h.runner.clear();

    let result = h.orchestrator.rollback("blog", Some("1"), DeployOptions::default()).await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("already the current"));

    let result = h.orchestrator.rollback("blog", None, DeployOptions::default()).await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_rollback_to_in_flight_release_is_rejected() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    let pending = h.prepare("blog", &NODE_FILES).await;
    h.runner.clear();

    let result = h
        .orchestrator
        .rollback("blog", Some(pending.id.to_string().as_str()), DeployOptions::default())
        .await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("pending"));
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_failed_rollback_keeps_target_release() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    assert!(h.deploy_node("blog").await.is_success());
    h.runner.respond("inspect --type container", ok("exited|\n"));

    let result = h.orchestrator.rollback("blog", None, DeployOptions::default()).await;
    assert_eq!(result.status, DeployStatus::Failed);

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(2));
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Success);
    assert!(h.orchestrator.store().app_layout("blog").release_dir(1).exists().await);
}

#[tokio::test]
async fn test_redeploying_finished_release_is_rejected() {
    let h = Harness::new().await;
    let first = h.prepare("blog", &NODE_FILES).await;
    assert!(h.deploy("blog", &first).await.is_success());
    assert!(h.deploy_node("blog").await.is_success());
    h.runner.respond("inspect --type container", ok("exited|\n"));
    h.runner.clear();

    let result = h.deploy("blog", &first).await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("rollback"), "{}", result.message);
    assert!(h.runner.calls().is_empty());

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.current_version_id, Some(2));
    assert_eq!(metadata.version(1).unwrap().status, ReleaseStatus::Success);
    assert!(first.release_dir.exists());
}

#[tokio::test]
async fn test_release_dir_must_match_version() {
    let h = Harness::new().await;
    let first = h.prepare("blog", &NODE_FILES).await;
    let second = h.prepare("blog", &NODE_FILES).await;

    let result = h
        .orchestrator
        .deploy("blog", &second.release_dir, first.id, DeployOptions::default())
        .await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("not the release directory"));
    assert!(h.runner.calls().is_empty());

    let metadata = h.orchestrator.store().load("blog").await.unwrap();
    assert_eq!(metadata.version(first.id).unwrap().status, ReleaseStatus::Pending);
    assert!(first.release_dir.exists() && second.release_dir.exists());
}

#[tokio::test]
async fn test_unsafe_deployment_id_is_rejected() {
    let h = Harness::new().await;
    let created = h.prepare("blog", &NODE_FILES).await;

    let result = h
        .orchestrator
        .deploy(
            "blog",
            &created.release_dir,
            created.id,
            DeployOptions {
                deployment_id: Some("../../escape".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(result.status, DeployStatus::Failed);
    assert!(result.message.contains("Invalid deployment id"));
    assert!(h.runner.calls().is_empty());
    assert!(h.orchestrator.deployment_log("../../escape").await.is_err());

    // The release is still there for a proper attempt
    assert!(h.deploy("blog", &created).await.is_success());
}

#[tokio::test]
async fn test_delete_app_stops_containers() {
    let h = Harness::new().await;
    assert!(h.deploy_node("blog").await.is_success());
    h.runner.clear();

    assert_ok!(h.orchestrator.delete_app("blog").await);
    assert!(h.runner.count("docker rm -f blog") >= 1);
    assert!(!h.app_dir("blog").exists());
    assert!(h.orchestrator.store().load("blog").await.is_err());
}
