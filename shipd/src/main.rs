//! shipd - Entry Point
//!
//! Operator commands for the single-node deployment orchestrator.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use futures::StreamExt;
use tracing::error;

use shipd::app::options::OrchestratorOptions;
use shipd::app::state::{Collaborators, Orchestrator};
use shipd::deploy::pipeline::{DeployOptions, DeployResult, DeployStatus};
use shipd::filesys::file::File;
use shipd::logs::{init_logging, LogOptions};
use shipd::storage::settings::Settings;
use shipd::storage::versions::VersionsView;
use shipd::utils::version_info;

const DEFAULT_SETTINGS_FILE: &str = "/etc/shipd/settings.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            cli_args.insert(key.trim_start_matches('-').to_string(), value.to_string());
        } else if arg.starts_with("--") {
            cli_args.insert(arg.trim_start_matches('-').to_string(), "true".to_string());
        }
    }

    if cli_args.contains_key("version") {
        let version = version_info();
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("shipd {}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let settings_path = cli_args
        .get("settings")
        .cloned()
        .unwrap_or_else(|| DEFAULT_SETTINGS_FILE.to_string());
    let settings = match load_settings(&settings_path).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {}", "Unable to read settings:".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
        log_dir: Some(PathBuf::from(&settings.logs_dir)),
        ..Default::default()
    };
    let _guard = match init_logging(log_options.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize file logging: {e}");
            init_logging(LogOptions {
                log_dir: None,
                ..log_options
            })
            .ok()
            .flatten()
        }
    };

    let orchestrator = match Orchestrator::init(OrchestratorOptions::from(&settings), Collaborators::default()).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to initialize orchestrator: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        return run_diagnostic(&orchestrator).await;
    }

    if let Some(app) = cli_args.get("versions") {
        return match orchestrator.list_versions(app).await {
            Ok(view) => {
                print_versions(&view);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                ExitCode::FAILURE
            }
        };
    }

    if let Some(app) = cli_args.get("rollback") {
        let target = cli_args.get("target").map(String::as_str);
        let result = rollback_with_progress(&orchestrator, app, target).await;
        print_result(&result);
        return if result.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    eprintln!("Usage: shipd [--settings=<file>] --version | --diagnostic | --versions=<app> | --rollback=<app> [--target=<id|commit|digest|ref>]");
    ExitCode::FAILURE
}

async fn load_settings(path: &str) -> Result<Settings, shipd::errors::ShipError> {
    let file = File::new(path);
    if !file.exists().await {
        eprintln!("Settings file {} not found, using defaults", path);
        return Ok(Settings::default());
    }
    file.read_json().await
}

async fn run_diagnostic(orchestrator: &Orchestrator) -> ExitCode {
    let version = version_info();
    println!("shipd {} ({}, built {})", version.version, version.git_hash, version.build_time);

    let mut ok = true;
    match orchestrator.gateway().system_df().await {
        Ok(usage) => {
            println!("{} container engine reachable", "✓".green());
            print!("{}", usage);
        }
        Err(e) => {
            ok = false;
            println!("{} container engine: {}", "✗".red(), e);
        }
    }

    match orchestrator.store().list_apps().await {
        Ok(apps) => {
            println!("{} {} application(s) registered", "✓".green(), apps.len());
            for app in apps {
                println!("  - {}", app.name);
            }
        }
        Err(e) => {
            ok = false;
            println!("{} application store: {}", "✗".red(), e);
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn rollback_with_progress(orchestrator: &Orchestrator, app: &str, target: Option<&str>) -> DeployResult {
    let deployment_id = orchestrator.new_deployment_id();
    let printer = orchestrator.subscribe_stream(&deployment_id).map(|lines| {
        tokio::spawn(async move {
            futures::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                println!("{} {}", format!("[{}]", line.level).dimmed(), line.message);
            }
        })
    });

    let options = DeployOptions {
        deployment_id: Some(deployment_id),
        ..Default::default()
    };
    let result = orchestrator.rollback(app, target, options).await;

    // Rejected rollbacks return before the pipeline closes the stream
    orchestrator.streams().finish(&result.deployment_id);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    result
}

fn print_result(result: &DeployResult) {
    let status = match result.status {
        DeployStatus::Succeeded => "succeeded".green().bold(),
        DeployStatus::Failed => "failed".red().bold(),
        DeployStatus::Cancelled => "cancelled".yellow().bold(),
    };
    println!(
        "{} {} in {:.1}s: {}",
        result.app.bold(),
        status,
        result.duration.as_secs_f64(),
        result.message
    );
}

fn print_versions(view: &VersionsView) {
    println!(
        "{} ({} strategy)",
        view.app.bold(),
        format!("{:?}", view.strategy).to_lowercase()
    );
    for release in &view.versions {
        let marker = if view.current_version_id == Some(release.id) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        let commit: String = release.commit.chars().take(10).collect();
        println!(
            "{} v{:<4} {:<10} {:<12} {:<10} {}",
            marker,
            release.id,
            release.status,
            commit,
            release.branch,
            release.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    for release in &view.image_releases {
        let marker = if view.current_image_release_id == Some(release.id) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!(
            "{} #{:<4} {} {} {}:{}",
            marker,
            release.id,
            release.image_ref,
            release.image_digest.as_deref().unwrap_or("-"),
            release.host_port,
            release.container_port
        );
    }
}
