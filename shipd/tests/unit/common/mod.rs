//! Shared fakes for orchestrator tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;

use shipd::app::options::OrchestratorOptions;
use shipd::app::state::{Collaborators, Orchestrator};
use shipd::deploy::hooks::{
    CredentialResolver, FetchedSource, ProxyRegenerator, RegistryCredential, SourceFetcher,
};
use shipd::deploy::pipeline::{DeployOptions, DeployResult};
use shipd::deploy::ports::PortProbe;
use shipd::engine::health::HealthOptions;
use shipd::engine::runner::{CommandOutput, CommandRunner, CommandSpec};
use shipd::errors::ShipError;
use shipd::models::release::RegistryProvider;
use shipd::storage::layout::StorageLayout;
use shipd::storage::versions::CreatedVersion;

pub const NODE_CONFIG: &str = "port: 3000\nstart: node server.js\n";
pub const DIGEST: &str = "sha256:4f1d2c8e9a7b";

/// A command the fake runner received
#[derive(Debug, Clone)]
pub struct Call {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub env_keys: Vec<String>,
}

impl Call {
    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Scripted command runner.
///
/// Responses match when the command line contains the pattern; the most
/// recently added match wins. Unmatched commands succeed with no output.
pub struct FakeRunner {
    calls: Mutex<Vec<Call>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl FakeRunner {
    /// Runner whose containers come up running and whose images have a digest
    pub fn new() -> Arc<Self> {
        let runner = Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        });
        runner.respond("inspect --type container", ok("running|\n"));
        runner.respond(
            "image inspect --format",
            ok(&format!("registry.example.com/app@{}\n", DIGEST)),
        );
        runner
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output));
    }

    /// Run `hook` every time a command matching `pattern` is received
    pub fn on(&self, pattern: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((pattern.to_string(), Arc::new(hook)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Call::line).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn find(&self, pattern: &str) -> Option<Call> {
        self.calls().into_iter().find(|c| c.line().contains(pattern))
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ShipError> {
        let call = Call {
            program: spec.program.clone(),
            args: spec.args.clone(),
            stdin: spec.stdin.as_ref().map(|s| s.expose_secret().to_string()),
            env_keys: spec.secret_env.iter().map(|(k, _)| k.clone()).collect(),
        };
        let line = call.line();
        self.calls.lock().unwrap().push(call);

        let hooks: Vec<Hook> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook();
        }

        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| ok("")))
    }
}

/// Port probe over a fixed set of bound ports
#[derive(Default)]
pub struct FakeProbe {
    bound: Mutex<HashSet<u16>>,
}

impl FakeProbe {
    pub fn bind(&self, port: u16) {
        self.bound.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_bound(&self, port: u16) -> bool {
        self.bound.lock().unwrap().contains(&port)
    }
}

/// Proxy regenerator counting its invocations
#[derive(Default)]
pub struct RecordingProxy {
    pub calls: AtomicUsize,
}

impl RecordingProxy {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyRegenerator for RecordingProxy {
    async fn regenerate(&self, _app: &str) -> Result<(), ShipError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Credentials keyed by id
#[derive(Default)]
pub struct StaticCredentials {
    entries: Mutex<HashMap<String, (String, String, String, RegistryProvider)>>,
}

impl StaticCredentials {
    pub fn insert(&self, id: &str, server: &str, username: &str, password: &str, provider: RegistryProvider) {
        self.entries.lock().unwrap().insert(
            id.to_string(),
            (
                server.to_string(),
                username.to_string(),
                password.to_string(),
                provider,
            ),
        );
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, credential_id: &str) -> Result<RegistryCredential, ShipError> {
        let entries = self.entries.lock().unwrap();
        let (server, username, password, provider) = entries
            .get(credential_id)
            .cloned()
            .ok_or_else(|| ShipError::NotFound(format!("credential {}", credential_id)))?;
        Ok(RegistryCredential {
            server,
            username: username.clone(),
            password: SecretString::from(password),
            provider,
            access_key_id: (provider == RegistryProvider::Ecr).then_some(username),
        })
    }
}

/// Fetcher writing a fixed file set into the release
pub struct FakeFetcher {
    pub files: Vec<(String, String)>,
    pub commit: String,
    pub fail: bool,
}

impl Default for FakeFetcher {
    fn default() -> Self {
        Self {
            files: vec![
                ("deploy.yml".to_string(), NODE_CONFIG.to_string()),
                ("package.json".to_string(), "{}".to_string()),
            ],
            commit: "9c1e5a7d3b2f".to_string(),
            fail: false,
        }
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, _remote: &str, _reference: &str, target: &Path) -> Result<FetchedSource, ShipError> {
        if self.fail {
            return Err(ShipError::EngineError("remote branch not found".to_string()));
        }
        for (name, contents) in &self.files {
            tokio::fs::write(target.join(name), contents).await?;
        }
        Ok(FetchedSource {
            commit: self.commit.clone(),
        })
    }
}

/// An orchestrator over a temporary root with fake collaborators
pub struct Harness {
    pub tmp: TempDir,
    pub runner: Arc<FakeRunner>,
    pub probe: Arc<FakeProbe>,
    pub proxy: Arc<RecordingProxy>,
    pub credentials: Arc<StaticCredentials>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(|_| {}, FakeFetcher::default()).await
    }

    pub async fn with(configure: impl FnOnce(&mut OrchestratorOptions), fetcher: FakeFetcher) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = OrchestratorOptions {
            layout: StorageLayout::rooted_at(tmp.path()),
            ..Default::default()
        };
        options.pipeline.health = HealthOptions {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        };
        configure(&mut options);

        let runner = FakeRunner::new();
        let probe = Arc::new(FakeProbe::default());
        let proxy = Arc::new(RecordingProxy::default());
        let credentials = Arc::new(StaticCredentials::default());
        let collaborators = Collaborators {
            runner: runner.clone(),
            fetcher: Arc::new(fetcher),
            credentials: credentials.clone(),
            proxy: proxy.clone(),
            ports: probe.clone(),
        };
        let orchestrator = Orchestrator::init(options, collaborators).await.unwrap();

        Self {
            tmp,
            runner,
            probe,
            proxy,
            credentials,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Create a release of `app` holding `files`
    pub async fn prepare(&self, app: &str, files: &[(&str, &str)]) -> CreatedVersion {
        let created = self
            .orchestrator
            .create_version(app, "abc1234def", "main")
            .await
            .unwrap();
        for (name, contents) in files {
            let path = created.release_dir.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.unwrap();
            }
            tokio::fs::write(path, contents).await.unwrap();
        }
        created
    }

    pub async fn deploy(&self, app: &str, created: &CreatedVersion) -> DeployResult {
        self.orchestrator
            .deploy(app, &created.release_dir, created.id, DeployOptions::default())
            .await
    }

    /// Prepare and deploy a plain node release
    pub async fn deploy_node(&self, app: &str) -> DeployResult {
        let created = self
            .prepare(app, &[("deploy.yml", NODE_CONFIG), ("package.json", "{}")])
            .await;
        self.deploy(app, &created).await
    }

    pub fn app_dir(&self, app: &str) -> std::path::PathBuf {
        self.orchestrator.store().app_layout(app).app_dir
    }
}
