//! Per-deployment log broadcast with a durable copy on disk

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::errors::ShipError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::is_valid_deployment_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LineLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineLevel::Info => write!(f, "INFO"),
            LineLevel::Warn => write!(f, "WARN"),
            LineLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One progress line of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub deployment_id: String,
    /// Emission order within the deployment, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LineLevel,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.message
        )
    }
}

#[derive(Debug)]
struct StreamEntry {
    /// Dropped when the deployment finishes so subscribers see the end
    sender: Option<broadcast::Sender<LogLine>>,
    seq: u64,
    last_activity: Instant,
}

/// Registry of deployment log channels
#[derive(Debug)]
pub struct LogStreams {
    dir: Dir,
    capacity: usize,
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl LogStreams {
    pub fn new(dir: Dir, capacity: usize) -> Self {
        Self {
            dir,
            capacity: capacity.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Durable log file of a deployment
    pub fn log_file(&self, deployment_id: &str) -> Result<File, ShipError> {
        if !is_valid_deployment_id(deployment_id) {
            return Err(ShipError::ValidationError(format!(
                "Invalid deployment id '{}'",
                deployment_id
            )));
        }
        Ok(self.dir.file(&format!("{}.log", deployment_id)))
    }

    /// Register a channel for a deployment; a no-op when already open
    pub fn open(&self, deployment_id: &str) {
        let capacity = self.capacity;
        self.streams()
            .entry(deployment_id.to_string())
            .or_insert_with(|| StreamEntry {
                sender: Some(broadcast::channel(capacity).0),
                seq: 0,
                last_activity: Instant::now(),
            });
    }

    /// Receive every line emitted from now on
    pub fn subscribe(&self, deployment_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        let mut streams = self.streams();
        let entry = streams.get_mut(deployment_id)?;
        entry.last_activity = Instant::now();
        entry.sender.as_ref().map(|sender| sender.subscribe())
    }

    /// Like [`subscribe`](Self::subscribe), as a stream that ends with the deployment.
    /// Lines a slow subscriber missed are skipped.
    pub fn subscribe_stream(&self, deployment_id: &str) -> Option<impl Stream<Item = LogLine>> {
        let receiver = self.subscribe(deployment_id)?;
        Some(stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(line) => return Some((line, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Log subscriber lagged, skipped {} lines", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    /// Publish a line to subscribers and append it to the durable log
    pub async fn emit(&self, deployment_id: &str, level: LineLevel, message: &str) -> LogLine {
        let line = {
            let mut streams = self.streams();
            let capacity = self.capacity;
            let entry = streams
                .entry(deployment_id.to_string())
                .or_insert_with(|| StreamEntry {
                    sender: Some(broadcast::channel(capacity).0),
                    seq: 0,
                    last_activity: Instant::now(),
                });
            entry.seq += 1;
            entry.last_activity = Instant::now();
            let line = LogLine {
                deployment_id: deployment_id.to_string(),
                seq: entry.seq,
                timestamp: Utc::now(),
                level,
                message: message.to_string(),
            };
            if let Some(sender) = &entry.sender {
                // No receivers is fine
                let _ = sender.send(line.clone());
            }
            line
        };

        let written = match self.log_file(deployment_id) {
            Ok(file) => file.append_line(&line.to_string()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to write deployment log for {}: {}", deployment_id, e);
        }
        line
    }

    /// Close the channel; the entry lingers until swept
    pub fn finish(&self, deployment_id: &str) {
        if let Some(entry) = self.streams().get_mut(deployment_id) {
            entry.sender = None;
            entry.last_activity = Instant::now();
        }
    }

    pub fn is_open(&self, deployment_id: &str) -> bool {
        self.streams()
            .get(deployment_id)
            .is_some_and(|entry| entry.sender.is_some())
    }

    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop streams idle for longer than `max_idle` unless `in_use` claims
    /// them; returns the dropped ids
    pub fn sweep(&self, max_idle: Duration, in_use: impl Fn(&str) -> bool) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.streams().retain(|id, entry| {
            let keep = now.duration_since(entry.last_activity) < max_idle || in_use(id);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    /// Full durable log of a deployment
    pub async fn read_log(&self, deployment_id: &str) -> Result<String, ShipError> {
        let file = self.log_file(deployment_id)?;
        if !file.exists().await {
            return Err(ShipError::NotFound(format!(
                "No log for deployment {}",
                deployment_id
            )));
        }
        file.read_string().await
    }
}

/// Log handle of one running deployment.
///
/// Lines go to subscribers, to the durable log and to tracing.
#[derive(Debug, Clone)]
pub struct DeploymentLog {
    streams: Arc<LogStreams>,
    deployment_id: String,
    app: String,
}

impl DeploymentLog {
    pub fn new(streams: Arc<LogStreams>, deployment_id: &str, app: &str) -> Self {
        streams.open(deployment_id);
        Self {
            streams,
            deployment_id: deployment_id.to_string(),
            app: app.to_string(),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(app = %self.app, deployment = %self.deployment_id, "{}", message);
        self.streams
            .emit(&self.deployment_id, LineLevel::Info, message)
            .await;
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!(app = %self.app, deployment = %self.deployment_id, "{}", message);
        self.streams
            .emit(&self.deployment_id, LineLevel::Warn, message)
            .await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!(app = %self.app, deployment = %self.deployment_id, "{}", message);
        self.streams
            .emit(&self.deployment_id, LineLevel::Error, message)
            .await;
    }

    pub fn finish(&self) {
        self.streams.finish(&self.deployment_id);
    }
}
