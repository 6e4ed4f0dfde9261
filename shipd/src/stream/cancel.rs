//! Cooperative cancellation of in-flight deployments

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::errors::ShipError;

type CancelCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelEntry {
    cancelled: bool,
    /// Set while a pipeline works on the deployment; never swept
    running: bool,
    callbacks: Vec<CancelCallback>,
    last_activity: Option<Instant>,
}

impl CancelEntry {
    fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }
}

/// Cancellation flags and cleanup callbacks keyed by deployment id
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<String, CancelEntry>>,
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a deployment
    pub fn register(&self, deployment_id: &str) {
        self.entries()
            .entry(deployment_id.to_string())
            .or_default()
            .touch();
    }

    /// Track a deployment whose pipeline is starting. It stays cancellable
    /// until [`unregister`](Self::unregister), however long it runs.
    pub fn begin(&self, deployment_id: &str) {
        let mut entries = self.entries();
        let entry = entries.entry(deployment_id.to_string()).or_default();
        entry.running = true;
        entry.touch();
    }

    pub fn is_running(&self, deployment_id: &str) -> bool {
        self.entries()
            .get(deployment_id)
            .is_some_and(|entry| entry.running)
    }

    /// Run `callback` when the deployment gets cancelled, or right away
    /// when it already is
    pub fn on_cancel(&self, deployment_id: &str, callback: impl FnOnce() + Send + 'static) {
        let mut entries = self.entries();
        let entry = entries.entry(deployment_id.to_string()).or_default();
        entry.touch();
        if entry.cancelled {
            drop(entries);
            callback();
        } else {
            entry.callbacks.push(Box::new(callback));
        }
    }

    /// Flag a deployment as cancelled. Returns false for unknown ids.
    pub fn cancel(&self, deployment_id: &str) -> bool {
        let callbacks = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(deployment_id) else {
                return false;
            };
            entry.cancelled = true;
            entry.touch();
            std::mem::take(&mut entry.callbacks)
        };

        info!("Cancellation requested for deployment {}", deployment_id);
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn is_cancelled(&self, deployment_id: &str) -> bool {
        self.entries()
            .get(deployment_id)
            .is_some_and(|entry| entry.cancelled)
    }

    /// Fail with [`ShipError::Cancelled`] when the deployment was cancelled
    pub fn checkpoint(&self, deployment_id: &str) -> Result<(), ShipError> {
        let cancelled = match self.entries().get_mut(deployment_id) {
            Some(entry) => {
                entry.touch();
                entry.cancelled
            }
            None => false,
        };
        if cancelled {
            debug!("Deployment {} hit a cancellation checkpoint", deployment_id);
            return Err(ShipError::Cancelled);
        }
        Ok(())
    }

    /// Stop tracking; pending callbacks are dropped
    pub fn unregister(&self, deployment_id: &str) {
        self.entries().remove(deployment_id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries idle for longer than `max_idle`, except running ones
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.running
                || entry
                    .last_activity
                    .is_some_and(|at| now.duration_since(at) < max_idle)
        });
        before - entries.len()
    }
}
