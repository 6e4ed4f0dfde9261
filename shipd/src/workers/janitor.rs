//! Sweeps idle log streams and cancellation entries

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use crate::stream::cancel::CancellationRegistry;
use crate::stream::logs::LogStreams;

/// Janitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,

    /// Entries idle for longer than this are dropped
    pub idle_ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

/// One sweep, leaving running deployments alone; returns how many streams and cancellation entries went away
pub fn sweep(options: &Options, streams: &LogStreams, cancels: &CancellationRegistry) -> (usize, usize) {
    let dropped_streams = streams
        .sweep(options.idle_ttl, |id| cancels.is_running(id))
        .len();
    let dropped_cancels = cancels.sweep(options.idle_ttl);
    if dropped_streams + dropped_cancels > 0 {
        debug!(
            "Janitor dropped {} idle streams and {} cancellation entries",
            dropped_streams, dropped_cancels
        );
    }
    (dropped_streams, dropped_cancels)
}

/// Run the janitor worker
pub async fn run<S, F>(
    options: &Options,
    streams: &LogStreams,
    cancels: &CancellationRegistry,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Janitor worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Janitor worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        sweep(options, streams, cancels);
    }
}
