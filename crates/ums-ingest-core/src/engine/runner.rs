//! Drives a [`KafkaSource`] until shutdown.

use crate::config::RunnerConfig;
use crate::engine::{KafkaSource, Status};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

/// Linear backoff between empty or failed cycles.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Added per consecutive backoff (default: 1s)
    pub increment: Duration,
    /// Maximum delay cap (default: 5s)
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            increment: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with custom settings.
    pub fn new(increment: Duration, max_delay: Duration) -> Self {
        Self {
            increment,
            max_delay,
        }
    }

    /// Delay after `consecutive` backoffs in a row:
    /// min(max_delay, increment * consecutive)
    pub fn calculate_delay(&self, consecutive: u32) -> Duration {
        self.increment
            .saturating_mul(consecutive)
            .min(self.max_delay)
    }
}

impl From<&RunnerConfig> for BackoffPolicy {
    fn from(config: &RunnerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_increment_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

/// Calls `process()` repeatedly: again at once after READY, after a
/// growing sleep after BACKOFF, never again after a fatal error.
pub struct PollRunner {
    source: Arc<KafkaSource>,
    backoff: BackoffPolicy,
    shutdown_tx: broadcast::Sender<()>,
}

impl PollRunner {
    /// Create a runner for a started source.
    pub fn new(source: Arc<KafkaSource>, backoff: BackoffPolicy) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            source,
            backoff,
            shutdown_tx,
        }
    }

    /// Sender that ends [`PollRunner::run`] when signalled.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is signalled or the source reports a fatal error.
    ///
    /// The source is not stopped here; the caller owns its lifecycle.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_backoffs: u32 = 0;
        info!(topic = %self.source.topic(), "Poll runner started");

        loop {
            // A cycle is never cancelled midway; shutdown is checked between cycles
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                info!("Shutdown signal received");
                break;
            }

            match self.source.process().await {
                Ok(Status::Ready) => {
                    consecutive_backoffs = 0;
                }
                Ok(Status::Backoff) => {
                    consecutive_backoffs = consecutive_backoffs.saturating_add(1);
                    let delay = self.backoff.calculate_delay(consecutive_backoffs);
                    debug!(
                        consecutive = consecutive_backoffs,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("Shutdown signal received");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Source no longer running, poll runner exiting");
                    return Err(e);
                }
            }
        }

        info!(topic = %self.source.topic(), "Poll runner stopped");
        Ok(())
    }
}
