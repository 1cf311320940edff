//! Periodic trigger for the sequence processor.
//!
//! One scheduler per deployment drives the processor; the processor's run
//! lock additionally skips a tick that would overlap a run still in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::processor::SequenceProcessor;

pub struct SequenceScheduler {
    processor: Arc<SequenceProcessor>,
    interval: Duration,
}

/// Handle used to stop a spawned scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the loop to exit. An in-flight run
    /// finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sequence scheduler task ended abnormally");
        }
    }
}

impl SequenceScheduler {
    pub fn new(processor: Arc<SequenceProcessor>, interval: Duration) -> Self {
        Self {
            processor,
            interval,
        }
    }

    /// Spawn the polling loop as a Tokio task.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let interval_secs = self.interval.as_secs();

        let task = tokio::spawn(async move {
            info!(interval_secs, "Sequence scheduler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.processor.try_process().await.is_none() {
                            warn!("Previous sequence run still in flight, skipping tick");
                            metrics::counter!("sequences.skipped_ticks").increment(1);
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Sequence scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}
