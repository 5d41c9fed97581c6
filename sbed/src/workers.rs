//! Periodic worker supervision.
//!
//! Every background job is a closed-form loop: `(name, period, job)` plus a
//! shared stop signal. Jobs are synchronous (the storage layer is blocking)
//! and run on the blocking pool, so a slow iteration never starves the
//! HTTP runtime. On shutdown each worker finishes its in-flight iteration,
//! bounded by the drain deadline; stragglers are aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sbe_common::error::CoreError;

use crate::metrics;

/// Drain budget applied at shutdown.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

type Job = Arc<dyn Fn() -> Result<String, CoreError> + Send + Sync>;

pub struct WorkerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSet {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown, handles: Vec::new() }
    }

    /// Spawn a named periodic worker. The job runs once per period; errors
    /// are logged with worker context and never end the loop.
    pub fn spawn<F>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Result<String, CoreError> + Send + Sync + 'static,
    {
        let job: Job = Arc::new(job);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            info!(worker = name, period_secs = period.as_secs(), "worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let job = job.clone();
                let outcome = tokio::task::spawn_blocking(move || job()).await;
                match outcome {
                    Ok(Ok(summary)) => {
                        metrics::WORKER_ITERATIONS.with_label_values(&[name, "ok"]).inc();
                        if summary.is_empty() {
                            debug!(worker = name, "iteration complete");
                        } else {
                            debug!(worker = name, "{summary}");
                        }
                    }
                    Ok(Err(e)) => {
                        metrics::WORKER_ITERATIONS.with_label_values(&[name, "error"]).inc();
                        warn!(worker = name, "iteration failed: {e}");
                    }
                    Err(join_err) => {
                        metrics::WORKER_ITERATIONS.with_label_values(&[name, "panic"]).inc();
                        warn!(worker = name, "iteration panicked: {join_err}");
                    }
                }
            }
            info!(worker = name, "worker stopped");
        });
        self.handles.push((name, handle));
    }

    /// Signal every worker to stop and wait up to `drain` for in-flight
    /// iterations to finish.
    pub async fn shutdown(self, drain: Duration) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            match tokio::time::timeout(drain, handle).await {
                Ok(_) => debug!(worker = name, "drained"),
                Err(_) => {
                    warn!(worker = name, "did not drain within {}s, aborting", drain.as_secs());
                }
            }
        }
    }
}
