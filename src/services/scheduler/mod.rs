//! Periodic builder tasks, each independently cancellable.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub interval: Duration,
    /// Wait after a failed run before trying again.
    pub retry_backoff: Duration,
}

struct PeriodicTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one tokio task per registered job.
#[derive(Default)]
pub struct Supervisor {
    tasks: HashMap<&'static str, PeriodicTask>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts running `job` right away and then on its schedule. A job
    /// registered twice replaces the earlier task.
    pub fn spawn(&mut self, job: Arc<dyn Job>, schedule: Schedule) {
        let name = job.name();
        let (cancel, cancelled) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(job, schedule, cancelled));

        info!(job = name, interval_secs = schedule.interval.as_secs(), "Scheduled job");
        if let Some(previous) = self.tasks.insert(name, PeriodicTask { cancel, handle }) {
            let _ = previous.cancel.send(true);
        }
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Stops one job, letting an in-flight run finish first.
    pub async fn cancel(&mut self, name: &str) -> bool {
        let Some(task) = self.tasks.remove(name) else {
            return false;
        };
        let _ = task.cancel.send(true);
        if let Err(e) = task.handle.await {
            warn!(job = name, error = %e, "Job task ended abnormally");
        }
        true
    }

    pub async fn shutdown(&mut self) {
        for task in self.tasks.values() {
            let _ = task.cancel.send(true);
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.drain().map(|(_, task)| task.handle).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Job task ended abnormally");
            }
        }
        info!("All scheduled jobs stopped");
    }
}

async fn run_periodic(job: Arc<dyn Job>, schedule: Schedule, mut cancelled: watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow() {
            break;
        }

        let started = std::time::Instant::now();
        let wait = match job.run().await {
            Ok(()) => {
                info!(job = job.name(), elapsed_ms = started.elapsed().as_millis() as u64, "Job run finished");
                schedule.interval
            }
            Err(e) => {
                error!(job = job.name(), error = %e, "Job run failed");
                schedule.retry_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = cancelled.changed() => {
                // A dropped sender means the supervisor is gone.
                if changed.is_err() || *cancelled.borrow() {
                    break;
                }
            }
        }
    }
    info!(job = job.name(), "Job stopped");
}
