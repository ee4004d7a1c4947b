use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::FinalizationJob;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::Instant;

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn fire(&self, job: FinalizationJob);

    /// Called instead of `fire` when the job woke up later than its grace
    /// window allows.
    async fn missed(&self, job: FinalizationJob, lateness: Duration);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("job {0} is already pending")]
    Duplicate(String),
}

#[derive(Debug)]
struct PendingJob {
    fire_at: DateTime<Utc>,
    abort: AbortHandle,
}

/// Lateness of a wake-up relative to its due instant, if it exceeds the
/// grace window.
pub fn misfire(due: Instant, woke: Instant, grace: Duration) -> Option<Duration> {
    let lateness = woke.saturating_duration_since(due);
    (lateness > grace).then_some(lateness)
}

/// One-shot, in-memory scheduler for war finalization. Jobs are keyed by
/// [`FinalizationJob::key`]; a key stays taken from scheduling until the
/// job has finished running.
pub struct CompletionScheduler<H: JobHandler> {
    handler: Arc<H>,
    pending: Arc<DashMap<String, PendingJob>>,
}

impl<H: JobHandler> Clone for CompletionScheduler<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            pending: self.pending.clone(),
        }
    }
}

struct KeyRelease {
    pending: Arc<DashMap<String, PendingJob>>,
    key: String,
}

impl Drop for KeyRelease {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

impl<H: JobHandler> CompletionScheduler<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn fire_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.pending.get(key).map(|p| p.fire_at)
    }

    /// Registers `job` to run at `job.fire_at` (immediately if that already
    /// passed). A job whose key is still pending is rejected untouched.
    pub fn schedule(&self, job: FinalizationJob) -> Result<(), ScheduleError> {
        let key = job.key();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                metrics::counter!("scheduler.duplicate").increment(1);
                Err(ScheduleError::Duplicate(key))
            }
            Entry::Vacant(slot) => {
                let delay = (job.fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let due = Instant::now() + delay;
                let fire_at = job.fire_at;
                let handler = self.handler.clone();
                let release = KeyRelease {
                    pending: self.pending.clone(),
                    key,
                };
                let task = tokio::spawn(async move {
                    let guard = release;
                    tokio::time::sleep_until(due).await;
                    if let Some(lateness) = misfire(due, Instant::now(), job.grace) {
                        metrics::counter!("scheduler.missed").increment(1);
                        tracing::warn!(
                            key = %guard.key,
                            lateness_s = lateness.as_secs(),
                            "finalization job missed its grace window"
                        );
                        handler.missed(job, lateness).await;
                        return;
                    }
                    metrics::counter!("scheduler.fired").increment(1);
                    handler.fire(job).await;
                });
                slot.insert(PendingJob {
                    fire_at,
                    abort: task.abort_handle(),
                });
                Ok(())
            }
        }
    }

    /// Aborts every pending job. Used on process shutdown.
    pub fn shutdown(&self) {
        for entry in self.pending.iter() {
            entry.abort.abort();
        }
    }
}
