use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use batch_fetch::{BatchFetcher, CURRENT_WAR_PATH};
use chrono::Utc;
use completion_scheduler::{CompletionScheduler, ScheduleError};
use core_types::{BulkWriteReport, TargetSource, WarStore};
use war_detector::WarDetector;
use war_finalizer::{FailureLog, Finalizer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CycleSummary {
    pub(crate) cycle: u64,
    pub(crate) targets: usize,
    pub(crate) eligible: usize,
    pub(crate) groups: usize,
    pub(crate) api_failures: usize,
    pub(crate) in_war: usize,
    pub(crate) registered: usize,
    pub(crate) scheduled: usize,
    pub(crate) tried_again: Vec<String>,
    pub(crate) store_failures: usize,
    pub(crate) finalize_failures: usize,
}

/// The war poll loop: fetch current wars for every eligible target, record
/// new wars and hand their finalization to the scheduler.
pub(crate) struct WarLoop {
    source: Arc<dyn TargetSource>,
    fetcher: BatchFetcher,
    detector: Arc<WarDetector>,
    store: Arc<dyn WarStore>,
    scheduler: CompletionScheduler<Finalizer>,
    failures: Arc<FailureLog>,
    poll_interval: Duration,
}

impl WarLoop {
    pub(crate) fn new(
        source: Arc<dyn TargetSource>,
        fetcher: BatchFetcher,
        detector: Arc<WarDetector>,
        store: Arc<dyn WarStore>,
        scheduler: CompletionScheduler<Finalizer>,
        failures: Arc<FailureLog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            fetcher,
            detector,
            store,
            scheduler,
            failures,
            poll_interval,
        }
    }

    pub(crate) fn scheduler(&self) -> &CompletionScheduler<Finalizer> {
        &self.scheduler
    }

    /// Loads identities of wars registered before a restart that have not
    /// ended yet, so they are not registered again.
    pub(crate) async fn preload(&self) -> anyhow::Result<usize> {
        let ids = self
            .store
            .pending_war_ids(Utc::now().timestamp())
            .await
            .context("load pending war ids")?;
        let count = ids.len();
        self.detector.preload_captured(ids);
        Ok(count)
    }

    pub(crate) async fn run_cycle(&self, cycle: u64) -> anyhow::Result<CycleSummary> {
        let started = Instant::now();
        let mut summary = CycleSummary {
            cycle,
            ..CycleSummary::default()
        };

        let targets = self.source.targets(cycle).await.context("list targets")?;
        summary.targets = targets.len();
        let eligible = self.detector.eligible(targets);
        summary.eligible = eligible.len();
        tracing::info!(cycle, targets = summary.targets, eligible = summary.eligible, "war cycle started");

        let groups = self.fetcher.partition(eligible);
        summary.groups = groups.len();
        for (index, group) in groups.iter().enumerate() {
            tracing::info!(group = index + 1, of = summary.groups, size = group.len(), "fetching group");
            let report = self
                .fetcher
                .fetch_group(group, CURRENT_WAR_PATH)
                .await
                .context("fetch group")?;
            summary.api_failures += report.not_found + report.forbidden + report.transport_errors;

            let detection = self.detector.detect(
                report
                    .fetched
                    .iter()
                    .map(|f| (f.target.as_str(), f.body.as_slice())),
                Utc::now(),
            );
            summary.in_war += detection.stats.registered + detection.stats.captured;
            summary.registered += detection.stats.registered;
            tracing::debug!(stats = ?detection.stats, "group detected");

            if !detection.records.is_empty() {
                let report = self.store.insert_wars(detection.records).await;
                summary.store_failures += count_failures("clan_wars", report);
            }
            if !detection.timers.is_empty() {
                let report = self.store.upsert_member_timers(detection.timers).await;
                summary.store_failures += count_failures("war_timer", report);
            }

            for job in detection.jobs {
                match self.scheduler.schedule(job) {
                    Ok(()) => summary.scheduled += 1,
                    Err(ScheduleError::Duplicate(key)) => summary.tried_again.push(key),
                }
            }

            if index + 1 < summary.groups {
                self.fetcher.pause_between_groups().await;
            }
        }

        let failures = self.failures.drain();
        summary.finalize_failures = failures.len();
        for failure in &failures {
            tracing::info!(key = %failure.key, reason = %failure.reason, "finalization failed");
        }

        metrics::gauge!("war.tracked").set(self.detector.working_set().len() as f64);
        metrics::gauge!("war.pending_jobs").set(self.scheduler.pending() as f64);
        metrics::histogram!("war.cycle_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        tracing::info!(
            cycle,
            api_failures = summary.api_failures,
            in_war = summary.in_war,
            registered = summary.registered,
            scheduled = summary.scheduled,
            tried_again = summary.tried_again.len(),
            store_failures = summary.store_failures,
            finalize_failures = summary.finalize_failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "war cycle complete"
        );
        if !summary.tried_again.is_empty() {
            tracing::debug!(keys = ?summary.tried_again, "jobs already pending");
        }
        Ok(summary)
    }

    pub(crate) async fn run(&self) {
        match self.preload().await {
            Ok(count) => tracing::info!(count, "pending wars preloaded"),
            Err(err) => tracing::error!(?err, "preload failed, wars may be registered twice"),
        }
        let mut cycle = 0u64;
        loop {
            cycle += 1;
            if let Err(err) = self.run_cycle(cycle).await {
                tracing::error!(cycle, ?err, "war cycle failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn count_failures(table: &str, report: anyhow::Result<BulkWriteReport>) -> usize {
    match report {
        Ok(report) => report.failures.len(),
        Err(err) => {
            tracing::error!(table, ?err, "bulk write failed");
            1
        }
    }
}
