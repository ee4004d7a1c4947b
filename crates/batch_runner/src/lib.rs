use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use core_types::{BusMessage, MessageSink, TargetId, TargetSource};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    pub messages: Vec<BusMessage>,
}

/// Per-target work plugged into a [`BatchRunner`].
#[async_trait]
pub trait Tracker: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Cycles are skipped entirely while this returns `false`.
    fn allowed(&self) -> bool {
        true
    }

    async fn track(&self, target: &TargetId) -> anyhow::Result<TrackOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 50_000,
            concurrency: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleMetrics {
    pub cycle: u64,
    pub items: usize,
    pub messages: usize,
    pub errors: usize,
    pub skipped: bool,
    pub elapsed: Duration,
}

pub struct BatchRunner<T: Tracker> {
    source: Arc<dyn TargetSource>,
    tracker: Arc<T>,
    sink: Option<Arc<dyn MessageSink>>,
    cfg: RunnerConfig,
}

impl<T: Tracker> BatchRunner<T> {
    /// `sink = None` runs the tracker without forwarding its messages.
    pub fn new(
        source: Arc<dyn TargetSource>,
        tracker: Arc<T>,
        sink: Option<Arc<dyn MessageSink>>,
        cfg: RunnerConfig,
    ) -> Self {
        Self {
            source,
            tracker,
            sink,
            cfg,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.cfg
    }

    pub async fn run_cycle(&self, cycle: u64) -> anyhow::Result<CycleMetrics> {
        let started = Instant::now();
        let mut out = CycleMetrics {
            cycle,
            ..CycleMetrics::default()
        };
        if !self.tracker.allowed() {
            out.skipped = true;
            tracing::debug!(tracker = self.tracker.name(), cycle, "cycle skipped");
            return Ok(out);
        }

        let targets = self
            .source
            .targets(cycle)
            .await
            .with_context(|| format!("{}: list targets", self.tracker.name()))?;

        for batch in targets.chunks(self.cfg.batch_size.max(1)) {
            self.run_batch(batch, &mut out).await?;
        }

        out.elapsed = started.elapsed();
        let name = self.tracker.name().to_string();
        metrics::counter!("runner.items", "tracker" => name.clone()).increment(out.items as u64);
        metrics::counter!("runner.messages", "tracker" => name.clone())
            .increment(out.messages as u64);
        metrics::counter!("runner.errors", "tracker" => name.clone()).increment(out.errors as u64);
        metrics::histogram!("runner.cycle_ms", "tracker" => name)
            .record(out.elapsed.as_secs_f64() * 1_000.0);
        tracing::info!(
            tracker = self.tracker.name(),
            cycle,
            items = out.items,
            messages = out.messages,
            errors = out.errors,
            elapsed_ms = out.elapsed.as_millis() as u64,
            "cycle complete"
        );
        Ok(out)
    }

    async fn run_batch(&self, batch: &[TargetId], out: &mut CycleMetrics) -> anyhow::Result<()> {
        let slots = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for target in batch {
            let permit = slots.clone().acquire_owned().await?;
            let tracker = self.tracker.clone();
            let sink = self.sink.clone();
            let target = target.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = tracker.track(&target).await?;
                let sent = outcome.messages.len();
                if let Some(sink) = sink {
                    for message in outcome.messages {
                        sink.send(message).await?;
                    }
                }
                anyhow::Ok(sent)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            out.items += 1;
            match joined {
                Ok(Ok(sent)) => out.messages += sent,
                Ok(Err(err)) => {
                    out.errors += 1;
                    tracing::debug!(tracker = self.tracker.name(), ?err, "item failed");
                }
                Err(err) => {
                    out.errors += 1;
                    tracing::warn!(tracker = self.tracker.name(), ?err, "item task aborted");
                }
            }
        }
        Ok(())
    }

    /// Runs a cycle every `interval` until the task is dropped. A failing
    /// cycle is logged and the next tick starts over.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle = 0u64;
        loop {
            ticker.tick().await;
            cycle += 1;
            if let Err(err) = self.run_cycle(cycle).await {
                tracing::error!(tracker = self.tracker.name(), cycle, ?err, "cycle failed");
            }
        }
    }
}
