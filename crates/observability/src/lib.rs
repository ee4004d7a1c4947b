use std::sync::OnceLock;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

/// Installs the Prometheus recorder on first call; later calls return the
/// same handle.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    describe_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!("fetch.ok", "Fetches answered with 200");
    metrics::describe_counter!("fetch.forbidden", "Fetches answered with 403");
    metrics::describe_counter!("fetch.not_found", "Fetches answered with 404");
    metrics::describe_counter!(
        "fetch.transport_error",
        "Fetches that timed out, failed to connect or got an unexpected status"
    );
    metrics::describe_histogram!("fetch.group_ms", "Wall time of one fetch group");

    metrics::describe_counter!("detector.decode_error", "Payloads that failed to decode");
    metrics::describe_counter!("detector.registered", "Newly registered wars");

    metrics::describe_counter!("scheduler.fired", "Finalization jobs fired on time");
    metrics::describe_counter!("scheduler.missed", "Finalization jobs past their grace window");
    metrics::describe_counter!("scheduler.duplicate", "Rejected duplicate finalization jobs");

    metrics::describe_counter!("finalizer.done", "Wars stored with their final result");
    metrics::describe_counter!("finalizer.failed", "Finalizations that ended in failure");
    metrics::describe_counter!(
        "finalizer.maintenance_backoff",
        "Finalization waits caused by upstream maintenance"
    );

    metrics::describe_counter!("store.write_failure", "Items rejected by bulk writes");

    metrics::describe_counter!("bus.sent", "Messages published in process");
    metrics::describe_counter!("bus.dropped", "Messages dropped for lack of subscribers");
    metrics::describe_counter!("bus.spooled", "Messages appended to the jsonl spool");
    metrics::describe_counter!("bus.spool_error", "Spool appends that failed");

    metrics::describe_counter!("runner.items", "Items processed by batch runners");
    metrics::describe_counter!("runner.messages", "Messages produced by batch runners");
    metrics::describe_counter!("runner.errors", "Item failures in batch runners");
    metrics::describe_histogram!("runner.cycle_ms", "Wall time of one runner cycle");

    metrics::describe_gauge!("war.tracked", "Targets currently in a tracked war");
    metrics::describe_gauge!("war.pending_jobs", "Finalization jobs waiting or running");
    metrics::describe_histogram!("war.cycle_ms", "Wall time of one war poll cycle");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_installed_once() {
        let first = init_metrics().expect("install");
        let second = init_metrics().expect("reuse");
        metrics::counter!("fetch.ok").increment(1);
        assert!(first.render().contains("fetch_ok"));
        assert_eq!(first.render(), second.render());
    }
}
