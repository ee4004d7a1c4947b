use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use api_gate::{ApiGate, CredentialPool, RateLimiter};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use batch_fetch::BatchFetcher;
use batch_runner::BatchRunner;
use chrono::Duration as ChronoDuration;
use completion_scheduler::CompletionScheduler;
use core_types::{BusMessage, MessageSink, TargetSource, WarStore};
use infra_bus::{JsonlSink, RingBus, RingBusSink};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use war_detector::{InWarSet, WarDetector};
use war_finalizer::{ApiWarProbe, FailureLog, Finalizer};
use war_store::SqliteWarStore;

use crate::clan_forward::ClanForwardTracker;
use crate::config_loader::{ApiConfig, BusConfig, SinkKind, TrackerConfig};
use crate::target_sources::{CadencedTargets, OpenWarLogTargets, RecentWarTargets};
use crate::war_loop::WarLoop;

pub(crate) fn build_gate(api: &ApiConfig, rate: u32) -> Result<ApiGate> {
    let pool = CredentialPool::new(&api.keys).context("api credentials")?;
    let limiter =
        RateLimiter::new(rate, Duration::from_millis(api.period_ms)).context("rate limit")?;
    Ok(ApiGate::new(pool, limiter))
}

pub(crate) fn open_store(db_path: &Path) -> Result<SqliteWarStore> {
    SqliteWarStore::open(db_path).with_context(|| format!("open store {}", db_path.display()))
}

/// `None` when forwarding is switched off.
pub(crate) fn build_sink(bus: &BusConfig) -> Option<Arc<dyn MessageSink>> {
    if !bus.enabled {
        tracing::info!("bus forwarding disabled");
        return None;
    }
    let sink: Arc<dyn MessageSink> = match bus.sink {
        SinkKind::Ring => Arc::new(RingBusSink::new(RingBus::<BusMessage>::new(bus.ring_capacity))),
        SinkKind::Jsonl => Arc::new(JsonlSink::new(&bus.spool_dir)),
    };
    Some(sink)
}

pub(crate) fn build_war_loop(cfg: &TrackerConfig, store: SqliteWarStore) -> Result<WarLoop> {
    let gate = build_gate(&cfg.api, cfg.api.rate)?;
    let fetcher = BatchFetcher::new(gate, cfg.fetch_config());
    let store: Arc<dyn WarStore> = Arc::new(store);
    let working_set = Arc::new(InWarSet::new());
    let failures = Arc::new(FailureLog::new());

    let finalizer = Finalizer::new(
        Arc::new(ApiWarProbe::new(fetcher.clone())?),
        store.clone(),
        working_set.clone(),
        failures.clone(),
        cfg.finalize_policy(),
    );
    let detector = WarDetector::new(working_set, Duration::from_secs(cfg.war.grace_secs));
    let source: Arc<dyn TargetSource> = Arc::new(CadencedTargets::new(
        Arc::new(RecentWarTargets::new(
            store.clone(),
            ChronoDuration::days(cfg.war.lookback_days),
        )),
        Arc::new(OpenWarLogTargets::new(store.clone())),
        cfg.war.open_war_log_every,
    ));

    Ok(WarLoop::new(
        source,
        fetcher,
        Arc::new(detector),
        store,
        CompletionScheduler::new(Arc::new(finalizer)),
        failures,
        Duration::from_secs(cfg.war.poll_interval_secs),
    ))
}

pub(crate) fn build_clan_runner(
    cfg: &TrackerConfig,
    store: SqliteWarStore,
) -> Result<BatchRunner<ClanForwardTracker>> {
    let gate = build_gate(&cfg.api, cfg.clans.rate)?;
    let fetcher = BatchFetcher::new(gate, cfg.fetch_config());
    let store = Arc::new(store);
    let tracker = ClanForwardTracker::new(fetcher, store.clone(), cfg.clans.enabled)?;
    Ok(BatchRunner::new(
        Arc::new(RecentWarTargets::new(
            store,
            ChronoDuration::days(cfg.war.lookback_days),
        )),
        Arc::new(tracker),
        build_sink(&cfg.bus),
        cfg.runner_config(),
    ))
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) service: &'static str,
    pub(crate) prometheus: PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    service: &'static str,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResp {
        status: "ok",
        service: state.service,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

pub(crate) async fn serve_http(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "http api started");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
