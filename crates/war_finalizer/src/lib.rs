use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use completion_scheduler::JobHandler;
use core_types::{FinalizationJob, FinalizedWar, TargetId, WarIdentity, WarStore};
use parking_lot::Mutex;
use war_detector::InWarSet;

pub mod machine;
pub mod probe;

pub use machine::{FailureReason, Finished, Phase, Policy, ProbeResponse};
pub use probe::{ApiWarProbe, WarProbe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeFailure {
    pub key: String,
    pub identity: WarIdentity,
    pub reason: FailureReason,
}

/// Failures accumulated between two drains by the poll loop.
#[derive(Debug, Default)]
pub struct FailureLog {
    entries: Mutex<Vec<FinalizeFailure>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failure: FinalizeFailure) {
        self.entries.lock().push(failure);
    }

    pub fn drain(&self) -> Vec<FinalizeFailure> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Stored(WarIdentity),
    Failed(FailureReason),
}

/// Releases a war's participants when finalization ends, however it ends.
struct PairRelease {
    working_set: Arc<InWarSet>,
    tag: TargetId,
    opponent: TargetId,
}

impl Drop for PairRelease {
    fn drop(&mut self) {
        self.working_set.release_pair(&self.tag, &self.opponent);
    }
}

pub struct Finalizer {
    probe: Arc<dyn WarProbe>,
    store: Arc<dyn WarStore>,
    working_set: Arc<InWarSet>,
    failures: Arc<FailureLog>,
    policy: Policy,
}

impl Finalizer {
    pub fn new(
        probe: Arc<dyn WarProbe>,
        store: Arc<dyn WarStore>,
        working_set: Arc<InWarSet>,
        failures: Arc<FailureLog>,
        policy: Policy,
    ) -> Self {
        Self {
            probe,
            store,
            working_set,
            failures,
            policy,
        }
    }

    pub fn failures(&self) -> &Arc<FailureLog> {
        &self.failures
    }

    /// Drives one job to a terminal phase, persisting the ended war on
    /// success. Both participants leave the working set on return.
    pub async fn finalize(&self, job: FinalizationJob) -> FinalizeOutcome {
        let _release = PairRelease {
            working_set: self.working_set.clone(),
            tag: job.tag.clone(),
            opponent: job.opponent_tag.clone(),
        };

        let mut phase = Phase::start(job.tag.clone(), job.opponent_tag.clone());
        loop {
            phase = match phase {
                Phase::Probing { cursor, delay } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let response = self.probe.probe(&cursor.tag).await;
                    machine::on_probe(cursor, response, job.preparation_start, &self.policy)
                }
                Phase::SwitchTag(cursor) => {
                    tracing::debug!(from = %cursor.tag, to = %cursor.other, "switching probe tag");
                    machine::advance(Phase::SwitchTag(cursor))
                }
                Phase::Backoff(cursor) => {
                    tracing::warn!(
                        tag = %cursor.tag,
                        backoffs = cursor.backoffs,
                        "api in maintenance, backing off"
                    );
                    metrics::counter!("finalizer.maintenance_backoff").increment(1);
                    tokio::time::sleep(self.policy.maintenance_backoff).await;
                    machine::advance(Phase::Backoff(cursor))
                }
                Phase::Done(finished) => return self.persist(&job, *finished).await,
                Phase::Failed(reason) => return self.fail(&job, reason),
            };
        }
    }

    async fn persist(&self, job: &FinalizationJob, finished: Finished) -> FinalizeOutcome {
        let Finished { war, payload } = finished;
        let war_id = war.identity();
        let record = FinalizedWar {
            war_id: war_id.clone(),
            war_type: war.war_type(),
            end_time: war.end.timestamp(),
            clans: [war.clan.tag, war.opponent.tag],
            payload,
        };
        match self.store.finalize_war(record).await {
            Ok(()) => {
                metrics::counter!("finalizer.done").increment(1);
                tracing::debug!(war_id = %war_id, "war finalized");
                FinalizeOutcome::Stored(war_id)
            }
            Err(err) => self.fail(job, FailureReason::Store(format!("{err:#}"))),
        }
    }

    fn fail(&self, job: &FinalizationJob, reason: FailureReason) -> FinalizeOutcome {
        metrics::counter!("finalizer.failed").increment(1);
        tracing::info!(key = %job.key(), %reason, "war finalization failed");
        self.failures.record(FinalizeFailure {
            key: job.key(),
            identity: job.identity(),
            reason: reason.clone(),
        });
        FinalizeOutcome::Failed(reason)
    }
}

#[async_trait]
impl JobHandler for Finalizer {
    async fn fire(&self, job: FinalizationJob) {
        self.finalize(job).await;
    }

    async fn missed(&self, job: FinalizationJob, lateness: Duration) {
        self.working_set.release_pair(&job.tag, &job.opponent_tag);
        self.fail(&job, FailureReason::Missed { lateness });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};

    use chrono::{TimeZone, Utc};
    use core_types::{
        BulkWriteReport, EngagedWar, MemberTimer, Participant, WarRecord, WarSnapshot, WarState,
        WarType,
    };
    use tokio::time::Instant;

    use super::*;

    const PREP: i64 = 1_700_000_000;

    struct ScriptedProbe {
        script: Mutex<VecDeque<ProbeResponse>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(script: impl IntoIterator<Item = ProbeResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WarProbe for ScriptedProbe {
        async fn probe(&self, tag: &str) -> ProbeResponse {
            self.calls.lock().push(tag.to_string());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| ProbeResponse::Error("script exhausted".into()))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        finalized: Mutex<HashMap<WarIdentity, FinalizedWar>>,
        writes: Mutex<usize>,
        broken: bool,
    }

    #[async_trait]
    impl WarStore for MemoryStore {
        async fn insert_wars(&self, _records: Vec<WarRecord>) -> anyhow::Result<BulkWriteReport> {
            Ok(BulkWriteReport::default())
        }

        async fn upsert_member_timers(
            &self,
            _timers: Vec<MemberTimer>,
        ) -> anyhow::Result<BulkWriteReport> {
            Ok(BulkWriteReport::default())
        }

        async fn finalize_war(&self, war: FinalizedWar) -> anyhow::Result<()> {
            if self.broken {
                anyhow::bail!("disk full");
            }
            *self.writes.lock() += 1;
            self.finalized.lock().insert(war.war_id.clone(), war);
            Ok(())
        }

        async fn pending_war_ids(&self, _ending_after: i64) -> anyhow::Result<HashSet<WarIdentity>> {
            Ok(HashSet::new())
        }

        async fn recent_war_participants(&self, _ended_after: i64) -> anyhow::Result<Vec<TargetId>> {
            Ok(Vec::new())
        }

        async fn registered_targets(&self) -> anyhow::Result<Vec<TargetId>> {
            Ok(Vec::new())
        }

        async fn open_war_log_targets(&self) -> anyhow::Result<Vec<TargetId>> {
            Ok(Vec::new())
        }
    }

    fn snapshot(state: WarState, clan: &str, opponent: &str, prep: i64) -> ProbeResponse {
        let prep_at = Utc.timestamp_opt(prep, 0).single().expect("ts");
        let payload = serde_json::json!({
            "state": state.as_str(),
            "clan": {"tag": clan},
            "opponent": {"tag": opponent},
        });
        ProbeResponse::Snapshot {
            snapshot: WarSnapshot::Engaged(EngagedWar {
                state,
                preparation_start: prep_at,
                start: Some(prep_at + chrono::Duration::hours(23)),
                end: prep_at + chrono::Duration::hours(47),
                war_tag: None,
                clan: Participant {
                    tag: clan.into(),
                    members: vec!["#M1".into()],
                },
                opponent: Participant {
                    tag: opponent.into(),
                    members: vec!["#M2".into()],
                },
            }),
            payload,
            retry_after: Some(Duration::from_secs(30)),
        }
    }

    fn job() -> FinalizationJob {
        FinalizationJob {
            tag: "#P1".into(),
            opponent_tag: "#P2".into(),
            preparation_start: PREP,
            fire_at: Utc::now(),
            grace: Duration::from_secs(1_200),
        }
    }

    struct Harness {
        finalizer: Finalizer,
        probe: Arc<ScriptedProbe>,
        store: Arc<MemoryStore>,
        working_set: Arc<InWarSet>,
    }

    fn harness(script: Vec<ProbeResponse>, store: MemoryStore) -> Harness {
        let probe = ScriptedProbe::new(script);
        let store = Arc::new(store);
        let working_set = Arc::new(InWarSet::new());
        working_set.claim_pair("#P1", "#P2");
        let finalizer = Finalizer::new(
            probe.clone(),
            store.clone(),
            working_set.clone(),
            Arc::new(FailureLog::new()),
            Policy::default(),
        );
        Harness {
            finalizer,
            probe,
            store,
            working_set,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ended_on_first_probe_is_stored() {
        let h = harness(
            vec![snapshot(WarState::WarEnded, "#P1", "#P2", PREP)],
            MemoryStore::default(),
        );

        let outcome = h.finalizer.finalize(job()).await;

        let id = WarIdentity::new("#P1", "#P2", PREP);
        assert_eq!(outcome, FinalizeOutcome::Stored(id.clone()));
        assert_eq!(h.probe.calls(), vec!["#P1".to_string()]);
        assert!(h.working_set.is_empty());
        let stored = h.store.finalized.lock().get(&id).cloned().expect("stored");
        assert_eq!(stored.clans, ["#P1".to_string(), "#P2".to_string()]);
        assert_eq!(stored.war_type, Some(WarType::Random));
        assert_eq!(stored.payload["state"], "warEnded");
        assert!(h.finalizer.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_then_no_access_fails_after_one_switch() {
        let h = harness(
            vec![
                snapshot(WarState::Preparation, "#P1", "#P9", PREP + 86_400),
                ProbeResponse::NoAccess,
            ],
            MemoryStore::default(),
        );

        let outcome = h.finalizer.finalize(job()).await;

        assert_eq!(outcome, FinalizeOutcome::Failed(FailureReason::NoAccess));
        assert_eq!(h.probe.calls(), vec!["#P1".to_string(), "#P2".to_string()]);
        assert!(h.working_set.is_empty());
        let failures = h.finalizer.failures().drain();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "war_end_#P1_#P2");
        assert_eq!(failures[0].identity, WarIdentity::new("#P1", "#P2", PREP));
        assert!(h.finalizer.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_backoffs_do_not_spend_attempts() {
        let h = harness(
            vec![
                ProbeResponse::Maintenance,
                ProbeResponse::Maintenance,
                ProbeResponse::Maintenance,
                snapshot(WarState::WarEnded, "#P1", "#P2", PREP),
            ],
            MemoryStore::default(),
        );
        let started = Instant::now();

        let outcome = h.finalizer.finalize(job()).await;

        assert!(matches!(outcome, FinalizeOutcome::Stored(_)));
        assert_eq!(h.probe.calls().len(), 4);
        assert!(h.probe.calls().iter().all(|t| t == "#P1"));
        assert!(started.elapsed() >= Duration::from_secs(45 * 60));
        assert!(started.elapsed() < Duration::from_secs(46 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn running_war_is_abandoned_after_the_retry_cap() {
        let script = (0..20)
            .map(|_| snapshot(WarState::InWar, "#P1", "#P2", PREP))
            .collect();
        let h = harness(script, MemoryStore::default());
        let started = Instant::now();

        let outcome = h.finalizer.finalize(job()).await;

        assert_eq!(
            outcome,
            FinalizeOutcome::Failed(FailureReason::Exhausted { attempts: 10 })
        );
        assert_eq!(h.probe.calls().len(), 10);
        assert!(h.working_set.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(9 * 30));
        assert!(h.store.finalized.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_fails_without_switching() {
        let h = harness(vec![ProbeResponse::Error("reset".into())], MemoryStore::default());
        let outcome = h.finalizer.finalize(job()).await;
        assert_eq!(
            outcome,
            FinalizeOutcome::Failed(FailureReason::Error("reset".into()))
        );
        assert_eq!(h.probe.calls().len(), 1);
        assert!(h.working_set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_recorded_and_releases_pair() {
        let h = harness(
            vec![snapshot(WarState::WarEnded, "#P1", "#P2", PREP)],
            MemoryStore {
                broken: true,
                ..MemoryStore::default()
            },
        );
        let outcome = h.finalizer.finalize(job()).await;
        assert!(matches!(outcome, FinalizeOutcome::Failed(FailureReason::Store(ref e)) if e.contains("disk full")));
        assert!(h.working_set.is_empty());
        assert_eq!(h.finalizer.failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finalizing_twice_leaves_the_same_record() {
        let h = harness(
            vec![
                snapshot(WarState::WarEnded, "#P1", "#P2", PREP),
                snapshot(WarState::WarEnded, "#P1", "#P2", PREP),
            ],
            MemoryStore::default(),
        );

        h.finalizer.finalize(job()).await;
        let first = h.store.finalized.lock().clone();
        h.finalizer.finalize(job()).await;
        let second = h.store.finalized.lock().clone();

        assert_eq!(*h.store.writes.lock(), 2);
        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_job_releases_and_records() {
        let h = harness(Vec::new(), MemoryStore::default());
        h.finalizer
            .missed(job(), Duration::from_secs(3_600))
            .await;

        assert!(h.working_set.is_empty());
        assert!(h.probe.calls().is_empty());
        let failures = h.finalizer.failures().drain();
        assert_eq!(
            failures[0].reason,
            FailureReason::Missed {
                lateness: Duration::from_secs(3_600)
            }
        );
    }
}
