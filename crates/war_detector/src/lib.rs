use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use core_types::{
    FinalizationJob, MemberTimer, TargetId, WarIdentity, WarRecord, WarSnapshot,
};
use parking_lot::RwLock;

pub mod working_set;

pub use working_set::InWarSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub decoded: usize,
    pub decode_failures: usize,
    pub not_in_war: usize,
    pub stale: usize,
    pub already_tracked: usize,
    pub captured: usize,
    pub registered: usize,
}

/// Writes and jobs produced by one group of fetch results.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub records: Vec<WarRecord>,
    pub timers: Vec<MemberTimer>,
    pub jobs: Vec<FinalizationJob>,
    pub stats: DetectorStats,
}

/// Turns current-war payloads into war registrations, deduplicated against
/// the in-war working set and the identities already captured in storage.
#[derive(Debug)]
pub struct WarDetector {
    working_set: Arc<InWarSet>,
    captured: RwLock<HashSet<WarIdentity>>,
    grace: Duration,
}

impl WarDetector {
    pub fn new(working_set: Arc<InWarSet>, grace: Duration) -> Self {
        Self {
            working_set,
            captured: RwLock::new(HashSet::new()),
            grace,
        }
    }

    pub fn working_set(&self) -> &Arc<InWarSet> {
        &self.working_set
    }

    /// Wars already registered in storage (e.g. before a restart). They are
    /// not registered a second time.
    pub fn preload_captured(&self, ids: HashSet<WarIdentity>) {
        let mut captured = self.captured.write();
        captured.extend(ids);
        tracing::info!(count = captured.len(), "captured war ids loaded");
    }

    pub fn captured_count(&self) -> usize {
        self.captured.read().len()
    }

    /// Next cycle's fetch list: distinct targets not currently in a war.
    pub fn eligible(&self, targets: impl IntoIterator<Item = TargetId>) -> Vec<TargetId> {
        self.working_set.eligible(targets)
    }

    pub fn detect<'a, I>(&self, payloads: I, now: DateTime<Utc>) -> Detection
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut out = Detection::default();
        for (target, body) in payloads {
            self.inspect(target, body, now, &mut out);
        }
        metrics::counter!("detector.decode_error").increment(out.stats.decode_failures as u64);
        metrics::counter!("detector.registered").increment(out.stats.registered as u64);
        out
    }

    fn inspect(&self, target: &str, body: &[u8], now: DateTime<Utc>, out: &mut Detection) {
        let war = match WarSnapshot::decode(body) {
            Ok(WarSnapshot::Engaged(war)) => war,
            Ok(WarSnapshot::NotInWar) => {
                out.stats.decoded += 1;
                out.stats.not_in_war += 1;
                return;
            }
            Err(err) => {
                tracing::trace!(%target, %err, "undecodable war payload");
                out.stats.decode_failures += 1;
                return;
            }
        };
        out.stats.decoded += 1;

        if war.end < now {
            out.stats.stale += 1;
            return;
        }

        let opponent = war.opponent_of(target).to_string();
        if !self.working_set.claim_pair(target, &opponent) {
            out.stats.already_tracked += 1;
            return;
        }

        let identity = war.identity();
        if self.captured.read().contains(&identity) {
            out.stats.captured += 1;
        } else {
            let clans = [war.clan.tag.clone(), war.opponent.tag.clone()];
            out.timers.extend(war.members().map(|member| MemberTimer {
                member_tag: member.clone(),
                clans: clans.clone(),
                end_time: war.end,
            }));
            out.records.push(WarRecord {
                war_id: identity,
                clans: [target.to_string(), opponent.clone()],
                end_time: war.end.timestamp(),
            });
            out.stats.registered += 1;
        }

        // Jobs only live in memory, so captured wars are scheduled again.
        out.jobs.push(FinalizationJob {
            tag: target.to_string(),
            opponent_tag: opponent,
            preparation_start: war.preparation_ts(),
            fire_at: war.end,
            grace: self.grace,
        });
    }
}
