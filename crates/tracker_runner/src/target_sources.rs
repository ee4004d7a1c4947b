use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use core_types::{TargetId, TargetSource, WarStore};

fn union_distinct(lists: impl IntoIterator<Item = Vec<TargetId>>) -> Vec<TargetId> {
    let mut seen = HashSet::new();
    lists
        .into_iter()
        .flatten()
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Participants of non-league wars that ended inside the lookback window,
/// plus every registered clan.
pub(crate) struct RecentWarTargets {
    store: Arc<dyn WarStore>,
    lookback: ChronoDuration,
}

impl RecentWarTargets {
    pub(crate) fn new(store: Arc<dyn WarStore>, lookback: ChronoDuration) -> Self {
        Self { store, lookback }
    }
}

#[async_trait]
impl TargetSource for RecentWarTargets {
    async fn targets(&self, _cycle: u64) -> anyhow::Result<Vec<TargetId>> {
        let since = (Utc::now() - self.lookback).timestamp();
        let recent = self
            .store
            .recent_war_participants(since)
            .await
            .context("recent war participants")?;
        let registered = self.store.registered_targets().await.context("registered clans")?;
        Ok(union_distinct([recent, registered]))
    }
}

/// Clans known to have a public war log, plus every registered clan.
pub(crate) struct OpenWarLogTargets {
    store: Arc<dyn WarStore>,
}

impl OpenWarLogTargets {
    pub(crate) fn new(store: Arc<dyn WarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TargetSource for OpenWarLogTargets {
    async fn targets(&self, _cycle: u64) -> anyhow::Result<Vec<TargetId>> {
        let open = self.store.open_war_log_targets().await.context("open war log clans")?;
        let registered = self.store.registered_targets().await.context("registered clans")?;
        Ok(union_distinct([open, registered]))
    }
}

/// Uses `alternate` on every `every`-th cycle and `primary` otherwise.
pub(crate) struct CadencedTargets {
    primary: Arc<dyn TargetSource>,
    alternate: Arc<dyn TargetSource>,
    every: u64,
}

impl CadencedTargets {
    pub(crate) fn new(
        primary: Arc<dyn TargetSource>,
        alternate: Arc<dyn TargetSource>,
        every: u64,
    ) -> Self {
        Self {
            primary,
            alternate,
            every: every.max(1),
        }
    }

    fn uses_alternate(&self, cycle: u64) -> bool {
        cycle > 0 && cycle % self.every == 0
    }
}

#[async_trait]
impl TargetSource for CadencedTargets {
    async fn targets(&self, cycle: u64) -> anyhow::Result<Vec<TargetId>> {
        if self.uses_alternate(cycle) {
            tracing::info!(cycle, "using alternate target source");
            self.alternate.targets(cycle).await
        } else {
            self.primary.targets(cycle).await
        }
    }
}

#[cfg(test)]
mod tests {
    use core_types::{FinalizedWar, WarIdentity, WarRecord, WarType};
    use war_store::SqliteWarStore;

    use super::*;

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl TargetSource for Fixed {
        async fn targets(&self, _cycle: u64) -> anyhow::Result<Vec<TargetId>> {
            Ok(self.0.iter().map(|t| t.to_string()).collect())
        }
    }

    #[test]
    fn union_keeps_first_occurrence_order() {
        let merged = union_distinct([
            vec!["#B".to_string(), "#A".to_string()],
            vec!["#A".to_string(), "#C".to_string()],
        ]);
        assert_eq!(merged, vec!["#B", "#A", "#C"]);
    }

    #[tokio::test]
    async fn recent_targets_skip_league_and_old_wars() {
        let store = SqliteWarStore::open_in_memory().expect("store");
        let now = Utc::now().timestamp();
        store
            .insert_wars(vec![
                WarRecord {
                    war_id: WarIdentity::new("#A", "#B", now - 3_600),
                    clans: ["#A".into(), "#B".into()],
                    end_time: now - 60,
                },
                WarRecord {
                    war_id: WarIdentity::new("#OLD1", "#OLD2", 1),
                    clans: ["#OLD1".into(), "#OLD2".into()],
                    end_time: now - 60 * 86_400,
                },
            ])
            .await
            .expect("insert");
        store
            .finalize_war(FinalizedWar {
                war_id: WarIdentity::new("#L1", "#L2", now - 3_600),
                clans: ["#L1".into(), "#L2".into()],
                end_time: now - 60,
                war_type: Some(WarType::Cwl),
                payload: serde_json::json!({}),
            })
            .await
            .expect("finalize");
        store.register_target("#R").await.expect("register");
        store.register_target("#A").await.expect("register");

        let source = RecentWarTargets::new(Arc::new(store), ChronoDuration::days(28));
        let mut targets = source.targets(1).await.expect("targets");
        targets.sort();
        assert_eq!(targets, vec!["#A", "#B", "#R"]);
    }

    #[tokio::test]
    async fn open_war_log_targets_include_registered() {
        let store = SqliteWarStore::open_in_memory().expect("store");
        store.upsert_global_clan("#G", true).await.expect("global");
        store.upsert_global_clan("#H", false).await.expect("global");
        store.register_target("#R").await.expect("register");

        let source = OpenWarLogTargets::new(Arc::new(store));
        assert_eq!(source.targets(30).await.expect("targets"), vec!["#G", "#R"]);
    }

    #[tokio::test]
    async fn cadence_switches_every_nth_cycle() {
        let source = CadencedTargets::new(Arc::new(Fixed(vec!["#P"])), Arc::new(Fixed(vec!["#ALT"])), 30);
        for (cycle, expected) in [(1, "#P"), (29, "#P"), (30, "#ALT"), (31, "#P"), (60, "#ALT")] {
            assert_eq!(source.targets(cycle).await.expect("targets"), vec![expected]);
        }
    }
}
