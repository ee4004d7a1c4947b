use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use batch_fetch::{BatchFetcher, CLAN_PATH};
use batch_runner::{TrackOutcome, Tracker};
use core_types::{BusMessage, ClanDirectory, TargetId};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

pub(crate) const CLAN_TOPIC: &str = "clan";

/// The profile fields the directory cares about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClanProfile {
    members: Option<u32>,
    #[serde(default)]
    is_war_log_public: bool,
}

/// Fetches each clan's profile, keeps the clan directory current and
/// forwards the raw payload, keyed by tag.
pub(crate) struct ClanForwardTracker {
    fetcher: BatchFetcher,
    client: Client,
    directory: Arc<dyn ClanDirectory>,
    enabled: bool,
}

impl ClanForwardTracker {
    pub(crate) fn new(
        fetcher: BatchFetcher,
        directory: Arc<dyn ClanDirectory>,
        enabled: bool,
    ) -> anyhow::Result<Self> {
        let client = fetcher.build_client()?;
        Ok(Self {
            fetcher,
            client,
            directory,
            enabled,
        })
    }
}

#[async_trait]
impl Tracker for ClanForwardTracker {
    fn name(&self) -> &str {
        "clans"
    }

    fn allowed(&self) -> bool {
        self.enabled
    }

    async fn track(&self, target: &TargetId) -> anyhow::Result<TrackOutcome> {
        let response = self.fetcher.gated_get(&self.client, CLAN_PATH, target).await?;
        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let profile: ClanProfile =
                    serde_json::from_slice(&body).with_context(|| format!("clan {target}: decode"))?;
                if profile.members == Some(0) {
                    let raw = serde_json::from_slice(&body)?;
                    self.directory.record_deleted(target, raw).await?;
                    tracing::info!(tag = %target, "clan has no members, marked deleted");
                    return Ok(TrackOutcome::default());
                }
                self.directory
                    .record_clan(target, profile.is_war_log_public)
                    .await?;
                Ok(TrackOutcome {
                    messages: vec![BusMessage::new(CLAN_TOPIC, target.clone(), body.to_vec())],
                })
            }
            // Deleted or hidden clans have nothing to forward.
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(TrackOutcome::default()),
            status => anyhow::bail!("clan {target}: unexpected status {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use api_gate::{ApiGate, CredentialPool, RateLimiter};
    use batch_fetch::FetchConfig;
    use batch_runner::{BatchRunner, RunnerConfig};
    use core_types::{MessageSink, TargetSource, WarStore};
    use infra_bus::{RingBus, RingBusSink};
    use war_store::SqliteWarStore;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct Fixed(Vec<TargetId>);

    #[async_trait]
    impl TargetSource for Fixed {
        async fn targets(&self, _cycle: u64) -> anyhow::Result<Vec<TargetId>> {
            Ok(self.0.clone())
        }
    }

    fn tracker(server: &MockServer, store: &SqliteWarStore, enabled: bool) -> ClanForwardTracker {
        let gate = ApiGate::new(
            CredentialPool::new(["secret"]).expect("pool"),
            RateLimiter::new(100, Duration::from_secs(1)).expect("limiter"),
        );
        let fetcher = BatchFetcher::new(
            gate,
            FetchConfig {
                base_url: server.uri(),
                request_timeout: Duration::from_secs(5),
                ..FetchConfig::default()
            },
        );
        ClanForwardTracker::new(fetcher, Arc::new(store.clone()), enabled).expect("tracker")
    }

    #[tokio::test]
    async fn forwards_clan_payloads_to_the_bus() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clans/%23A"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"tag": "#A", "members": 12, "isWarLogPublic": true}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clans/%23GONE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clans/%23BROKEN"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = SqliteWarStore::open_in_memory().expect("store");
        let sink = RingBusSink::new(RingBus::new(64));
        let mut rx = sink.bus().subscribe();
        let shared_sink: Arc<dyn MessageSink> = Arc::new(sink);
        let runner = BatchRunner::new(
            Arc::new(Fixed(vec!["#A".into(), "#GONE".into(), "#BROKEN".into()])),
            Arc::new(tracker(&server, &store, true)),
            Some(shared_sink),
            RunnerConfig::default(),
        );

        let metrics = runner.run_cycle(1).await.expect("cycle");
        assert_eq!(metrics.items, 3);
        assert_eq!(metrics.messages, 1);
        assert_eq!(metrics.errors, 1);

        let message = rx.recv().await.expect("message");
        assert_eq!(message.topic, CLAN_TOPIC);
        assert_eq!(message.key, "#A");
        let payload: serde_json::Value = serde_json::from_slice(&message.value).expect("json");
        assert_eq!(payload["tag"], "#A");
        assert_eq!(store.open_war_log_targets().await.expect("open"), vec!["#A".to_string()]);
    }

    #[tokio::test]
    async fn profiles_update_the_clan_directory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clans/%23OPEN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"tag": "#OPEN", "members": 30, "isWarLogPublic": true}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clans/%23HIDDEN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"tag": "#HIDDEN", "members": 5, "isWarLogPublic": false}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clans/%23EMPTY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"tag": "#EMPTY", "members": 0, "isWarLogPublic": true}),
            ))
            .mount(&server)
            .await;

        let store = SqliteWarStore::open_in_memory().expect("store");
        store.record_clan("#EMPTY", true).await.expect("seed");
        let sink = RingBusSink::new(RingBus::new(64));
        let mut rx = sink.bus().subscribe();
        let shared_sink: Arc<dyn MessageSink> = Arc::new(sink);
        let runner = BatchRunner::new(
            Arc::new(Fixed(vec!["#OPEN".into(), "#HIDDEN".into(), "#EMPTY".into()])),
            Arc::new(tracker(&server, &store, true)),
            Some(shared_sink),
            RunnerConfig::default(),
        );

        let metrics = runner.run_cycle(1).await.expect("cycle");
        assert_eq!(metrics.items, 3);
        assert_eq!(metrics.messages, 2);
        assert_eq!(metrics.errors, 0);

        assert_eq!(store.open_war_log_targets().await.expect("open"), vec!["#OPEN".to_string()]);
        assert!(store.is_deleted("#EMPTY").await.expect("lookup"));
        assert!(!store.is_deleted("#HIDDEN").await.expect("lookup"));

        let mut forwarded = vec![
            rx.recv().await.expect("first").key,
            rx.recv().await.expect("second").key,
        ];
        forwarded.sort();
        assert_eq!(forwarded, vec!["#HIDDEN".to_string(), "#OPEN".to_string()]);
    }

    #[tokio::test]
    async fn disabled_tracker_skips_cycles() {
        let server = MockServer::start().await;
        let store = SqliteWarStore::open_in_memory().expect("store");
        let runner = BatchRunner::new(
            Arc::new(Fixed(vec!["#A".into()])),
            Arc::new(tracker(&server, &store, false)),
            None,
            RunnerConfig::default(),
        );
        let metrics = runner.run_cycle(1).await.expect("cycle");
        assert!(metrics.skipped);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
