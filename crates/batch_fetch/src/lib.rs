use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use api_gate::ApiGate;
use core_types::TargetId;
use futures::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION, CACHE_CONTROL};
use reqwest::{Client, Response, StatusCode};

pub mod stats;

pub use stats::RequestStats;

pub const CURRENT_WAR_PATH: &str = "/clans/{tag}/currentwar";
pub const CLAN_PATH: &str = "/clans/{tag}";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub group_size: usize,
    pub connection_limit: usize,
    pub request_timeout: Duration,
    pub group_pause: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.clashofclans.com/v1".to_string(),
            group_size: 60_000,
            connection_limit: 500,
            request_timeout: Duration::from_secs(1_800),
            group_pause: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { target: TargetId, body: Vec<u8> },
    NotFound { target: TargetId },
    Forbidden { target: TargetId },
    TransportError { target: TargetId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub target: TargetId,
    pub body: Vec<u8>,
}

/// Aggregate result of one group. Failures are counted, never raised.
#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    pub fetched: Vec<Fetched>,
    pub not_found: usize,
    pub forbidden: usize,
    pub transport_errors: usize,
    pub elapsed: Duration,
}

impl GroupReport {
    fn absorb(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Success { target, body } => {
                self.fetched.push(Fetched { target, body })
            }
            FetchOutcome::NotFound { .. } => self.not_found += 1,
            FetchOutcome::Forbidden { .. } => self.forbidden += 1,
            FetchOutcome::TransportError { target, reason } => {
                tracing::debug!(%target, %reason, "fetch failed");
                self.transport_errors += 1;
            }
        }
    }

    pub fn attempted(&self) -> usize {
        self.fetched.len() + self.not_found + self.forbidden + self.transport_errors
    }
}

pub fn encode_tag(tag: &str) -> String {
    tag.replace('#', "%23")
}

/// `max-age` from the response's Cache-Control header: the upstream's hint
/// for when the resource is worth fetching again.
pub fn cache_max_age(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(CACHE_CONTROL)?.to_str().ok()?;
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|part| part.strip_prefix("max-age="))
        .find_map(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Concurrent fetcher for large target lists. Each request waits on the
/// shared [`ApiGate`] before going out.
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    gate: ApiGate,
    cfg: FetchConfig,
    stats: Arc<RequestStats>,
}

impl BatchFetcher {
    pub fn new(gate: ApiGate, cfg: FetchConfig) -> Self {
        Self {
            gate,
            cfg,
            stats: Arc::new(RequestStats::default()),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.cfg
    }

    pub fn gate(&self) -> &ApiGate {
        &self.gate
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn target_url(&self, template: &str, tag: &str) -> String {
        format!(
            "{}{}",
            self.cfg.base_url.trim_end_matches('/'),
            template.replace("{tag}", &encode_tag(tag))
        )
    }

    /// Splits targets into the fixed-size groups that are fetched one after
    /// another.
    pub fn partition(&self, targets: Vec<TargetId>) -> Vec<Vec<TargetId>> {
        let size = self.cfg.group_size.max(1);
        targets.chunks(size).map(|c| c.to_vec()).collect()
    }

    /// Client whose connection pool lives for one group.
    pub fn build_client(&self) -> Result<Client> {
        Client::builder()
            .pool_max_idle_per_host(self.cfg.connection_limit.max(1))
            .timeout(self.cfg.request_timeout)
            .build()
            .context("build http client")
    }

    /// One gated GET. Waits for a rate-limiter slot and stamps the next
    /// credential.
    pub async fn gated_get(
        &self,
        client: &Client,
        template: &str,
        tag: &str,
    ) -> reqwest::Result<Response> {
        let credential = self.gate.admit().await;
        self.stats.record(template);
        client
            .get(self.target_url(template, tag))
            .header(AUTHORIZATION, credential.bearer())
            .send()
            .await
    }

    async fn fetch_one(&self, client: &Client, template: &str, target: TargetId) -> FetchOutcome {
        let response = match self.gated_get(client, template, &target).await {
            Ok(resp) => resp,
            Err(err) => {
                metrics::counter!("fetch.transport_error").increment(1);
                return FetchOutcome::TransportError {
                    target,
                    reason: err.to_string(),
                };
            }
        };
        match response.status() {
            StatusCode::OK => match response.bytes().await {
                Ok(body) => {
                    metrics::counter!("fetch.ok").increment(1);
                    FetchOutcome::Success {
                        target,
                        body: body.to_vec(),
                    }
                }
                Err(err) => {
                    metrics::counter!("fetch.transport_error").increment(1);
                    FetchOutcome::TransportError {
                        target,
                        reason: err.to_string(),
                    }
                }
            },
            StatusCode::FORBIDDEN => {
                metrics::counter!("fetch.forbidden").increment(1);
                FetchOutcome::Forbidden { target }
            }
            StatusCode::NOT_FOUND => {
                metrics::counter!("fetch.not_found").increment(1);
                FetchOutcome::NotFound { target }
            }
            status => {
                metrics::counter!("fetch.transport_error").increment(1);
                FetchOutcome::TransportError {
                    target,
                    reason: format!("unexpected status {status}"),
                }
            }
        }
    }

    /// Fetches one group with at most `connection_limit` requests in flight.
    /// Results come back unordered once every request has returned.
    pub async fn fetch_group(&self, group: &[TargetId], template: &str) -> Result<GroupReport> {
        let started = Instant::now();
        let client = self.build_client()?;
        let outcomes = futures::stream::iter(group.iter().cloned())
            .map(|target| self.fetch_one(&client, template, target))
            .buffer_unordered(self.cfg.connection_limit.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = GroupReport::default();
        for outcome in outcomes {
            report.absorb(outcome);
        }
        report.elapsed = started.elapsed();
        metrics::histogram!("fetch.group_ms").record(report.elapsed.as_millis() as f64);
        Ok(report)
    }

    pub async fn pause_between_groups(&self) {
        if !self.cfg.group_pause.is_zero() {
            tokio::time::sleep(self.cfg.group_pause).await;
        }
    }
}
