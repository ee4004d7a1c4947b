use async_trait::async_trait;
use batch_fetch::{cache_max_age, BatchFetcher, CURRENT_WAR_PATH};
use core_types::WarSnapshot;
use reqwest::{Client, StatusCode};

use crate::machine::ProbeResponse;

/// Single-clan current-war lookup used while finalizing.
#[async_trait]
pub trait WarProbe: Send + Sync {
    async fn probe(&self, tag: &str) -> ProbeResponse;
}

/// Probes the live API through the same gate as the batch fetches.
pub struct ApiWarProbe {
    fetcher: BatchFetcher,
    client: Client,
}

impl ApiWarProbe {
    pub fn new(fetcher: BatchFetcher) -> anyhow::Result<Self> {
        let client = fetcher.build_client()?;
        Ok(Self { fetcher, client })
    }
}

#[async_trait]
impl WarProbe for ApiWarProbe {
    async fn probe(&self, tag: &str) -> ProbeResponse {
        let response = match self.fetcher.gated_get(&self.client, CURRENT_WAR_PATH, tag).await {
            Ok(resp) => resp,
            Err(err) => return ProbeResponse::Error(err.to_string()),
        };
        match response.status() {
            StatusCode::OK => {
                let retry_after = cache_max_age(response.headers());
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(err) => return ProbeResponse::Error(err.to_string()),
                };
                let snapshot = match WarSnapshot::decode(&body) {
                    Ok(snapshot) => snapshot,
                    Err(err) => return ProbeResponse::Error(err.to_string()),
                };
                match serde_json::from_slice(&body) {
                    Ok(payload) => ProbeResponse::Snapshot {
                        snapshot,
                        payload,
                        retry_after,
                    },
                    Err(err) => ProbeResponse::Error(err.to_string()),
                }
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => ProbeResponse::NoAccess,
            StatusCode::SERVICE_UNAVAILABLE => ProbeResponse::Maintenance,
            status => ProbeResponse::Error(format!("unexpected status {status}")),
        }
    }
}
