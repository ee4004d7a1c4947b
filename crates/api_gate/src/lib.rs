use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod credentials;
pub mod rate_limit;

pub use credentials::{Credential, CredentialPool};
pub use rate_limit::RateLimiter;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("credential pool needs at least one key")]
    EmptyPool,
    #[error("invalid rate limit {rate} per {period:?}")]
    InvalidRate { rate: u32, period: Duration },
}

/// Every outbound API call passes through here: one rate-limiter slot,
/// then the next credential in rotation.
#[derive(Debug, Clone)]
pub struct ApiGate {
    credentials: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
}

impl ApiGate {
    pub fn new(credentials: CredentialPool, limiter: RateLimiter) -> Self {
        tracing::info!(
            keys = credentials.len(),
            per_sec = limiter.per_second(),
            "api gate ready"
        );
        Self {
            credentials: Arc::new(credentials),
            limiter: Arc::new(limiter),
        }
    }

    pub async fn admit(&self) -> Credential {
        self.limiter.acquire().await;
        self.credentials.next()
    }

    pub fn key_count(&self) -> usize {
        self.credentials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admit_rotates_credentials() {
        let gate = ApiGate::new(
            CredentialPool::new(["k1", "k2"]).expect("pool"),
            RateLimiter::new(100, Duration::from_secs(1)).expect("limiter"),
        );
        assert_eq!(gate.admit().await.expose(), "k2");
        assert_eq!(gate.admit().await.expose(), "k1");
        assert_eq!(gate.key_count(), 2);
    }
}
