use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

const DEFAULT_HISTORY: usize = 10_000;

/// Bounded per-endpoint history of request timestamps (ms).
#[derive(Debug)]
pub struct RequestStats {
    capacity: usize,
    history: DashMap<String, VecDeque<i64>>,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }
}

impl RequestStats {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: DashMap::new(),
        }
    }

    pub fn record(&self, endpoint: &str) {
        self.record_at(endpoint, Utc::now().timestamp_millis());
    }

    pub fn record_at(&self, endpoint: &str, ts_ms: i64) {
        let mut entry = self.history.entry(endpoint.to_string()).or_default();
        if entry.len() == self.capacity {
            entry.pop_front();
        }
        entry.push_back(ts_ms);
    }

    pub fn len(&self, endpoint: &str) -> usize {
        self.history.get(endpoint).map(|h| h.len()).unwrap_or(0)
    }

    /// Requests per second over the trailing `window`, from retained history.
    pub fn recent_rate(&self, endpoint: &str, window: Duration) -> f64 {
        self.recent_rate_at(endpoint, window, Utc::now().timestamp_millis())
    }

    pub fn recent_rate_at(&self, endpoint: &str, window: Duration, now_ms: i64) -> f64 {
        let window_ms = window.as_millis().max(1) as i64;
        let Some(history) = self.history.get(endpoint) else {
            return 0.0;
        };
        let since = now_ms - window_ms;
        let n = history.iter().rev().take_while(|&&ts| ts >= since).count();
        n as f64 * 1_000.0 / window_ms as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let stats = RequestStats::with_capacity(3);
        for ts in 0..10 {
            stats.record_at("war", ts);
        }
        assert_eq!(stats.len("war"), 3);
        assert_eq!(stats.len("clan"), 0);
    }

    #[test]
    fn recent_rate_counts_trailing_window() {
        let stats = RequestStats::default();
        for ts in [0, 500, 9_000, 9_500, 10_000] {
            stats.record_at("war", ts);
        }
        let rate = stats.recent_rate_at("war", Duration::from_secs(2), 10_000);
        assert!((rate - 1.5).abs() < 1e-9, "{rate}");
        assert_eq!(stats.recent_rate_at("other", Duration::from_secs(2), 10_000), 0.0);
    }
}
