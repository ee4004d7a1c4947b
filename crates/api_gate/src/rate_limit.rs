use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::GateError;

#[derive(Debug)]
struct TokenBucket {
    per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_sec: f64, burst: f64) -> Self {
        Self {
            per_sec,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token, or reports how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let dt = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + dt * self.per_sec).clamp(0.0, self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.per_sec))
        }
    }
}

/// Global outbound request gate: at most `rate` admissions per `period`.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(rate: u32, period: Duration) -> Result<Self, GateError> {
        if rate == 0 || period.is_zero() {
            return Err(GateError::InvalidRate { rate, period });
        }
        let per_sec = f64::from(rate) / period.as_secs_f64();
        Ok(Self {
            bucket: Mutex::new(TokenBucket::new(per_sec, f64::from(rate))),
        })
    }

    pub fn per_second(&self) -> f64 {
        self.bucket.lock().per_sec
    }

    /// Suspends until a slot is free, then admits exactly one request.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.bucket.lock().try_take(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }
}
