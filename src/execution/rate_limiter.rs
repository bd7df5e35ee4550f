//! Token bucket shared by every outbound venue call.
//!
//! Waiters queue on a fair async mutex, so tokens are handed out in request
//! order. The bucket itself sits behind a short synchronous lock that is never
//! held across an await.

use crate::config::TierSettings;
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_consume(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_rate <= 0.0 {
            return Err(Duration::from_secs(3600));
        }
        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_rate))
    }
}

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    queue: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, refill_per_sec)),
            queue: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_tier(tier: &TierSettings) -> Self {
        Self::new(tier.rate_limit_capacity, tier.rate_limit_refill_per_sec)
    }

    /// Wait up to `timeout` for a token.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let wait = async {
            let _turn = self.queue.lock().await;
            loop {
                let delay = match self.bucket.lock().try_consume() {
                    Ok(()) => return,
                    Err(delay) => delay,
                };
                tokio::time::sleep(delay).await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(waited_ms, "Rate limiter wait expired");
                Err(EngineError::RateLimited { waited_ms })
            }
        }
    }

    /// Take a token only if one is free and nobody is queued ahead.
    pub fn try_acquire(&self) -> bool {
        let Ok(_turn) = self.queue.try_lock() else {
            return false;
        };
        self.bucket.lock().try_consume().is_ok()
    }

    /// Apply new tier settings. Current tokens are kept, capped at the new
    /// capacity.
    pub fn reconfigure(&self, capacity: u32, refill_per_sec: f64) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.capacity = capacity as f64;
        bucket.refill_rate = refill_per_sec;
        bucket.tokens = bucket.tokens.min(bucket.capacity);
        info!(capacity, refill_per_sec, "Rate limiter reconfigured");
    }

    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens
    }
}
