// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use cuepoint_config::RateLimitConfig;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{trace, warn};

#[derive(Debug)]
struct BucketState {
    available_tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Top up from elapsed time, then take a token if one is available.
    /// On failure returns how long until the next token.
    fn try_take(&self, state: &mut BucketState) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available_tokens =
            (state.available_tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.available_tokens >= 1.0 {
            state.available_tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.available_tokens;
            let wait = missing / self.refill_per_sec;
            Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        }
    }
}

/// Token bucket shared by every concurrent provider call.
///
/// Holds at most `capacity` tokens and refills continuously at
/// `requests_per_minute / 60` tokens per second. A disabled limiter grants
/// every request immediately.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: f64, capacity: u32) -> Self {
        if !requests_per_minute.is_finite() || requests_per_minute <= 0.0 || capacity == 0 {
            warn!(
                target: "rate_limiter",
                requests_per_minute,
                capacity,
                "invalid rate limit, requests will not be throttled"
            );
            return Self::disabled();
        }

        let capacity = capacity as f64;
        Self {
            bucket: Some(Arc::new(Bucket {
                capacity,
                refill_per_sec: requests_per_minute / 60.0,
                state: Mutex::new(BucketState {
                    available_tokens: capacity,
                    last_refill: Instant::now(),
                }),
            })),
        }
    }

    /// Bucket sized to one minute's worth of requests.
    pub fn per_minute(requests_per_minute: f64) -> Self {
        let capacity = if requests_per_minute.is_finite() {
            requests_per_minute.ceil().max(1.0) as u32
        } else {
            0
        };
        Self::new(requests_per_minute, capacity)
    }

    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        match config.burst {
            Some(burst) => Self::new(config.max_requests_per_minute, burst),
            None => Self::per_minute(config.max_requests_per_minute),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Wait for a token. Returns `false` if `timeout` elapses first.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` tries exactly once.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let Some(bucket) = &self.bucket else {
            return true;
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let wait = {
                let mut state = bucket.state.lock().await;
                match bucket.try_take(&mut state) {
                    Ok(()) => return true,
                    Err(wait) => wait,
                }
            };

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        trace!(target: "rate_limiter", "no token available before deadline");
                        return false;
                    }
                    wait.min(deadline - now)
                }
                None => wait,
            };

            trace!(target: "rate_limiter", "rate limiting: waiting {:?}", wait);
            sleep(wait).await;
        }
    }

    /// Tokens currently available, after accounting for refill.
    pub async fn available(&self) -> f64 {
        let Some(bucket) = &self.bucket else {
            return f64::INFINITY;
        };
        let mut state = bucket.state.lock().await;
        let elapsed = Instant::now()
            .duration_since(state.last_refill)
            .as_secs_f64();
        state.available_tokens =
            (state.available_tokens + elapsed * bucket.refill_per_sec).min(bucket.capacity);
        state.last_refill = Instant::now();
        state.available_tokens
    }
}
