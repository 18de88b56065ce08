//! Sliding-window request admission, one limiter per exchange.
//!
//! `acquire` is a wait, never a failure: callers block until the window has
//! room for their weight. Limiters are process-wide singletons held in a
//! [`LimiterRegistry`] and shared by every connector for the same venue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::market::symbol::Exchange;

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_weight: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_weight: u32, window: Duration) -> Self {
        Self { max_weight, window }
    }

    pub fn per_minute(max_weight: u32) -> Self {
        Self::new(max_weight, Duration::from_secs(60))
    }

    /// Documented public-API budgets per venue.
    pub fn for_exchange(exchange: Exchange) -> Self {
        match exchange {
            Exchange::Binance => Self::per_minute(1100),
            Exchange::Bybit => Self::per_minute(108),
            Exchange::Okx => Self::new(18, Duration::from_secs(2)),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    window: Mutex<VecDeque<(Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until a request of `weight` can be admitted, then record it.
    pub async fn acquire(&self, weight: u32) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|(ts, _)| now.duration_since(*ts) >= self.limit.window)
                {
                    window.pop_front();
                }

                let used: u32 = window.iter().map(|(_, w)| w).sum();
                if window.is_empty() || used + weight < self.limit.max_weight {
                    window.push_back((now, weight));
                    return;
                }

                let oldest = window.front().map_or(now, |(ts, _)| *ts);
                self.limit
                    .window
                    .saturating_sub(now.duration_since(oldest))
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }
}

/// Per-exchange limiter singletons. Constructed once at startup and passed
/// down explicitly.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: DashMap<Exchange, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, exchange: Exchange) -> Arc<RateLimiter> {
        self.limiters
            .entry(exchange)
            .or_insert_with(|| Arc::new(RateLimiter::new(RateLimit::for_exchange(exchange))))
            .clone()
    }
}
