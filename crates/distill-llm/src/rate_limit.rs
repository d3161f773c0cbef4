//! Per-model rate limiting
//!
//! Every model gets one [`RateLimiter`], created lazily by the
//! [`RateLimiterRegistry`] and kept for the lifetime of the registry. A
//! limiter holds independent buckets per key, so callers decide how widely a
//! bucket is shared (see [`RateLimitScope`]).

use crate::config::{RateLimitConfig, RateLimitScope};
use crate::error::{LLMError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of consuming one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// Unit granted
    Granted {
        /// Units left in the current window
        remaining: u32,
    },
    /// Bucket exhausted or blocked; try again after this long
    Wait(Duration),
}

impl Consumption {
    /// Returns true if the unit was granted
    pub fn is_granted(&self) -> bool {
        matches!(self, Consumption::Granted { .. })
    }
}

/// Grants within the rolling window, plus an optional block
#[derive(Debug, Default)]
struct Bucket {
    grants: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Rolling-window limiter for one model
#[derive(Debug)]
pub struct RateLimiter {
    model: String,
    points: u32,
    window: Duration,
    block: Duration,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `points` grants per `window_seconds`,
    /// blocking an exhausted key for `block_seconds`
    pub fn new(model: impl Into<String>, points: u32, window_seconds: u64, block_seconds: u64) -> Result<Self> {
        let model = model.into();
        if points == 0 || window_seconds == 0 {
            return Err(LLMError::InvalidConfiguration(format!(
                "Rate limiter for '{}' needs positive points and window (got {} / {}s)",
                model, points, window_seconds
            )));
        }

        Ok(Self {
            model,
            points,
            window: Duration::from_secs(window_seconds),
            block: Duration::from_secs(block_seconds),
            buckets: DashMap::new(),
        })
    }

    /// Model this limiter belongs to
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Consume one unit from `key`'s bucket
    ///
    /// Never fails: an exhausted bucket yields [`Consumption::Wait`] and the
    /// caller decides whether to wait or give up.
    pub fn consume(&self, key: &str) -> Consumption {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_default();

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Consumption::Wait(until - now);
            }
            bucket.blocked_until = None;
        }

        while let Some(&oldest) = bucket.grants.front() {
            if now.duration_since(oldest) >= self.window {
                bucket.grants.pop_front();
            } else {
                break;
            }
        }

        if (bucket.grants.len() as u32) < self.points {
            bucket.grants.push_back(now);
            return Consumption::Granted {
                remaining: self.points - bucket.grants.len() as u32,
            };
        }

        let window_left = bucket
            .grants
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default();
        let wait = window_left.max(self.block);
        bucket.blocked_until = Some(now + wait);

        debug!(
            model = %self.model,
            key,
            wait_ms = wait.as_millis() as u64,
            "Rate limit bucket exhausted"
        );
        Consumption::Wait(wait)
    }

    /// Forget a key's bucket
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }
}

/// Lazily created limiters, one per model
#[derive(Debug)]
pub struct RateLimiterRegistry {
    defaults: RateLimitConfig,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    /// Create an empty registry using `defaults` for every new limiter
    pub fn new(defaults: RateLimitConfig) -> Self {
        Self {
            defaults,
            limiters: DashMap::new(),
        }
    }

    /// Return the limiter for `model`, creating it on first use
    ///
    /// Creation failure is returned to the caller; there is no unlimited
    /// fallback.
    pub fn acquire(&self, model: &str) -> Result<Arc<RateLimiter>> {
        match self.limiters.entry(model.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let limiter = Arc::new(RateLimiter::new(
                    model,
                    self.defaults.points,
                    self.defaults.window_seconds,
                    self.defaults.block_seconds,
                )?);
                info!(
                    model,
                    points = self.defaults.points,
                    window_seconds = self.defaults.window_seconds,
                    "Created rate limiter"
                );
                entry.insert(Arc::clone(&limiter));
                Ok(limiter)
            }
        }
    }

    /// Bucket key for a call, according to the configured scope
    pub fn bucket_key(&self, model: &str, task_type: &str, stream_key: Option<&str>) -> String {
        match self.defaults.scope {
            RateLimitScope::Model => model.to_string(),
            RateLimitScope::Stream => {
                format!("{}:{}:{}", model, task_type, stream_key.unwrap_or("default"))
            }
        }
    }

    /// Number of limiters created so far
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Returns true if no limiter has been created
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
