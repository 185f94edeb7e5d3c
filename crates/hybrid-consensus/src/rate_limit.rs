// Sliding-window request limiter used as the default DDoS guard.
//
// Every (bucket, identity) pair gets `max_requests` per `window`. Buckets are
// independent: exhausting "vote_verify:alice" does not affect "fork_resolution".

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::services::RateLimiter;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    /// Per-bucket overrides, e.g. a tighter budget for fork resolution.
    overrides: HashMap<String, RateLimitConfig>,
    requests: RwLock<HashMap<(String, String), VecDeque<Instant>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        SlidingWindowRateLimiter {
            config,
            overrides: HashMap::new(),
            requests: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>, config: RateLimitConfig) -> Self {
        self.overrides.insert(bucket.into(), config);
        self
    }

    fn config_for(&self, bucket: &str) -> &RateLimitConfig {
        self.overrides.get(bucket).unwrap_or(&self.config)
    }

    /// Synchronous core of `check_request`.
    pub fn allow(&self, bucket: &str, identity: &str) -> bool {
        let config = self.config_for(bucket);
        let now = Instant::now();
        let mut requests = self.requests.write();
        let window = requests
            .entry((bucket.to_string(), identity.to_string()))
            .or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() as u32 >= config.max_requests {
            warn!("Rate limit hit: bucket={} identity={}", bucket, identity);
            return false;
        }
        window.push_back(now);
        debug!(
            "Request allowed: bucket={} identity={} ({}/{})",
            bucket,
            identity,
            window.len(),
            config.max_requests
        );
        true
    }
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check_request(&self, bucket: &str, identity: &str) -> anyhow::Result<bool> {
        Ok(self.allow(bucket, identity))
    }
}
