use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QuorumError, Result};

/// Token-bucket shape for one agent: burst capacity plus steady refill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl RateLimitSettings {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        RateLimitSettings {
            capacity: capacity.max(1),
            refill_per_second: if refill_per_second > 0.0 {
                refill_per_second
            } else {
                1.0
            },
        }
    }
}

/// Provider-shaped defaults.
pub fn default_settings(agent: &str) -> RateLimitSettings {
    match agent {
        "claude" => RateLimitSettings::new(5, 0.5),
        "gemini" => RateLimitSettings::new(10, 1.0),
        "codex" => RateLimitSettings::new(3, 0.2),
        "copilot" => RateLimitSettings::new(5, 0.5),
        "opencode" => RateLimitSettings::new(10, 1.0),
        _ => RateLimitSettings::new(5, 0.5),
    }
}

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    /// Tokio's mutex queues waiters fairly, which gives FIFO admission on
    /// top of the limiter.
    turn: tokio::sync::Mutex<()>,
}

impl Bucket {
    fn new(settings: RateLimitSettings) -> Self {
        let period = Duration::from_secs_f64(1.0 / settings.refill_per_second);
        let capacity = NonZeroU32::new(settings.capacity).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(capacity);
        Bucket {
            limiter: RateLimiter::direct(quota),
            turn: tokio::sync::Mutex::new(()),
        }
    }
}

/// Process-global registry of per-agent token buckets.
///
/// Scope is deliberately the whole process, not one workflow: concurrent
/// workflows share each agent's bucket so they cannot cumulatively exceed a
/// provider quota.
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    overrides: HashMap<String, RateLimitSettings>,
}

impl RateLimiterRegistry {
    pub fn new(overrides: HashMap<String, RateLimitSettings>) -> Arc<Self> {
        Arc::new(RateLimiterRegistry {
            buckets: Mutex::new(HashMap::new()),
            overrides,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(HashMap::new())
    }

    fn bucket_for(&self, agent: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get(agent) {
            return Arc::clone(bucket);
        }
        let settings = self
            .overrides
            .get(agent)
            .copied()
            .unwrap_or_else(|| default_settings(agent));
        debug!(agent, ?settings, "creating rate-limit bucket");
        let bucket = Arc::new(Bucket::new(settings));
        buckets.insert(agent.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Block until a token is available for `agent` or the caller is
    /// cancelled. Tokens are whole; waiters are admitted in arrival order.
    pub async fn acquire(&self, agent: &str, cancel: &CancellationToken) -> Result<()> {
        let bucket = self.bucket_for(agent);
        let _turn = tokio::select! {
            guard = bucket.turn.lock() => guard,
            _ = cancel.cancelled() => return Err(QuorumError::Cancelled),
        };
        tokio::select! {
            _ = bucket.limiter.until_ready() => Ok(()),
            _ = cancel.cancelled() => Err(QuorumError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn defaults_match_provider_limits() {
        assert_eq!(default_settings("claude"), RateLimitSettings::new(5, 0.5));
        assert_eq!(default_settings("gemini"), RateLimitSettings::new(10, 1.0));
        assert_eq!(default_settings("codex"), RateLimitSettings::new(3, 0.2));
        assert_eq!(default_settings("copilot"), RateLimitSettings::new(5, 0.5));
        assert_eq!(default_settings("opencode"), RateLimitSettings::new(10, 1.0));
    }

    #[test]
    fn settings_are_sanitized() {
        let s = RateLimitSettings::new(0, -1.0);
        assert_eq!(s.capacity, 1);
        assert!(s.refill_per_second > 0.0);
    }

    #[tokio::test]
    async fn burst_within_capacity_is_immediate() {
        let registry = RateLimiterRegistry::new(HashMap::from([(
            "claude".to_string(),
            RateLimitSettings::new(5, 0.5),
        )]));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..5 {
            registry.acquire("claude", &cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn acquisitions_beyond_capacity_wait_for_refill() {
        let registry = RateLimiterRegistry::new(HashMap::from([(
            "fast".to_string(),
            RateLimitSettings::new(2, 50.0),
        )]));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..12 {
            registry.acquire("fast", &cancel).await.unwrap();
        }
        // 12 permits from {C=2, r=50/s} needs at least (12-2)/50 = 200 ms.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_cancelled() {
        let registry = RateLimiterRegistry::new(HashMap::from([(
            "slow".to_string(),
            RateLimitSettings::new(1, 0.1),
        )]));
        let cancel = CancellationToken::new();
        registry.acquire("slow", &cancel).await.unwrap();

        cancel.cancel();
        let err = registry.acquire("slow", &cancel).await.unwrap_err();
        assert!(matches!(err, QuorumError::Cancelled));
    }

    #[tokio::test]
    async fn buckets_are_shared_per_agent_name() {
        let registry = RateLimiterRegistry::new(HashMap::from([(
            "shared".to_string(),
            RateLimitSettings::new(2, 50.0),
        )]));
        let cancel = CancellationToken::new();

        // Two "workflows" hammering the same agent drain one shared bucket.
        let start = Instant::now();
        let a = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for _ in 0..6 {
                    registry.acquire("shared", &cancel).await.unwrap();
                }
            })
        };
        let b = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for _ in 0..6 {
                    registry.acquire("shared", &cancel).await.unwrap();
                }
            })
        };
        a.await.unwrap();
        b.await.unwrap();
        // 12 permits from {C=2, r=50/s}, shared across both callers.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
