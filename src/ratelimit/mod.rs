use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::KvStore;

/// Endpoint classes with distinct per-minute budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// State-changing controller commands (resolve, control, approve).
    Critical,
    /// Everything else that writes (audit log entries, admin updates).
    Standard,
    /// System-wide manual detection trigger.
    ManualDetection,
}

impl EndpointKind {
    fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Critical => "critical",
            EndpointKind::Standard => "standard",
            EndpointKind::ManualDetection => "manual_detection",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_seconds: u64,
}

/// Sliding-window counter keyed by `(principal, endpoint kind)`, stored in
/// the shared KV store so every engine instance sees the same budgets.
pub struct RateLimiter {
    kv: Arc<KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<KvStore>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    fn budget(&self, kind: EndpointKind) -> u32 {
        match kind {
            EndpointKind::Critical => self.config.critical_per_minute,
            EndpointKind::Standard => self.config.standard_per_minute,
            EndpointKind::ManualDetection => self.config.manual_detection_per_minute,
        }
    }

    pub async fn hit(&self, principal: &str, kind: EndpointKind) -> RateDecision {
        let key = format!("ratelimit:{}:{}", principal, kind.as_str());
        let window = Duration::from_secs(self.config.window_secs);
        let (count, remaining_ttl) = self.kv.incr_with_ttl(&key, window).await;
        let budget = self.budget(kind) as u64;
        RateDecision {
            allowed: count <= budget,
            remaining: budget.saturating_sub(count) as u32,
            reset_seconds: remaining_ttl.as_secs().max(1),
        }
    }

    /// Consult the budget and turn an exhausted window into the caller-facing
    /// error carrying the retry-after hint.
    pub async fn check(&self, principal: &str, kind: EndpointKind) -> EngineResult<RateDecision> {
        let decision = self.hit(principal, kind).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(EngineError::RateLimited {
                retry_after_secs: decision.reset_seconds,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(critical: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(KvStore::new()),
            RateLimitConfig {
                critical_per_minute: critical,
                standard_per_minute: 30,
                manual_detection_per_minute: 5,
                window_secs: 60,
            },
        )
    }

    #[tokio::test]
    async fn burst_over_budget_rejects_exactly_the_excess() {
        let limiter = limiter(10);
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..12 {
            match limiter.check("CTR001", EndpointKind::Critical).await {
                Ok(_) => accepted += 1,
                Err(EngineError::RateLimited { retry_after_secs }) => {
                    assert!(retry_after_secs >= 1);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn budgets_are_per_principal() {
        let limiter = limiter(1);
        assert!(limiter.check("a", EndpointKind::Critical).await.is_ok());
        assert!(limiter.check("a", EndpointKind::Critical).await.is_err());
        assert!(limiter.check("b", EndpointKind::Critical).await.is_ok());
    }

    #[tokio::test]
    async fn kinds_do_not_share_windows() {
        let limiter = limiter(1);
        assert!(limiter.check("a", EndpointKind::Critical).await.is_ok());
        assert!(limiter.check("a", EndpointKind::Standard).await.is_ok());
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let limiter = limiter(3);
        let first = limiter.hit("a", EndpointKind::Critical).await;
        assert_eq!(first.remaining, 2);
        let second = limiter.hit("a", EndpointKind::Critical).await;
        assert_eq!(second.remaining, 1);
    }
}
