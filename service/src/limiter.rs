//! Rate limiting
//!
//! Admission control in front of the dispatcher: one global limiter checked
//! first, then a per-subscriber limiter when the subscriber carries a policy
//! (or a service-wide default exists). Three algorithms are selectable per
//! policy: sliding window, fixed window and token bucket. Rejections are not
//! errors; they surface a `retry_after` hint and the delivery is rescheduled.
//!
//! Admission control must never become the failure point: any internal
//! inconsistency (zero-width window, non-positive refill rate) fails open.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use webhook_core::config::RateLimitConfig;
use webhook_core::model::{RateLimitAlgorithm, RateLimitPolicy};
use webhook_core::{Subscriber, SubscriberId};

/// Which limiter rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Subscriber,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Limited {
        scope: LimitScope,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

enum LimiterState {
    Sliding { hits: VecDeque<Instant> },
    Fixed { bucket: u64, count: u32 },
    TokenBucket { tokens: f64, last_refill: Instant },
}

impl LimiterState {
    fn for_policy(policy: &RateLimitPolicy) -> Self {
        match policy.algorithm {
            RateLimitAlgorithm::SlidingWindow => LimiterState::Sliding {
                hits: VecDeque::new(),
            },
            RateLimitAlgorithm::FixedWindow => LimiterState::Fixed { bucket: 0, count: 0 },
            RateLimitAlgorithm::TokenBucket => LimiterState::TokenBucket {
                tokens: policy.burst_limit as f64,
                last_refill: Instant::now(),
            },
        }
    }
}

struct Limiter {
    policy: RateLimitPolicy,
    state: LimiterState,
    last_activity: Instant,
    /// Epoch the limiter was created against, for bucket arithmetic
    origin: Instant,
}

impl Limiter {
    fn new(policy: RateLimitPolicy) -> Self {
        Self {
            state: LimiterState::for_policy(&policy),
            policy,
            last_activity: Instant::now(),
            origin: Instant::now(),
        }
    }

    /// Run the admission check, mutating state. `None` means the limiter
    /// could not make a decision (fails open at the caller).
    fn check(&mut self, now: Instant) -> Option<AdmitResult> {
        self.last_activity = now;
        let window = Duration::from_millis(self.policy.window_ms);
        match &mut self.state {
            LimiterState::Sliding { hits } => {
                if window.is_zero() {
                    return None;
                }
                while let Some(oldest) = hits.front() {
                    if now.duration_since(*oldest) >= window {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
                // An empty window always admits its first request, even when
                // max_requests is zero.
                if hits.is_empty() || (hits.len() as u32) < self.policy.max_requests {
                    hits.push_back(now);
                    Some(AdmitResult::Admitted)
                } else {
                    let oldest = *hits.front().expect("non-empty window");
                    let available = oldest + window - now;
                    Some(AdmitResult::Rejected {
                        retry_after: ceil_to_seconds(available),
                    })
                }
            }
            LimiterState::Fixed { bucket, count } => {
                if window.is_zero() {
                    return None;
                }
                let elapsed = now.duration_since(self.origin);
                let current = (elapsed.as_millis() / window.as_millis().max(1)) as u64;
                if current != *bucket {
                    *bucket = current;
                    *count = 0;
                }
                if *count == 0 || *count < self.policy.max_requests {
                    *count += 1;
                    Some(AdmitResult::Admitted)
                } else {
                    let next_bucket = self.origin + window * (current as u32 + 1);
                    Some(AdmitResult::Rejected {
                        retry_after: ceil_to_seconds(next_bucket - now),
                    })
                }
            }
            LimiterState::TokenBucket { tokens, last_refill } => {
                let rate = self.policy.refill_rate;
                if rate <= 0.0 {
                    return None;
                }
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rate).min(self.policy.burst_limit as f64);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Some(AdmitResult::Admitted)
                } else {
                    let deficit = 1.0 - *tokens;
                    let wait = Duration::from_secs_f64(deficit / rate);
                    Some(AdmitResult::Rejected {
                        retry_after: ceil_to_seconds(wait),
                    })
                }
            }
        }
    }
}

enum AdmitResult {
    Admitted,
    Rejected { retry_after: Duration },
}

/// Round up to whole seconds, minimum one second.
fn ceil_to_seconds(duration: Duration) -> Duration {
    let secs = duration.as_secs_f64().ceil().max(1.0);
    Duration::from_secs(secs as u64)
}

/// Global + per-subscriber limiters, keyed by subscriber id.
pub struct RateLimiterRegistry {
    global: Option<RwLock<Limiter>>,
    subscribers: RwLock<HashMap<SubscriberId, Limiter>>,
    default_policy: Option<RateLimitPolicy>,
    idle_reclaim: Duration,
}

impl RateLimiterRegistry {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            global: config
                .global_enabled
                .then(|| RwLock::new(Limiter::new(config.global.clone()))),
            subscribers: RwLock::new(HashMap::new()),
            default_policy: config.subscriber_default.clone(),
            idle_reclaim: Duration::from_millis(config.idle_reclaim_ms),
        }
    }

    /// Admission check for one dispatch: global limiter first (its rejection
    /// short-circuits), then the subscriber's own policy.
    pub async fn admit(&self, subscriber: &Subscriber) -> Admission {
        let now = Instant::now();

        if let Some(global) = &self.global {
            match global.write().await.check(now) {
                Some(AdmitResult::Rejected { retry_after }) => {
                    return Admission::Limited {
                        scope: LimitScope::Global,
                        retry_after,
                    };
                }
                Some(AdmitResult::Admitted) => {}
                None => {
                    warn!("global rate limiter could not decide, failing open");
                }
            }
        }

        let policy = subscriber
            .rate_limit
            .clone()
            .or_else(|| self.default_policy.clone());
        let Some(policy) = policy else {
            return Admission::Granted;
        };

        let mut map = self.subscribers.write().await;
        let limiter = map
            .entry(subscriber.id.clone())
            .or_insert_with(|| Limiter::new(policy));
        match limiter.check(now) {
            Some(AdmitResult::Admitted) => Admission::Granted,
            Some(AdmitResult::Rejected { retry_after }) => {
                debug!(subscriber = %subscriber.id, ?retry_after, "rate limited");
                Admission::Limited {
                    scope: LimitScope::Subscriber,
                    retry_after,
                }
            }
            None => {
                warn!(subscriber = %subscriber.id, "rate limiter could not decide, failing open");
                Admission::Granted
            }
        }
    }

    /// Drop limiters with no activity inside the reclaim window.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.subscribers.write().await;
        let before = map.len();
        map.retain(|_, limiter| now.duration_since(limiter.last_activity) < self.idle_reclaim);
        before - map.len()
    }

    pub async fn tracked(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber_with(policy: RateLimitPolicy) -> Subscriber {
        let mut sub = Subscriber::new("sub-1", "https://example.com/hook");
        sub.rate_limit = Some(policy);
        sub
    }

    fn registry() -> RateLimiterRegistry {
        RateLimiterRegistry::new(&RateLimitConfig {
            global_enabled: false,
            ..RateLimitConfig::default()
        })
    }

    #[tokio::test]
    async fn sliding_window_admits_up_to_max() {
        let reg = registry();
        let sub = subscriber_with(RateLimitPolicy {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests: 3,
            window_ms: 60_000,
            ..RateLimitPolicy::default()
        });
        for _ in 0..3 {
            assert!(reg.admit(&sub).await.is_granted());
        }
        match reg.admit(&sub).await {
            Admission::Limited { scope, retry_after } => {
                assert_eq!(scope, LimitScope::Subscriber);
                assert!(retry_after >= Duration::from_secs(1));
                assert!(retry_after <= Duration::from_secs(60));
            }
            Admission::Granted => panic!("expected limit"),
        }
    }

    #[tokio::test]
    async fn zero_max_requests_admits_first_of_empty_window() {
        let reg = registry();
        let sub = subscriber_with(RateLimitPolicy {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests: 0,
            window_ms: 60_000,
            ..RateLimitPolicy::default()
        });
        assert!(reg.admit(&sub).await.is_granted());
        assert!(!reg.admit(&sub).await.is_granted());
    }

    #[tokio::test]
    async fn fixed_window_resets_on_bucket_change() {
        let reg = registry();
        let sub = subscriber_with(RateLimitPolicy {
            algorithm: RateLimitAlgorithm::FixedWindow,
            max_requests: 2,
            window_ms: 50,
            ..RateLimitPolicy::default()
        });
        assert!(reg.admit(&sub).await.is_granted());
        assert!(reg.admit(&sub).await.is_granted());
        assert!(!reg.admit(&sub).await.is_granted());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(reg.admit(&sub).await.is_granted());
    }

    #[tokio::test]
    async fn token_bucket_consumes_and_refills() {
        let reg = registry();
        let sub = subscriber_with(RateLimitPolicy {
            algorithm: RateLimitAlgorithm::TokenBucket,
            max_requests: 0,
            window_ms: 1_000,
            burst_limit: 2,
            refill_rate: 100.0,
        });
        assert!(reg.admit(&sub).await.is_granted());
        assert!(reg.admit(&sub).await.is_granted());
        // Bucket drained; at 100 tokens/s it refills within a few ms
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reg.admit(&sub).await.is_granted());
    }

    #[tokio::test]
    async fn global_limit_short_circuits() {
        let reg = RateLimiterRegistry::new(&RateLimitConfig {
            global_enabled: true,
            global: RateLimitPolicy {
                algorithm: RateLimitAlgorithm::SlidingWindow,
                max_requests: 1,
                window_ms: 60_000,
                ..RateLimitPolicy::default()
            },
            subscriber_default: None,
            idle_reclaim_ms: 1_000,
        });
        let sub = Subscriber::new("sub-1", "https://example.com/hook");
        assert!(reg.admit(&sub).await.is_granted());
        match reg.admit(&sub).await {
            Admission::Limited { scope, .. } => assert_eq!(scope, LimitScope::Global),
            Admission::Granted => panic!("expected global limit"),
        }
        // Nothing was recorded against the subscriber
        assert_eq!(reg.tracked().await, 0);
    }

    #[tokio::test]
    async fn invalid_policy_fails_open() {
        let reg = registry();
        let sub = subscriber_with(RateLimitPolicy {
            algorithm: RateLimitAlgorithm::TokenBucket,
            refill_rate: 0.0,
            ..RateLimitPolicy::default()
        });
        assert!(reg.admit(&sub).await.is_granted());
        assert!(reg.admit(&sub).await.is_granted());
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_limiters() {
        let reg = RateLimiterRegistry::new(&RateLimitConfig {
            global_enabled: false,
            idle_reclaim_ms: 20,
            ..RateLimitConfig::default()
        });
        let sub = subscriber_with(RateLimitPolicy::default());
        reg.admit(&sub).await;
        assert_eq!(reg.tracked().await, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(reg.sweep().await, 1);
        assert_eq!(reg.tracked().await, 0);
    }

    #[tokio::test]
    async fn subscribers_are_limited_independently() {
        let reg = registry();
        let policy = RateLimitPolicy {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests: 1,
            window_ms: 60_000,
            ..RateLimitPolicy::default()
        };
        let a = subscriber_with(policy.clone());
        let mut b = subscriber_with(policy);
        b.id = "sub-2".to_string();

        assert!(reg.admit(&a).await.is_granted());
        assert!(!reg.admit(&a).await.is_granted());
        assert!(reg.admit(&b).await.is_granted());
    }
}
