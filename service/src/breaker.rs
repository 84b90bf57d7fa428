//! Circuit breaking
//!
//! One breaker per subscriber endpoint, isolating a failing target from the
//! rest of the fleet:
//!
//! ```text
//! CLOSED    --[should_open()]-->            OPEN
//! OPEN      --[now >= next_attempt]-->      HALF_OPEN
//! HALF_OPEN --[successes >= threshold]-->   CLOSED
//! HALF_OPEN --[any failure]-->              OPEN
//! ```
//!
//! `should_open` fires only once the recent-call volume reaches the
//! configured threshold, and then on any of: consecutive failures, windowed
//! error rate, or windowed slow-call rate. While OPEN, calls are rejected
//! synchronously with a `retry_after` hint. State is in-memory only and
//! starts closed after a restart.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use webhook_core::model::CircuitBreakerPolicy;
use webhook_core::{Subscriber, SubscriberId};

/// Hard cap on retained outcomes, independent of the time window.
const MAX_OUTCOMES: usize = 512;

/// Breaker states, as reported by `state()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allowed,
    /// Circuit is open; retry after the hint. Not an error; the delivery
    /// stays retryable.
    Open { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    at: Instant,
    success: bool,
    slow: bool,
    #[allow(dead_code)]
    timeout: bool,
}

struct Breaker {
    policy: CircuitBreakerPolicy,
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    outcomes: VecDeque<CallOutcome>,
    next_attempt: Option<Instant>,
}

impl Breaker {
    fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            outcomes: VecDeque::new(),
            next_attempt: None,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> BreakerDecision {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => BreakerDecision::Allowed,
            BreakerState::Open => {
                let next = self.next_attempt.unwrap_or(now);
                if now >= next {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    BreakerDecision::Allowed
                } else {
                    BreakerDecision::Open {
                        retry_after: next - now,
                    }
                }
            }
        }
    }

    fn record(&mut self, now: Instant, success: bool, response_time: Duration, timeout: bool) {
        let slow = response_time >= Duration::from_millis(self.policy.slow_call_threshold_ms);
        self.outcomes.push_back(CallOutcome {
            at: now,
            success,
            slow,
            timeout,
        });
        if self.outcomes.len() > MAX_OUTCOMES {
            self.outcomes.pop_front();
        }
        self.prune(now);

        if success {
            self.consecutive_failures = 0;
            if self.state == BreakerState::HalfOpen {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.policy.success_threshold {
                    self.close();
                }
            }
        } else {
            self.consecutive_failures += 1;
            match self.state {
                BreakerState::HalfOpen => self.open(now),
                BreakerState::Closed => {
                    if self.should_open() {
                        self.open(now);
                    }
                }
                BreakerState::Open => {}
            }
        }
    }

    fn should_open(&self) -> bool {
        let volume = self.outcomes.len() as u32;
        if volume < self.policy.volume_threshold {
            return false;
        }
        if self.consecutive_failures >= self.policy.failure_threshold {
            return true;
        }
        let failures = self.outcomes.iter().filter(|o| !o.success).count() as f64;
        let slow = self.outcomes.iter().filter(|o| o.slow).count() as f64;
        let total = volume as f64;
        failures * 100.0 / total >= self.policy.error_threshold
            || slow * 100.0 / total >= self.policy.slow_call_rate_threshold
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.next_attempt = Some(now + Duration::from_millis(self.policy.reset_timeout_ms));
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.next_attempt = None;
    }

    fn prune(&mut self, now: Instant) {
        let window = Duration::from_millis(self.policy.monitoring_period_ms);
        while let Some(front) = self.outcomes.front() {
            if now.duration_since(front.at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-subscriber breakers, keyed by subscriber id.
pub struct CircuitBreakerRegistry {
    default_policy: CircuitBreakerPolicy,
    breakers: RwLock<HashMap<SubscriberId, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_policy: CircuitBreakerPolicy) -> Self {
        Self {
            default_policy,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn policy_for(&self, subscriber: &Subscriber) -> CircuitBreakerPolicy {
        subscriber
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Per-attempt timeout the dispatcher wraps the call in; timeouts are
    /// recorded as failures.
    pub fn timeout_for(&self, subscriber: &Subscriber) -> Duration {
        Duration::from_millis(self.policy_for(subscriber).timeout_ms)
    }

    pub async fn try_acquire(&self, subscriber: &Subscriber) -> BreakerDecision {
        let mut map = self.breakers.write().await;
        let breaker = map
            .entry(subscriber.id.clone())
            .or_insert_with(|| Breaker::new(self.policy_for(subscriber)));
        let decision = breaker.try_acquire(Instant::now());
        if let BreakerDecision::Open { retry_after } = decision {
            debug!(subscriber = %subscriber.id, ?retry_after, "circuit open, rejecting call");
        }
        decision
    }

    pub async fn record_success(&self, id: &str, response_time: Duration) {
        let mut map = self.breakers.write().await;
        if let Some(breaker) = map.get_mut(id) {
            let was = breaker.state;
            breaker.record(Instant::now(), true, response_time, false);
            if was != breaker.state {
                info!(subscriber = id, from = ?was, to = ?breaker.state, "circuit state change");
            }
        }
    }

    pub async fn record_failure(&self, id: &str, response_time: Duration, timed_out: bool) {
        let mut map = self.breakers.write().await;
        if let Some(breaker) = map.get_mut(id) {
            let was = breaker.state;
            breaker.record(Instant::now(), false, response_time, timed_out);
            if was != breaker.state {
                info!(subscriber = id, from = ?was, to = ?breaker.state, "circuit state change");
            }
        }
    }

    pub async fn state(&self, id: &str) -> BreakerState {
        self.breakers
            .read()
            .await
            .get(id)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub async fn tracked(&self) -> usize {
        self.breakers.read().await.len()
    }

    /// Count of breakers currently open, for the stats surface.
    pub async fn open_count(&self) -> usize {
        self.breakers
            .read()
            .await
            .values()
            .filter(|b| b.state == BreakerState::Open)
            .count()
    }
}
