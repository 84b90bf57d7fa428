//! Webhook dispatcher
//!
//! Takes `(subscriber, event)` pairs from the router and drives each
//! delivery to a terminal outcome: sign, POST, classify, retry with jittered
//! backoff, and finally either record success or hand the frozen delivery to
//! the dead-letter queue. Every transition persists a `DeliveryAttempt` and
//! a history record; those stores are best-effort and never fail a delivery.
//!
//! Admission control runs per attempt: the rate limiter first, then the
//! subscriber's circuit breaker. Rejections are not errors: the attempt is
//! skipped, marked retryable, and rescheduled after the `retry_after` hint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use webhook_core::config::{DispatcherConfig, ServiceConfig};
use webhook_core::{sign_payload, Delivery, DeliveryAttempt, DeliveryStatus, Event, Subscriber};

use crate::breaker::{BreakerDecision, CircuitBreakerRegistry};
use crate::dlq::DeadLetterQueue;
use crate::error::TransportError;
use crate::history::DeliveryHistory;
use crate::limiter::{Admission, RateLimiterRegistry};

/// Canonical delivery headers.
pub const HEADER_ID: &str = "X-Webhook-Id";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// HTTP statuses retried with backoff; everything else non-2xx is terminal.
const RETRYABLE_STATUS: [u16; 9] = [408, 429, 500, 502, 503, 504, 507, 509, 510];

/// A fully constructed outbound request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// Response as seen by the classifier; body already bounded.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// HTTP seam. The production implementation is [`ReqwestTransport`]; tests
/// script outcomes through a mock.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

/// reqwest-backed transport with bounded response capture.
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_response_bytes: config.max_response_bytes,
        }
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| TransportError::InvalidUrl {
            message: e.to_string(),
        })?;

        let mut builder = self
            .client
            .post(url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let mut response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    timeout_ms: request.timeout.as_millis() as u64,
                }
            } else if e.is_connect() {
                TransportError::Connect {
                    message: e.to_string(),
                }
            } else {
                TransportError::Other {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        // Stream the body so an oversized response aborts the transfer
        // instead of buffering it whole.
        let mut body = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        timeout_ms: request.timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Other {
                        message: e.to_string(),
                    }
                }
            })?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(TransportError::ResponseTooLarge {
                    limit: self.max_response_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(WebhookResponse {
            status,
            headers,
            body,
        })
    }
}

/// Persistence for delivery attempts.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn append(&self, attempt: DeliveryAttempt) -> Result<(), String>;
    async fn for_delivery(&self, delivery_id: &str) -> Vec<DeliveryAttempt>;
}

#[derive(Default)]
pub struct InMemoryAttemptStore {
    attempts: Mutex<Vec<DeliveryAttempt>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn append(&self, attempt: DeliveryAttempt) -> Result<(), String> {
        self.attempts.lock().await.push(attempt);
        Ok(())
    }

    async fn for_delivery(&self, delivery_id: &str) -> Vec<DeliveryAttempt> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.delivery_id == delivery_id)
            .cloned()
            .collect()
    }
}

/// Structured result handed back to the caller of `deliver`.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub duration: Duration,
    pub attempts: u32,
}

/// How one attempt ended, before retry budgeting.
enum AttemptOutcome {
    Success {
        response: WebhookResponse,
        elapsed: Duration,
    },
    Retryable {
        error: String,
        status: Option<u16>,
        response: Option<WebhookResponse>,
        elapsed: Duration,
        retry_after: Option<Duration>,
        /// Skipped attempts (rate limit / open circuit) never reached the wire
        skipped: bool,
    },
    Terminal {
        error: String,
        status: Option<u16>,
        response: Option<WebhookResponse>,
        elapsed: Duration,
    },
}

/// Counters exposed on the stats surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: usize,
}

pub struct Dispatcher {
    transport: Arc<dyn WebhookTransport>,
    limiter: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    attempts: Arc<dyn AttemptStore>,
    history: Arc<DeliveryHistory>,
    dlq: Arc<DeadLetterQueue>,
    config: DispatcherConfig,
    user_agent: String,
    shutdown: watch::Receiver<bool>,
    in_flight: AtomicUsize,
    drained: Notify,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        limiter: Arc<RateLimiterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        attempts: Arc<dyn AttemptStore>,
        history: Arc<DeliveryHistory>,
        dlq: Arc<DeadLetterQueue>,
        config: DispatcherConfig,
        service: &ServiceConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            limiter,
            breakers,
            attempts,
            history,
            dlq,
            config,
            user_agent: service.user_agent.clone(),
            shutdown,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Submit one delivery for a matched subscriber. Spawns the delivery
    /// task and returns immediately; the router calls this for every match
    /// before the observer acknowledges the change.
    pub fn submit(self: &Arc<Self>, subscriber: Arc<Subscriber>, event: Event) {
        let retry = subscriber
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let delivery = Delivery::for_subscriber(&subscriber, event, retry);
        let dispatcher = Arc::clone(self);
        dispatcher.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _ = dispatcher.deliver(&subscriber, delivery).await;
            if dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                dispatcher.drained.notify_waiters();
            }
        });
    }

    /// Run a delivery to its terminal outcome. Used directly by the DLQ
    /// replay path and indirectly by `submit`.
    pub async fn deliver(&self, subscriber: &Subscriber, delivery: Delivery) -> DeliveryOutcome {
        self.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let max_attempts = delivery.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        let mut shutdown = self.shutdown.clone();

        loop {
            attempt += 1;
            let outcome = self.attempt_once(subscriber, &delivery).await;

            match outcome {
                AttemptOutcome::Success { response, elapsed } => {
                    self.persist_attempt(&delivery, attempt, DeliveryStatus::Success, Some(&response), None, elapsed, None, false)
                        .await;
                    self.succeeded.fetch_add(1, Ordering::Relaxed);
                    if let Some(entry_id) = &delivery.replayed_from {
                        self.dlq.update_status(entry_id, true, None).await;
                    }
                    debug!(
                        delivery = %delivery.id,
                        subscriber = %delivery.subscriber_id,
                        event = %delivery.event.id,
                        attempt,
                        "delivery succeeded"
                    );
                    return DeliveryOutcome {
                        success: true,
                        status_code: Some(response.status),
                        error: None,
                        retryable: false,
                        retry_after: None,
                        duration: started.elapsed(),
                        attempts: attempt,
                    };
                }
                AttemptOutcome::Retryable {
                    error,
                    status,
                    response,
                    elapsed,
                    retry_after,
                    skipped,
                } => {
                    // Skipped attempts (admission rejections) do not consume
                    // the wire, but they do consume retry budget so an
                    // endpoint behind a stuck-open circuit still terminates.
                    if attempt < max_attempts {
                        let delay = retry_after.unwrap_or_else(|| delivery.retry.delay(attempt));
                        let next_retry_at = Utc::now()
                            + chrono::Duration::milliseconds(delay.as_millis() as i64);
                        self.persist_attempt(
                            &delivery,
                            attempt,
                            DeliveryStatus::Retry,
                            response.as_ref(),
                            Some(&error),
                            elapsed,
                            Some(next_retry_at),
                            false,
                        )
                        .await;
                        if !skipped {
                            debug!(
                                delivery = %delivery.id,
                                subscriber = %delivery.subscriber_id,
                                attempt,
                                ?delay,
                                %error,
                                "attempt failed, retrying"
                            );
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                warn!(delivery = %delivery.id, "shutdown during retry wait, abandoning delivery");
                                return self.abandoned(started, attempt, &error, status);
                            }
                        }
                        continue;
                    }
                    self.persist_attempt(
                        &delivery,
                        attempt,
                        DeliveryStatus::Failed,
                        response.as_ref(),
                        Some(&error),
                        elapsed,
                        None,
                        true,
                    )
                    .await;
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.dead_letter(&delivery, &error, attempt).await;
                    return DeliveryOutcome {
                        success: false,
                        status_code: status,
                        error: Some(error),
                        retryable: false,
                        retry_after: None,
                        duration: started.elapsed(),
                        attempts: attempt,
                    };
                }
                AttemptOutcome::Terminal {
                    error,
                    status,
                    response,
                    elapsed,
                } => {
                    self.persist_attempt(
                        &delivery,
                        attempt,
                        DeliveryStatus::Failed,
                        response.as_ref(),
                        Some(&error),
                        elapsed,
                        None,
                        true,
                    )
                    .await;
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.dead_letter(&delivery, &error, attempt).await;
                    info!(
                        delivery = %delivery.id,
                        subscriber = %delivery.subscriber_id,
                        event = %delivery.event.id,
                        attempt,
                        status = ?status,
                        %error,
                        "delivery failed terminally"
                    );
                    return DeliveryOutcome {
                        success: false,
                        status_code: status,
                        error: Some(error),
                        retryable: false,
                        retry_after: None,
                        duration: started.elapsed(),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// One admission check plus at most one wire attempt.
    async fn attempt_once(&self, subscriber: &Subscriber, delivery: &Delivery) -> AttemptOutcome {
        match self.limiter.admit(subscriber).await {
            Admission::Granted => {}
            Admission::Limited { scope, retry_after } => {
                return AttemptOutcome::Retryable {
                    error: format!("rate_limited_{}", match scope {
                        crate::limiter::LimitScope::Global => "global",
                        crate::limiter::LimitScope::Subscriber => "subscriber",
                    }),
                    status: None,
                    response: None,
                    elapsed: Duration::ZERO,
                    retry_after: Some(retry_after),
                    skipped: true,
                };
            }
        }

        match self.breakers.try_acquire(subscriber).await {
            BreakerDecision::Allowed => {}
            BreakerDecision::Open { retry_after } => {
                return AttemptOutcome::Retryable {
                    error: "circuit_open".to_string(),
                    status: None,
                    response: None,
                    elapsed: Duration::ZERO,
                    retry_after: Some(retry_after),
                    skipped: true,
                };
            }
        }

        let timeout = self
            .breakers
            .timeout_for(subscriber)
            .min(Duration::from_millis(self.config.request_timeout_ms));
        let request = self.build_request(delivery, timeout);
        let attempt_started = Instant::now();
        let result = tokio::time::timeout(timeout, self.transport.send(&request)).await;
        let elapsed = attempt_started.elapsed();

        match result {
            Ok(Ok(response)) if (200..300).contains(&response.status) => {
                self.breakers.record_success(&subscriber.id, elapsed).await;
                AttemptOutcome::Success { response, elapsed }
            }
            Ok(Ok(response)) if RETRYABLE_STATUS.contains(&response.status) => {
                self.breakers.record_failure(&subscriber.id, elapsed, false).await;
                AttemptOutcome::Retryable {
                    error: format!("http status {}", response.status),
                    status: Some(response.status),
                    response: Some(response),
                    elapsed,
                    retry_after: None,
                    skipped: false,
                }
            }
            Ok(Ok(response)) => {
                self.breakers.record_failure(&subscriber.id, elapsed, false).await;
                AttemptOutcome::Terminal {
                    error: format!("http status {}", response.status),
                    status: Some(response.status),
                    response: Some(response),
                    elapsed,
                }
            }
            Ok(Err(transport_error)) => {
                let timed_out = matches!(transport_error, TransportError::Timeout { .. });
                self.breakers
                    .record_failure(&subscriber.id, elapsed, timed_out)
                    .await;
                if transport_error.is_retryable() {
                    AttemptOutcome::Retryable {
                        error: transport_error.to_string(),
                        status: None,
                        response: None,
                        elapsed,
                        retry_after: None,
                        skipped: false,
                    }
                } else {
                    AttemptOutcome::Terminal {
                        error: transport_error.to_string(),
                        status: None,
                        response: None,
                        elapsed,
                    }
                }
            }
            Err(_elapsed) => {
                // The scoped timeout fired before the transport returned
                self.breakers.record_failure(&subscriber.id, elapsed, true).await;
                AttemptOutcome::Retryable {
                    error: "request_timeout".to_string(),
                    status: None,
                    response: None,
                    elapsed,
                    retry_after: None,
                    skipped: false,
                }
            }
        }
    }

    /// Canonical request: JSON body, webhook headers, signature when the
    /// subscriber has a secret. Custom headers overlay everything except the
    /// signature.
    fn build_request(&self, delivery: &Delivery, timeout: Duration) -> WebhookRequest {
        let event = &delivery.event;
        let body_value = json!({
            "id": event.id,
            "type": event.event_type,
            "timestamp": event.timestamp,
            "workspace": event.workspace,
            "data": event.data,
            "changes": event.changes,
        });
        let body = serde_json::to_vec(&body_value).unwrap_or_default();

        let mut headers: Vec<(String, String)> = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), self.user_agent.clone()),
            (HEADER_ID.to_string(), delivery.subscriber_id.clone()),
            (HEADER_EVENT.to_string(), event.event_type.clone()),
            (
                HEADER_TIMESTAMP.to_string(),
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
            (HEADER_DELIVERY.to_string(), delivery.id.clone()),
        ];

        for (name, value) in &delivery.headers {
            if name.eq_ignore_ascii_case(HEADER_SIGNATURE) {
                continue;
            }
            match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                Some(existing) => existing.1 = value.clone(),
                None => headers.push((name.clone(), value.clone())),
            }
        }

        if let Some(secret) = &delivery.secret {
            headers.push((HEADER_SIGNATURE.to_string(), sign_payload(secret, &body)));
        }

        WebhookRequest {
            url: delivery.url.clone(),
            headers,
            body,
            timeout,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_attempt(
        &self,
        delivery: &Delivery,
        attempt: u32,
        status: DeliveryStatus,
        response: Option<&WebhookResponse>,
        error: Option<&str>,
        elapsed: Duration,
        next_retry_at: Option<chrono::DateTime<Utc>>,
        final_attempt: bool,
    ) {
        let record = DeliveryAttempt {
            delivery_id: delivery.id.clone(),
            subscriber_id: delivery.subscriber_id.clone(),
            event_id: delivery.event.id.clone(),
            attempt,
            status,
            http_status: response.map(|r| r.status),
            response_body: response.map(|r| {
                let capture = &r.body[..r.body.len().min(self.config.response_capture_bytes)];
                String::from_utf8_lossy(capture).to_string()
            }),
            response_headers: response.map(|r| r.headers.clone()).unwrap_or_default(),
            error: error.map(str::to_string),
            duration_ms: elapsed.as_millis() as u64,
            next_retry_at,
            final_attempt,
            at: Utc::now(),
        };
        if let Err(store_error) = self.attempts.append(record.clone()).await {
            warn!(
                delivery = %delivery.id,
                subscriber = %delivery.subscriber_id,
                error = %store_error,
                "attempt persist failed"
            );
        }
        self.history.record(&record, &delivery.event).await;
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str, attempts: u32) {
        if let Some(entry_id) = &delivery.replayed_from {
            // A failed replay restores its original entry instead of
            // creating a second one.
            self.dlq
                .update_status(entry_id, false, Some(reason.to_string()))
                .await;
        } else {
            self.dlq.add(delivery.clone(), reason, attempts).await;
        }
    }

    fn abandoned(
        &self,
        started: Instant,
        attempts: u32,
        error: &str,
        status: Option<u16>,
    ) -> DeliveryOutcome {
        DeliveryOutcome {
            success: false,
            status_code: status,
            error: Some(format!("shutdown while retrying: {error}")),
            retryable: true,
            retry_after: None,
            duration: started.elapsed(),
            attempts,
        }
    }

    /// Wait until in-flight deliveries reach zero or the grace period ends.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
        true
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use webhook_core::config::RateLimitConfig;
    use webhook_core::model::{CircuitBreakerPolicy, EventSource, OperationKind};
    use webhook_core::RetryPolicy;

    use crate::dlq::{DlqFilter, InMemoryDlqStore};
    use crate::history::InMemoryHistoryStore;

    /// One scripted step of the mock transport.
    enum Step {
        Status(u16),
        Error(TransportError),
        Hang,
    }

    struct MockTransport {
        steps: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<WebhookRequest>>,
    }

    impl MockTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    #[async_trait]
    impl WebhookTransport for MockTransport {
        async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
            self.requests.lock().await.push(request.clone());
            let step = self.steps.lock().await.pop_front();
            match step {
                Some(Step::Status(status)) => Ok(WebhookResponse {
                    status,
                    headers: HashMap::new(),
                    body: b"ok".to_vec(),
                }),
                Some(Step::Error(error)) => Err(error),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!("hung request should be cancelled by the timeout")
                }
                None => Ok(WebhookResponse {
                    status: 200,
                    headers: HashMap::new(),
                    body: Vec::new(),
                }),
            }
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        transport: Arc<MockTransport>,
        attempts: Arc<InMemoryAttemptStore>,
        dlq: Arc<DeadLetterQueue>,
        breakers: Arc<CircuitBreakerRegistry>,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
            jitter_max_ms: 5,
        }
    }

    fn harness(steps: Vec<Step>) -> Harness {
        harness_with(steps, CircuitBreakerPolicy::default(), 5_000)
    }

    fn harness_with(
        steps: Vec<Step>,
        breaker_policy: CircuitBreakerPolicy,
        request_timeout_ms: u64,
    ) -> Harness {
        let transport = MockTransport::new(steps);
        let limiter = Arc::new(RateLimiterRegistry::new(&RateLimitConfig {
            global_enabled: false,
            ..RateLimitConfig::default()
        }));
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_policy));
        let attempts = Arc::new(InMemoryAttemptStore::new());
        let history = Arc::new(DeliveryHistory::new(
            Arc::new(InMemoryHistoryStore::new()),
            &webhook_core::config::HistoryConfig::default(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(
            Arc::new(InMemoryDlqStore::new()),
            &webhook_core::config::DlqConfig::default(),
        ));
        let (_tx, rx) = watch::channel(false);
        // Keep the sender alive for the lifetime of the test harness
        std::mem::forget(_tx);
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            limiter,
            Arc::clone(&breakers),
            attempts.clone(),
            history,
            Arc::clone(&dlq),
            DispatcherConfig {
                retry: fast_retry(),
                request_timeout_ms,
                ..DispatcherConfig::default()
            },
            &ServiceConfig::default(),
            rx,
        ));
        Harness {
            dispatcher,
            transport,
            attempts,
            dlq,
            breakers,
        }
    }

    fn subscriber() -> Subscriber {
        let mut sub = Subscriber::new("sub-1", "https://endpoint.example/hook");
        sub.retry = Some(fast_retry());
        sub
    }

    fn event() -> Event {
        Event {
            id: "evt-1".to_string(),
            event_type: "issue.created".to_string(),
            workspace: "ws1".to_string(),
            timestamp: Utc::now(),
            data: serde_json::json!({"id": "ISSUE-1", "title": "Crash"}),
            changes: Default::default(),
            source: EventSource {
                collection: "issue".to_string(),
                operation: OperationKind::Insert,
            },
        }
    }

    fn delivery_for(sub: &Subscriber) -> Delivery {
        Delivery::for_subscriber(sub, event(), sub.retry.clone().unwrap_or_default())
    }

    #[tokio::test]
    async fn retry_then_success() {
        let h = harness(vec![Step::Status(503), Step::Status(503), Step::Status(200)]);
        let sub = subscriber();
        let delivery = delivery_for(&sub);
        let delivery_id = delivery.id.clone();

        let outcome = h.dispatcher.deliver(&sub, delivery).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.status_code, Some(200));

        let attempts = h.attempts.for_delivery(&delivery_id).await;
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(attempts[0].status, DeliveryStatus::Retry);
        assert!(attempts[0].next_retry_at.is_some());
        assert_eq!(attempts[2].status, DeliveryStatus::Success);
        assert!(!attempts[2].final_attempt);
        assert!(h.dlq.is_empty().await);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let h = harness(vec![Step::Status(503), Step::Status(503), Step::Status(503)]);
        let sub = subscriber();
        let delivery = delivery_for(&sub);
        let delivery_id = delivery.id.clone();

        let outcome = h.dispatcher.deliver(&sub, delivery).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);

        let attempts = h.attempts.for_delivery(&delivery_id).await;
        assert_eq!(attempts.last().unwrap().status, DeliveryStatus::Failed);
        assert!(attempts.last().unwrap().final_attempt);
        assert_eq!(h.dlq.len().await, 1);
    }

    #[tokio::test]
    async fn terminal_4xx_fails_in_one_attempt() {
        let h = harness(vec![Step::Status(404)]);
        let sub = subscriber();
        let delivery = delivery_for(&sub);
        let delivery_id = delivery.id.clone();

        let outcome = h.dispatcher.deliver(&sub, delivery).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.status_code, Some(404));
        assert_eq!(h.transport.request_count().await, 1);

        let attempts = h.attempts.for_delivery(&delivery_id).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DeliveryStatus::Failed);
        assert!(attempts[0].final_attempt);
        assert_eq!(h.dlq.len().await, 1);
    }

    #[tokio::test]
    async fn request_headers_and_signature() {
        let h = harness(vec![Step::Status(200)]);
        let mut sub = subscriber();
        sub.secret = Some("s3cret".to_string());
        sub.headers.insert("X-Custom".to_string(), "yes".to_string());
        sub.headers.insert("User-Agent".to_string(), "custom-agent".to_string());
        // Custom headers must not be able to forge the signature
        sub.headers.insert(HEADER_SIGNATURE.to_string(), "sha256=forged".to_string());

        let outcome = h.dispatcher.deliver(&sub, delivery_for(&sub)).await;
        assert!(outcome.success);

        let requests = h.transport.requests.lock().await;
        let request = &requests[0];
        let header = |name: &str| {
            request
                .headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("Content-Type").as_deref(), Some("application/json"));
        assert_eq!(header("User-Agent").as_deref(), Some("custom-agent"));
        assert_eq!(header(HEADER_ID).as_deref(), Some("sub-1"));
        assert_eq!(header(HEADER_EVENT).as_deref(), Some("issue.created"));
        assert_eq!(header("X-Custom").as_deref(), Some("yes"));
        assert!(header(HEADER_DELIVERY).is_some());
        assert!(header(HEADER_TIMESTAMP).is_some());

        let signature = header(HEADER_SIGNATURE).unwrap();
        assert_ne!(signature, "sha256=forged");
        assert_eq!(signature, sign_payload("s3cret", &request.body));

        // Body carries the canonical envelope
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["type"], "issue.created");
        assert_eq!(body["workspace"], "ws1");
        assert_eq!(body["data"]["id"], "ISSUE-1");
    }

    #[tokio::test]
    async fn no_signature_without_secret() {
        let h = harness(vec![Step::Status(200)]);
        let sub = subscriber();
        h.dispatcher.deliver(&sub, delivery_for(&sub)).await;

        let requests = h.transport.requests.lock().await;
        assert!(!requests[0]
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(HEADER_SIGNATURE)));
    }

    #[tokio::test]
    async fn oversized_response_is_terminal() {
        let h = harness(vec![Step::Error(TransportError::ResponseTooLarge { limit: 1024 })]);
        let sub = subscriber();

        let outcome = h.dispatcher.deliver(&sub, delivery_for(&sub)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.dlq.len().await, 1);
    }

    #[tokio::test]
    async fn hung_request_times_out_and_retries() {
        let h = harness_with(
            vec![Step::Hang, Step::Status(200)],
            CircuitBreakerPolicy::default(),
            50,
        );
        let sub = subscriber();
        let delivery = delivery_for(&sub);
        let delivery_id = delivery.id.clone();

        let outcome = h.dispatcher.deliver(&sub, delivery).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);

        let attempts = h.attempts.for_delivery(&delivery_id).await;
        assert_eq!(attempts[0].error.as_deref(), Some("request_timeout"));
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let h = harness(vec![
            Step::Error(TransportError::Connect {
                message: "connection refused".to_string(),
            }),
            Step::Status(200),
        ]);
        let sub = subscriber();
        let outcome = h.dispatcher.deliver(&sub, delivery_for(&sub)).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn open_circuit_skips_the_wire() {
        let policy = CircuitBreakerPolicy {
            failure_threshold: 1,
            volume_threshold: 1,
            reset_timeout_ms: 30,
            ..CircuitBreakerPolicy::default()
        };
        let h = harness_with(vec![Step::Status(500), Step::Status(200)], policy, 5_000);

        // First delivery: a single 500 exhausts its one-attempt budget and
        // opens the circuit with exactly one wire call
        let mut opener = subscriber();
        opener.retry = Some(RetryPolicy {
            max_attempts: 1,
            ..fast_retry()
        });
        let first = h.dispatcher.deliver(&opener, delivery_for(&opener)).await;
        assert!(!first.success);
        assert_eq!(h.breakers.state(&opener.id).await, crate::breaker::BreakerState::Open);
        assert_eq!(h.transport.request_count().await, 1);

        // Second delivery: attempt 1 is rejected by the open circuit without
        // touching the wire, then the reset timeout elapses and the half-open
        // probe succeeds
        let sub = subscriber();
        let delivery = delivery_for(&sub);
        let delivery_id = delivery.id.clone();
        let second = h.dispatcher.deliver(&sub, delivery).await;
        assert!(second.success);
        assert_eq!(second.attempts, 2);

        let attempts = h.attempts.for_delivery(&delivery_id).await;
        assert_eq!(attempts[0].error.as_deref(), Some("circuit_open"));
        assert!(attempts[0].http_status.is_none());
        // Only one extra wire call, for the successful probe
        assert_eq!(h.transport.request_count().await, 2);
        assert_eq!(h.breakers.state(&sub.id).await, crate::breaker::BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn replay_success_clears_dlq_entry() {
        let h = harness(vec![Step::Status(503), Step::Status(503), Step::Status(503), Step::Status(200)]);
        let sub = subscriber();

        h.dispatcher.deliver(&sub, delivery_for(&sub)).await;
        assert_eq!(h.dlq.len().await, 1);

        let entry = &h.dlq.list(&DlqFilter::default()).await[0];
        let replay = h.dlq.retry(&entry.id).await.unwrap();
        let outcome = h.dispatcher.deliver(&sub, replay).await;
        assert!(outcome.success);
        assert!(h.dlq.is_empty().await);
    }

    #[tokio::test]
    async fn replay_failure_restores_entry_without_duplicating() {
        let h = harness(vec![Step::Status(503), Step::Status(503), Step::Status(503), Step::Status(404)]);
        let sub = subscriber();

        h.dispatcher.deliver(&sub, delivery_for(&sub)).await;
        let entry_id = h.dlq.list(&DlqFilter::default()).await[0].id.clone();

        let replay = h.dlq.retry(&entry_id).await.unwrap();
        let outcome = h.dispatcher.deliver(&sub, replay).await;
        assert!(!outcome.success);

        let entries = h.dlq.list(&DlqFilter::default()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
        assert_eq!(entries[0].last_error.as_deref(), Some("http status 404"));
    }

    #[tokio::test]
    async fn submit_tracks_in_flight_and_drains() {
        let h = harness(vec![Step::Status(200)]);
        let sub = Arc::new(subscriber());
        h.dispatcher.submit(Arc::clone(&sub), event());

        assert!(h.dispatcher.drain(Duration::from_secs(2)).await);
        let stats = h.dispatcher.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn backoff_grows_between_attempts() {
        let h = harness(vec![Step::Status(503), Step::Status(503), Step::Status(200)]);
        let mut sub = subscriber();
        sub.retry = Some(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 40,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter_max_ms: 1,
        });
        let started = Instant::now();
        let outcome = h.dispatcher.deliver(&sub, delivery_for(&sub)).await;
        assert!(outcome.success);
        // 40ms + 80ms of backoff at minimum
        assert!(started.elapsed() >= Duration::from_millis(120));
    }
}
