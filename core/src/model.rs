//! Data model for the webhook pipeline
//!
//! These are the types that flow between the observer, the router and the
//! dispatcher, plus the persisted delivery/DLQ records. Deliveries carry a
//! snapshot of the subscriber fields they need rather than a live reference,
//! so the object graph stays acyclic at runtime.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Identifier of a registered subscriber.
pub type SubscriberId = String;

/// A registered webhook endpoint with its filters and delivery policies.
///
/// The registry that owns these lives behind the external CRUD surface; the
/// pipeline only ever sees read-only snapshots taken per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    /// Immutable identifier, assigned at creation
    pub id: SubscriberId,
    /// Human-readable label
    #[serde(default)]
    pub name: Option<String>,
    /// Target URL for deliveries
    pub url: String,
    /// Shared secret for payload signing, if any
    #[serde(default)]
    pub secret: Option<String>,
    /// Subscribed event-type patterns (`issue.*`, `project.created`, `*`)
    pub event_types: Vec<String>,
    /// Restrict to changes from these collections, when non-empty
    #[serde(default)]
    pub collections: Vec<String>,
    /// Custom filter expression evaluated against the event
    #[serde(default)]
    pub filter: Option<String>,
    /// Extra headers sent with every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Disabled subscribers receive nothing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Retry policy override; `None` uses the service defaults
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-subscriber rate limit override
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Per-subscriber circuit breaker override
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
}

fn default_enabled() -> bool {
    true
}

impl Subscriber {
    pub fn new(id: impl Into<SubscriberId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: url.into(),
            secret: None,
            event_types: vec!["*".to_string()],
            collections: Vec::new(),
            filter: None,
            headers: HashMap::new(),
            enabled: true,
            retry: None,
            rate_limit: None,
            circuit_breaker: None,
        }
    }

    /// True when `collection` passes this subscriber's collection filter.
    pub fn accepts_collection(&self, collection: &str) -> bool {
        self.collections.is_empty()
            || self
                .collections
                .iter()
                .any(|c| c.eq_ignore_ascii_case(collection))
    }
}

/// Admission algorithm for a subscriber rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

/// Rate limit policy carried by a subscriber (or used as the global default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub algorithm: RateLimitAlgorithm,
    /// Maximum requests per window (sliding/fixed window)
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Token bucket capacity
    #[serde(default = "default_burst")]
    pub burst_limit: u32,
    /// Token bucket refill rate, tokens per second
    #[serde(default = "default_refill")]
    pub refill_rate: f64,
}

fn default_burst() -> u32 {
    10
}

fn default_refill() -> f64 {
    1.0
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests: 60,
            window_ms: 60_000,
            burst_limit: default_burst(),
            refill_rate: default_refill(),
        }
    }
}

/// Circuit breaker thresholds carried by a subscriber (or service defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successes in half-open required to close
    pub success_threshold: u32,
    /// Minimum calls in the window before the breaker may open
    pub volume_threshold: u32,
    /// Recent error rate (percent) that opens the circuit
    pub error_threshold: f64,
    /// Recent slow-call rate (percent) that opens the circuit
    pub slow_call_rate_threshold: f64,
    /// A call at or above this duration counts as slow
    pub slow_call_threshold_ms: u64,
    /// Sliding window over which recent calls are counted
    pub monitoring_period_ms: u64,
    /// Time the circuit stays open before a half-open probe
    pub reset_timeout_ms: u64,
    /// Per-attempt timeout; timeouts count as failures
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            volume_threshold: 10,
            error_threshold: 50.0,
            slow_call_rate_threshold: 80.0,
            slow_call_threshold_ms: 10_000,
            monitoring_period_ms: 60_000,
            reset_timeout_ms: 30_000,
            timeout_ms: 30_000,
        }
    }
}

/// Kind of mutation observed on the upstream store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// `(database, collection)` pair a change belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

/// Structured description of an update: changed paths and removed paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Updated field path → new value
    #[serde(default)]
    pub updated: HashMap<String, Value>,
    /// Field paths removed by the update
    #[serde(default)]
    pub removed: Vec<String>,
}

impl UpdateDescription {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Opaque position in the upstream change feed.
///
/// Either a raw string token or a document carrying `_data`/`_id`, depending
/// on the upstream store. Validation only checks the shape; the token is
/// never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeToken {
    Text(String),
    Doc(Value),
}

impl ResumeToken {
    /// A token is well-formed if it is a non-empty string, or a non-empty
    /// object bearing a `_data` or `_id` attribute.
    pub fn is_valid(&self) -> bool {
        match self {
            ResumeToken::Text(s) => !s.is_empty(),
            ResumeToken::Doc(Value::Object(map)) => {
                !map.is_empty() && (map.contains_key("_data") || map.contains_key("_id"))
            }
            ResumeToken::Doc(_) => false,
        }
    }
}

/// One observed mutation, as emitted by the change observer.
///
/// Not persisted; consumed by the router and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Feed position of this change
    pub position: ResumeToken,
    pub operation: OperationKind,
    pub namespace: Namespace,
    /// Primary key of the affected document
    pub document_key: Value,
    /// Full document, when the feed provides it
    #[serde(default)]
    pub full_document: Option<Value>,
    /// Present for updates
    #[serde(default)]
    pub update: Option<UpdateDescription>,
    /// Cluster timestamp of the mutation
    pub cluster_time: DateTime<Utc>,
}

impl ChangeRecord {
    /// The document id as a string, however the key is shaped.
    pub fn document_id(&self) -> String {
        match &self.document_key {
            Value::Object(map) => map
                .get("_id")
                .map(value_to_id_string)
                .unwrap_or_else(|| self.document_key.to_string()),
            other => value_to_id_string(other),
        }
    }
}

fn value_to_id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Per-field change attached to an event, derived from the update
/// description. Serialized as `{"to": value}` or `{"removed": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldChange {
    To { to: Value },
    Removed { removed: bool },
}

impl FieldChange {
    pub fn to(value: Value) -> Self {
        FieldChange::To { to: value }
    }

    pub fn removed() -> Self {
        FieldChange::Removed { removed: true }
    }
}

/// The domain-level message derived from one change, sent to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable id, minted once per observed change
    pub id: String,
    /// Dotted event type, e.g. `issue.status_changed`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Workspace / tenant the change belongs to
    pub workspace: String,
    /// ISO-8601 UTC timestamp
    pub timestamp: DateTime<Utc>,
    /// Transformed payload subscribers receive
    pub data: Value,
    /// Field-level changes, when derived from an update
    #[serde(default)]
    pub changes: HashMap<String, FieldChange>,
    /// Where the event came from (collection, operation)
    pub source: EventSource,
}

/// Source metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSource {
    pub collection: String,
    pub operation: OperationKind,
}

impl Event {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Status of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retry,
}

/// One delivery attempt, persisted on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Parent delivery this attempt belongs to
    pub delivery_id: String,
    pub subscriber_id: SubscriberId,
    pub event_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub http_status: Option<u16>,
    /// Response body, truncated to the configured cap
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration of the attempt
    pub duration_ms: u64,
    /// When the next retry is scheduled, for `Retry` attempts
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set on the terminal attempt of a failed delivery
    #[serde(default)]
    pub final_attempt: bool,
    pub at: DateTime<Utc>,
}

/// One delivery: a subscriber snapshot plus the event to send.
///
/// Holds copies of the subscriber fields the dispatcher needs so the record
/// stays meaningful after the subscriber is edited or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub subscriber_id: SubscriberId,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub event: Event,
    pub retry: RetryPolicy,
    /// Set when this delivery is a manual DLQ replay
    #[serde(default)]
    pub replayed_from: Option<String>,
}

impl Delivery {
    pub fn for_subscriber(subscriber: &Subscriber, event: Event, retry: RetryPolicy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subscriber_id: subscriber.id.clone(),
            url: subscriber.url.clone(),
            secret: subscriber.secret.clone(),
            headers: subscriber.headers.clone(),
            event,
            retry,
            replayed_from: None,
        }
    }
}

/// Lifecycle of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqEntryStatus {
    DeadLettered,
    Retrying,
}

/// A delivery whose retry budget was exhausted, frozen for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub delivery: Delivery,
    pub failure_reason: String,
    /// Attempts consumed before dead-lettering
    pub original_attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub status: DlqEntryStatus,
    /// Manual replays issued for this entry
    pub retry_count: u32,
    /// Outcome of the most recent replay, when it failed
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Flattened, retained copy of an attempt plus the event envelope.
///
/// `compressed` is a schema slot: payloads over the threshold keep their JSON
/// verbatim today but flip the flag, so a real compressor can be introduced
/// without a schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryHistoryRecord {
    pub id: String,
    pub delivery_id: String,
    pub subscriber_id: SubscriberId,
    pub event_id: String,
    pub event_type: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
    pub payload: Value,
    pub compressed: bool,
}
