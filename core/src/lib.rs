//! # Webhook Core
//!
//! Shared building blocks for the webhook dispatcher: the data model that
//! flows through the pipeline (changes, events, deliveries), subscriber
//! policies (retry, rate limit, circuit breaker), the filter expression
//! engine, event-type patterns, and payload signing.
//!
//! Everything here is runtime-agnostic: no I/O, no tasks, no clocks beyond
//! wall-time stamping. The `webhook-service` crate owns the async pipeline.

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod pattern;
pub mod retry;
pub mod signature;

pub use config::Config;
pub use error::ConfigError;
pub use filter::{FilterEngine, FilterError};
pub use model::{
    ChangeRecord, CircuitBreakerPolicy, Delivery, DeliveryAttempt, DeliveryHistoryRecord,
    DeliveryStatus, DlqEntry, DlqEntryStatus, Event, EventSource, FieldChange, Namespace,
    OperationKind, RateLimitAlgorithm, RateLimitPolicy, ResumeToken, Subscriber, SubscriberId,
    UpdateDescription,
};
pub use pattern::matches_pattern;
pub use retry::RetryPolicy;
pub use signature::{event_hash, sign_payload};
