//! # Webhook Service
//!
//! The delivery pipeline: a change observer tails the upstream store's
//! mutation feed, the router turns each change into an event and selects the
//! subscribers that want it, and the dispatcher signs and POSTs the payload
//! with retries. Per-subscriber rate limiters and circuit breakers guard the
//! endpoints; exhausted deliveries land in the dead-letter queue; the resume
//! cursor store makes the whole thing at-least-once across restarts.
//!
//! ```text
//! observer → router → limiter → breaker → dispatcher → history
//!                                             └─ retries → DLQ
//! ```
//!
//! The external collaborators (subscriber CRUD, health endpoints, config
//! loading, the feed itself) plug in through the traits in [`registry`],
//! [`feed`] and the store traits of each component.

pub mod breaker;
pub mod cursor;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod feed;
pub mod history;
pub mod ledger;
pub mod limiter;
pub mod observer;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod stats;

pub use orchestrator::{Orchestrator, ShutdownReason};
