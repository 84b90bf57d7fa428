//! Event router
//!
//! Turns each observed change into exactly one domain event and fans it out
//! to the subscribers that want it. Detection and payload transformation are
//! pure functions of the change record; matching combines the enabled flag,
//! the event-type patterns, the collection filter and the subscriber's
//! custom filter expression (evaluated fail-closed by the filter engine).
//!
//! Fan-out submission completes before `route` returns, which is what lets
//! the observer acknowledge the change afterwards (the at-least-once
//! boundary).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use webhook_core::model::EventSource;
use webhook_core::{matches_pattern, ChangeRecord, Event, FieldChange, FilterEngine, OperationKind, Subscriber};

use crate::dispatcher::Dispatcher;
use crate::ledger::{EventLedger, LedgerKey};
use crate::registry::SubscriberRegistry;

/// Domain fields surfaced onto the event payload, with the document keys
/// they are read from.
const SURFACED_FIELDS: [(&str, &[&str]); 8] = [
    ("title", &["title", "name"]),
    ("description", &["description"]),
    ("status", &["status"]),
    ("priority", &["priority"]),
    ("assignee", &["assignee"]),
    ("project", &["project", "space"]),
    ("created_at", &["createdOn", "createdAt", "created_at"]),
    ("modified_at", &["modifiedOn", "modifiedAt", "modified_at"]),
];

/// Event type for a change: a pure function of collection, operation and
/// the updated fields.
pub fn detect_event_type(record: &ChangeRecord) -> &'static str {
    let collection = record.namespace.collection.to_ascii_lowercase();
    match collection.as_str() {
        "issue" => match record.operation {
            OperationKind::Insert => "issue.created",
            OperationKind::Delete => "issue.deleted",
            OperationKind::Update => {
                if updated_field(record, "status") {
                    "issue.status_changed"
                } else if updated_field(record, "assignee") {
                    "issue.assigned"
                } else {
                    "issue.updated"
                }
            }
        },
        "space" | "project" => match record.operation {
            OperationKind::Insert => "project.created",
            OperationKind::Update => "project.updated",
            OperationKind::Delete => "project.archived",
        },
        "comment" => "comment.created",
        "attachment" => "attachment.added",
        _ => "issue.updated",
    }
}

/// True when the update touched `field` (exact path or last segment).
fn updated_field(record: &ChangeRecord, field: &str) -> bool {
    record.update.as_ref().is_some_and(|update| {
        update
            .updated
            .keys()
            .any(|path| path == field || path.ends_with(&format!(".{field}")))
    })
}

/// Transform a change into the payload subscribers receive.
pub fn transform_payload(record: &ChangeRecord) -> Value {
    let id = record.document_id();
    if record.operation == OperationKind::Delete {
        return json!({ "id": id, "deleted": true });
    }

    let mut data = Map::new();
    data.insert("id".to_string(), Value::String(id));
    if let Some(Value::Object(document)) = &record.full_document {
        for (target, sources) in SURFACED_FIELDS {
            for source in sources {
                if let Some(value) = document.get(*source) {
                    data.insert(target.to_string(), value.clone());
                    break;
                }
            }
        }
    } else if let Some(update) = &record.update {
        // No full document on this update: surface what the mutation tells us
        for (target, sources) in SURFACED_FIELDS {
            for source in sources {
                if let Some(value) = update.updated.get(*source) {
                    data.insert(target.to_string(), value.clone());
                    break;
                }
            }
        }
    }
    Value::Object(data)
}

/// Field-level changes derived from the update description.
pub fn derive_changes(record: &ChangeRecord) -> HashMap<String, FieldChange> {
    let mut changes = HashMap::new();
    if let Some(update) = &record.update {
        for (path, value) in &update.updated {
            changes.insert(path.clone(), FieldChange::to(value.clone()));
        }
        for path in &update.removed {
            changes.insert(path.clone(), FieldChange::removed());
        }
    }
    changes
}

/// Summary of one routed change.
#[derive(Debug, Clone)]
pub struct RouteSummary {
    pub event_id: String,
    pub event_type: String,
    /// Subscribers the event was submitted to
    pub matched: usize,
    /// True when the ledger had already seen this event content
    pub duplicate: bool,
}

/// The router: classification + matching + fan-out.
pub struct EventRouter {
    registry: Arc<dyn SubscriberRegistry>,
    filters: FilterEngine,
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<dyn EventLedger>,
    routed: AtomicU64,
    duplicates: AtomicU64,
}

impl EventRouter {
    pub fn new(
        registry: Arc<dyn SubscriberRegistry>,
        dispatcher: Arc<Dispatcher>,
        ledger: Arc<dyn EventLedger>,
    ) -> Self {
        Self {
            registry,
            filters: FilterEngine::new(),
            dispatcher,
            ledger,
            routed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Route one change: build the event, deduplicate against the ledger,
    /// select subscribers and submit the deliveries. Submission for every
    /// match has happened by the time this returns.
    pub async fn route(&self, record: &ChangeRecord) -> RouteSummary {
        let event = self.build_event(record);
        let source_id = format!(
            "{}/{}/{}",
            record.namespace.database,
            record.namespace.collection,
            record.document_id()
        );

        let key = LedgerKey::for_event(source_id, &event);
        if !self.ledger.insert(key).await {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, event_type = %event.event_type, "duplicate change, skipping fan-out");
            return RouteSummary {
                event_id: event.id,
                event_type: event.event_type,
                matched: 0,
                duplicate: true,
            };
        }

        let event_json = serde_json::to_value(&event).unwrap_or_default();
        let mut matched = 0;
        for subscriber in self.registry.snapshot().await {
            if self.matches(&subscriber, &event, &event_json) {
                self.dispatcher.submit(Arc::clone(&subscriber), event.clone());
                matched += 1;
            }
        }
        self.routed.fetch_add(1, Ordering::Relaxed);
        trace!(
            event = %event.id,
            event_type = %event.event_type,
            matched,
            "change routed"
        );
        RouteSummary {
            event_id: event.id,
            event_type: event.event_type,
            matched,
            duplicate: false,
        }
    }

    fn build_event(&self, record: &ChangeRecord) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            event_type: detect_event_type(record).to_string(),
            workspace: record.namespace.database.clone(),
            timestamp: record.cluster_time,
            data: transform_payload(record),
            changes: derive_changes(record),
            source: EventSource {
                collection: record.namespace.collection.clone(),
                operation: record.operation,
            },
        }
    }

    /// Matching: enabled + type pattern + collection filter + expression.
    fn matches(&self, subscriber: &Subscriber, event: &Event, event_json: &Value) -> bool {
        if !subscriber.enabled {
            return false;
        }
        if !subscriber
            .event_types
            .iter()
            .any(|pattern| matches_pattern(pattern, &event.event_type))
        {
            return false;
        }
        if !subscriber.accepts_collection(&event.source.collection) {
            return false;
        }
        match &subscriber.filter {
            Some(expression) => self.filters.matches(expression, event_json),
            None => true,
        }
    }

    pub fn routed_total(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn duplicate_total(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}
