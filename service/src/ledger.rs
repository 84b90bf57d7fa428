//! Events ledger
//!
//! Record of every event the router produced, deduplicated on
//! `(source_id, event_hash)`. After a crash between dispatch handoff and a
//! cursor flush, the observer replays the tail of the feed; the ledger
//! absorbs the duplicate fan-out so subscribers see each event once per
//! pipeline pass rather than once per replay.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use webhook_core::{event_hash, Event};

/// Unique key of a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    /// Identity of the source document (namespace + document id)
    pub source_id: String,
    /// Content hash of the canonical event JSON
    pub event_hash: String,
}

impl LedgerKey {
    pub fn for_event(source_id: impl Into<String>, event: &Event) -> Self {
        // Hash the parts that identify the event's content; the minted id and
        // timestamp differ per replay and must not defeat deduplication.
        let fingerprint = json!({
            "type": event.event_type,
            "workspace": event.workspace,
            "data": event.data,
            "changes": serde_json::to_value(&event.changes).unwrap_or_default(),
        });
        Self {
            source_id: source_id.into(),
            event_hash: event_hash(&fingerprint),
        }
    }
}

/// Dedup index over produced events.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Insert the key; returns false when it was already present (duplicate).
    async fn insert(&self, key: LedgerKey) -> bool;

    async fn len(&self) -> usize;
}

/// In-memory ledger; a database-backed implementation keeps the same unique
/// index semantics.
#[derive(Default)]
pub struct InMemoryLedger {
    seen: Mutex<HashSet<LedgerKey>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLedger for InMemoryLedger {
    async fn insert(&self, key: LedgerKey) -> bool {
        self.seen.lock().await.insert(key)
    }

    async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use webhook_core::model::{EventSource, OperationKind};

    fn event(event_id: &str, title: &str) -> Event {
        Event {
            id: event_id.to_string(),
            event_type: "issue.created".to_string(),
            workspace: "ws1".to_string(),
            timestamp: Utc::now(),
            data: json!({"id": "ISSUE-1", "title": title}),
            changes: Default::default(),
            source: EventSource {
                collection: "issue".to_string(),
                operation: OperationKind::Insert,
            },
        }
    }

    #[tokio::test]
    async fn duplicate_content_is_rejected() {
        let ledger = InMemoryLedger::new();
        // Same change replayed: different minted event id, same content
        let first = LedgerKey::for_event("ws1/issue/ISSUE-1", &event("evt-a", "Crash"));
        let replay = LedgerKey::for_event("ws1/issue/ISSUE-1", &event("evt-b", "Crash"));

        assert!(ledger.insert(first).await);
        assert!(!ledger.insert(replay).await);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_content_is_kept() {
        let ledger = InMemoryLedger::new();
        let a = LedgerKey::for_event("ws1/issue/ISSUE-1", &event("evt-a", "Crash"));
        let b = LedgerKey::for_event("ws1/issue/ISSUE-1", &event("evt-b", "Crash, edited"));
        assert!(ledger.insert(a).await);
        assert!(ledger.insert(b).await);
        assert_eq!(ledger.len().await, 2);
    }
}
