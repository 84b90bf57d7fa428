//! Dead-letter queue
//!
//! Deliveries that exhausted their retry budget (or failed terminally) are
//! frozen here for inspection and manual replay. The queue is bounded: when
//! `max_size` would be exceeded the oldest entries are trimmed and counted
//! as purged. An hourly sweep expires entries past the retention period.
//!
//! Replay: `retry` re-wraps the frozen delivery and hands it back to the
//! dispatch path; the final outcome comes back through `update_status`,
//! which either removes the entry (success) or restores it to
//! `dead_lettered` with the last error stamped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use webhook_core::config::DlqConfig;
use webhook_core::{Delivery, DlqEntry, DlqEntryStatus};

use crate::error::DlqError;

/// Notifications emitted by the queue.
#[derive(Debug, Clone)]
pub enum DlqNotification {
    EntryAdded {
        entry_id: String,
        subscriber_id: String,
        event_type: String,
    },
}

/// Persistence for DLQ entries. Failures are logged by the queue, never
/// propagated: the delivery outcome is already decided when an entry lands
/// here.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn put(&self, entry: DlqEntry) -> Result<(), String>;
    async fn update(&self, entry: DlqEntry) -> Result<(), String>;
    async fn remove(&self, id: &str) -> Result<Option<DlqEntry>, String>;
    async fn get(&self, id: &str) -> Option<DlqEntry>;
    async fn all(&self) -> Vec<DlqEntry>;
}

/// In-memory store; canonical for tests and single-node embeddings.
#[derive(Default)]
pub struct InMemoryDlqStore {
    entries: Mutex<HashMap<String, DlqEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn put(&self, entry: DlqEntry) -> Result<(), String> {
        self.entries.lock().await.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn update(&self, entry: DlqEntry) -> Result<(), String> {
        self.entries.lock().await.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Option<DlqEntry>, String> {
        Ok(self.entries.lock().await.remove(id))
    }

    async fn get(&self, id: &str) -> Option<DlqEntry> {
        self.entries.lock().await.get(id).cloned()
    }

    async fn all(&self) -> Vec<DlqEntry> {
        self.entries.lock().await.values().cloned().collect()
    }
}

/// Query filter for `list` and `retry_all`.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub subscriber_id: Option<String>,
    pub event_type: Option<String>,
    pub status: Option<DlqEntryStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DlqFilter {
    fn accepts(&self, entry: &DlqEntry) -> bool {
        if let Some(subscriber_id) = &self.subscriber_id {
            if entry.delivery.subscriber_id != *subscriber_id {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if entry.delivery.event.event_type != *event_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.dead_lettered_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.dead_lettered_at > to {
                return false;
            }
        }
        true
    }
}

/// The queue itself.
pub struct DeadLetterQueue {
    store: Arc<dyn DlqStore>,
    max_size: usize,
    retention: ChronoDuration,
    notifications: broadcast::Sender<DlqNotification>,
    added: AtomicU64,
    purged: AtomicU64,
    replayed: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DlqStore>, config: &DlqConfig) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            store,
            max_size: config.max_size,
            retention: ChronoDuration::milliseconds(config.retention_ms as i64),
            notifications,
            added: AtomicU64::new(0),
            purged: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DlqNotification> {
        self.notifications.subscribe()
    }

    /// Freeze an exhausted delivery. Returns the created entry.
    pub async fn add(
        &self,
        delivery: Delivery,
        failure_reason: impl Into<String>,
        original_attempts: u32,
    ) -> DlqEntry {
        let entry = DlqEntry {
            id: Uuid::new_v4().to_string(),
            failure_reason: failure_reason.into(),
            original_attempts,
            dead_lettered_at: Utc::now(),
            status: DlqEntryStatus::DeadLettered,
            retry_count: 0,
            last_error: None,
            delivery,
        };
        info!(
            entry = %entry.id,
            subscriber = %entry.delivery.subscriber_id,
            event = %entry.delivery.event.id,
            reason = %entry.failure_reason,
            "delivery dead-lettered"
        );
        if let Err(error) = self.store.put(entry.clone()).await {
            warn!(entry = %entry.id, %error, "dlq persist failed");
        }
        self.added.fetch_add(1, Ordering::Relaxed);
        let _ = self.notifications.send(DlqNotification::EntryAdded {
            entry_id: entry.id.clone(),
            subscriber_id: entry.delivery.subscriber_id.clone(),
            event_type: entry.delivery.event.event_type.clone(),
        });
        self.trim().await;
        entry
    }

    /// Drop the oldest entries until the queue fits `max_size`.
    async fn trim(&self) {
        let mut entries = self.store.all().await;
        if entries.len() <= self.max_size {
            return;
        }
        entries.sort_by_key(|e| e.dead_lettered_at);
        let excess = entries.len() - self.max_size;
        for entry in entries.into_iter().take(excess) {
            if let Err(error) = self.store.remove(&entry.id).await {
                warn!(entry = %entry.id, %error, "dlq trim failed");
            } else {
                self.purged.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Re-wrap an entry's delivery for a manual replay.
    pub async fn retry(&self, entry_id: &str) -> Result<Delivery, DlqError> {
        let mut entry = self.store.get(entry_id).await.ok_or_else(|| DlqError::NotFound {
            id: entry_id.to_string(),
        })?;
        if entry.status == DlqEntryStatus::Retrying {
            return Err(DlqError::AlreadyRetrying {
                id: entry_id.to_string(),
            });
        }
        entry.status = DlqEntryStatus::Retrying;
        entry.retry_count += 1;
        if let Err(error) = self.store.update(entry.clone()).await {
            warn!(entry = %entry.id, %error, "dlq persist failed");
        }
        self.replayed.fetch_add(1, Ordering::Relaxed);

        let mut delivery = entry.delivery.clone();
        delivery.id = Uuid::new_v4().to_string();
        delivery.replayed_from = Some(entry.id.clone());
        Ok(delivery)
    }

    /// Report the final outcome of a replay.
    pub async fn update_status(&self, entry_id: &str, success: bool, error: Option<String>) {
        if success {
            match self.store.remove(entry_id).await {
                Ok(Some(_)) => info!(entry = entry_id, "dead-letter replay succeeded, entry removed"),
                Ok(None) => {}
                Err(store_error) => warn!(entry = entry_id, error = %store_error, "dlq persist failed"),
            }
            return;
        }
        if let Some(mut entry) = self.store.get(entry_id).await {
            entry.status = DlqEntryStatus::DeadLettered;
            entry.last_error = error;
            if let Err(store_error) = self.store.update(entry).await {
                warn!(entry = entry_id, error = %store_error, "dlq persist failed");
            }
        }
    }

    /// Entries matching `filter`, newest first.
    pub async fn list(&self, filter: &DlqFilter) -> Vec<DlqEntry> {
        let mut entries: Vec<DlqEntry> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|e| filter.accepts(e))
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.dead_lettered_at));
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        entries.into_iter().skip(offset).take(limit).collect()
    }

    /// Replay every entry matching `filter`; returns the re-wrapped
    /// deliveries for the dispatch path.
    pub async fn retry_all(&self, filter: &DlqFilter) -> Vec<Delivery> {
        let entries = self.list(filter).await;
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.retry(&entry.id).await {
                Ok(delivery) => deliveries.push(delivery),
                Err(error) => warn!(entry = %entry.id, %error, "dlq replay skipped"),
            }
        }
        deliveries
    }

    /// Remove everything; returns how many entries were dropped.
    pub async fn clear(&self) -> usize {
        let entries = self.store.all().await;
        let mut removed = 0;
        for entry in entries {
            if matches!(self.store.remove(&entry.id).await, Ok(Some(_))) {
                removed += 1;
                self.purged.fetch_add(1, Ordering::Relaxed);
            }
        }
        removed
    }

    /// Expire entries older than the retention period.
    pub async fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let entries = self.store.all().await;
        let mut expired = 0;
        for entry in entries {
            if entry.dead_lettered_at < cutoff {
                if matches!(self.store.remove(&entry.id).await, Ok(Some(_))) {
                    expired += 1;
                    self.purged.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if expired > 0 {
            info!(expired, "dead-letter retention sweep");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.store.all().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn added_total(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn purged_total(&self) -> u64 {
        self.purged.load(Ordering::Relaxed)
    }

    pub fn replayed_total(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }
}
