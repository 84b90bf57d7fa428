//! Delivery history
//!
//! Retained copy of every delivery attempt plus the event envelope, feeding
//! the analytics/stats surface and audit queries. History is best-effort by
//! contract: a store failure is logged and never fails the delivery that
//! produced the record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use webhook_core::config::HistoryConfig;
use webhook_core::{DeliveryAttempt, DeliveryHistoryRecord, DeliveryStatus, Event};

/// Storage for history records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: DeliveryHistoryRecord) -> Result<(), String>;
    async fn all(&self) -> Vec<DeliveryHistoryRecord>;
    /// Remove records older than `cutoff`; returns how many were dropped.
    async fn prune(&self, cutoff: DateTime<Utc>) -> usize;
}

/// In-memory store, newest last.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: Mutex<Vec<DeliveryHistoryRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: DeliveryHistoryRecord) -> Result<(), String> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn all(&self) -> Vec<DeliveryHistoryRecord> {
        self.records.lock().await.clone()
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.at >= cutoff);
        before - records.len()
    }
}

/// Aggregation granularity for trend queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Hour,
    Day,
    Week,
    Month,
}

/// Aggregated stats for one time bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub bucket_start: DateTime<Utc>,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Records attempts and computes analytics over them.
pub struct DeliveryHistory {
    store: Arc<dyn HistoryStore>,
    compress_threshold: usize,
    retention: ChronoDuration,
}

impl DeliveryHistory {
    pub fn new(store: Arc<dyn HistoryStore>, config: &HistoryConfig) -> Self {
        Self {
            store,
            compress_threshold: config.compress_threshold_bytes,
            retention: ChronoDuration::milliseconds(config.retention_ms as i64),
        }
    }

    /// Record one attempt. Never fails the caller.
    pub async fn record(&self, attempt: &DeliveryAttempt, event: &Event) {
        let payload = serde_json::to_value(event).unwrap_or_default();
        let compressed = payload.to_string().len() >= self.compress_threshold;
        let record = DeliveryHistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            delivery_id: attempt.delivery_id.clone(),
            subscriber_id: attempt.subscriber_id.clone(),
            event_id: attempt.event_id.clone(),
            event_type: event.event_type.clone(),
            attempt: attempt.attempt,
            status: attempt.status,
            http_status: attempt.http_status,
            error: attempt.error.clone(),
            duration_ms: attempt.duration_ms,
            at: attempt.at,
            payload,
            compressed,
        };
        if let Err(error) = self.store.append(record).await {
            warn!(
                delivery = %attempt.delivery_id,
                subscriber = %attempt.subscriber_id,
                %error,
                "history persist failed"
            );
        }
    }

    /// Terminal attempts per time bucket since `since`, oldest bucket first.
    pub async fn aggregate(&self, bucket: TimeBucket, since: DateTime<Utc>) -> Vec<BucketStats> {
        let records = self.store.all().await;
        let mut buckets: Vec<(DateTime<Utc>, Vec<&DeliveryHistoryRecord>)> = Vec::new();
        for record in records.iter().filter(|r| r.at >= since) {
            let start = bucket_start(bucket, record.at);
            match buckets.iter_mut().find(|(s, _)| *s == start) {
                Some((_, group)) => group.push(record),
                None => buckets.push((start, vec![record])),
            }
        }
        buckets.sort_by_key(|(start, _)| *start);
        buckets
            .into_iter()
            .map(|(bucket_start, group)| {
                let total = group.len() as u64;
                let successes = group
                    .iter()
                    .filter(|r| r.status == DeliveryStatus::Success)
                    .count() as u64;
                let failures = group
                    .iter()
                    .filter(|r| r.status == DeliveryStatus::Failed)
                    .count() as u64;
                let avg_duration_ms = if group.is_empty() {
                    0.0
                } else {
                    group.iter().map(|r| r.duration_ms as f64).sum::<f64>() / group.len() as f64
                };
                BucketStats {
                    bucket_start,
                    total,
                    successes,
                    failures,
                    success_rate: if total == 0 {
                        0.0
                    } else {
                        successes as f64 * 100.0 / total as f64
                    },
                    avg_duration_ms,
                }
            })
            .collect()
    }

    /// Most recent failed attempts, newest first.
    pub async fn recent_failures(&self, limit: usize) -> Vec<DeliveryHistoryRecord> {
        let mut failures: Vec<DeliveryHistoryRecord> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|r| r.status == DeliveryStatus::Failed)
            .collect();
        failures.sort_by_key(|r| std::cmp::Reverse(r.at));
        failures.truncate(limit);
        failures
    }

    /// Apply the retention policy; returns how many records were dropped.
    pub async fn sweep(&self) -> usize {
        self.store.prune(Utc::now() - self.retention).await
    }

    pub async fn total(&self) -> usize {
        self.store.all().await.len()
    }
}

fn bucket_start(bucket: TimeBucket, at: DateTime<Utc>) -> DateTime<Utc> {
    let day = Utc
        .with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
        .single()
        .unwrap_or(at);
    match bucket {
        TimeBucket::Hour => day + ChronoDuration::hours(at.hour() as i64),
        TimeBucket::Day => day,
        TimeBucket::Week => day - ChronoDuration::days(at.weekday().num_days_from_monday() as i64),
        TimeBucket::Month => Utc
            .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(day),
    }
}
