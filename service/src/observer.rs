//! Change observer
//!
//! Maintains the live tail over the upstream change feed. Startup loads the
//! saved resume cursor and opens the feed after it (or at the current tail
//! on a fresh start). Each record is handed to the router synchronously;
//! only after that handoff completes is the cursor save buffered and the
//! processed counter bumped. A crash in between re-delivers the record
//! rather than skipping it.
//!
//! Feed errors reconnect with exponential backoff. Ten consecutive failed
//! reconnects is terminal: the observer stops and reports the loss so the
//! orchestrator can exit non-zero.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use webhook_core::config::FeedConfig;

use crate::cursor::CursorStore;
use crate::error::CursorError;
use crate::feed::ChangeFeed;
use crate::router::EventRouter;

/// Why the observer loop returned.
#[derive(Debug)]
pub enum ObserverExit {
    /// Orchestrator asked for shutdown
    Shutdown,
    /// Reconnect budget exhausted; the feed is considered lost
    FeedLost,
    /// The cursor store failed at startup
    CursorFailed(CursorError),
}

/// Point-in-time status, feeds the readiness/stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ObserverStatus {
    pub running: bool,
    pub events_processed: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

pub struct ChangeObserver {
    feed: Arc<dyn ChangeFeed>,
    router: Arc<EventRouter>,
    cursor: Arc<CursorStore>,
    config: FeedConfig,
    shutdown: watch::Receiver<bool>,
    running: AtomicBool,
    processed: AtomicU64,
    reconnect_attempts: AtomicU32,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

impl ChangeObserver {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        router: Arc<EventRouter>,
        cursor: Arc<CursorStore>,
        config: FeedConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            feed,
            router,
            cursor,
            config,
            shutdown,
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_event_at: Mutex::new(None),
        }
    }

    /// Run the tail loop until shutdown or feed loss. Idempotent: a second
    /// concurrent call returns immediately.
    pub async fn run(&self) -> ObserverExit {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("observer already running, ignoring start");
            return ObserverExit::Shutdown;
        }

        let exit = self.tail().await;
        self.running.store(false, Ordering::SeqCst);
        exit
    }

    async fn tail(&self) -> ObserverExit {
        let mut resume = match self.cursor.load().await {
            Ok(token) => {
                match &token {
                    Some(_) => info!("resuming change feed after saved cursor"),
                    None => info!("no saved cursor, tailing from the current position"),
                }
                token
            }
            Err(error) => {
                error!(%error, "cursor store unavailable at startup");
                return ObserverExit::CursorFailed(error);
            }
        };
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                return ObserverExit::Shutdown;
            }

            let mut stream = match self.feed.open(resume.clone()).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%error, "failed to open change feed");
                    match self.backoff(&mut shutdown).await {
                        BackoffOutcome::Retry => continue,
                        BackoffOutcome::Shutdown => return ObserverExit::Shutdown,
                        BackoffOutcome::GiveUp => return ObserverExit::FeedLost,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = shutdown.changed() => {
                        stream.close().await;
                        return ObserverExit::Shutdown;
                    }
                    next = stream.next() => next,
                };

                match next {
                    Ok(Some(record)) => {
                        // A successful record proves the connection is healthy
                        self.reconnect_attempts.store(0, Ordering::SeqCst);

                        let position = record.position.clone();
                        // Handoff first: every matching delivery is submitted
                        // before this change is acknowledged
                        self.router.route(&record).await;
                        self.cursor.save(position.clone(), false).await;
                        // Processed counts only changes whose cursor save was
                        // issued, keeping the two consistent across a crash
                        self.processed.fetch_add(1, Ordering::SeqCst);
                        *self.last_event_at.lock().await = Some(Utc::now());
                        resume = Some(position);
                    }
                    Ok(None) => {
                        warn!("change feed ended, reconnecting");
                        stream.close().await;
                        break;
                    }
                    Err(error) => {
                        warn!(%error, "change feed error, reconnecting");
                        stream.close().await;
                        break;
                    }
                }
            }

            match self.backoff(&mut shutdown).await {
                BackoffOutcome::Retry => {}
                BackoffOutcome::Shutdown => return ObserverExit::Shutdown,
                BackoffOutcome::GiveUp => return ObserverExit::FeedLost,
            }
        }
    }

    /// Exponential reconnect delay; gives up past the attempt cap.
    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) -> BackoffOutcome {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_reconnect_attempts {
            error!(
                attempts = attempt - 1,
                "reconnect budget exhausted, change feed lost"
            );
            return BackoffOutcome::GiveUp;
        }
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay_ms = self
            .config
            .reconnect_base_delay_ms
            .saturating_mul(exp)
            .min(self.config.reconnect_max_delay_ms);
        info!(attempt, delay_ms, "reconnecting to change feed");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => BackoffOutcome::Retry,
            _ = shutdown.changed() => BackoffOutcome::Shutdown,
        }
    }

    pub async fn status(&self) -> ObserverStatus {
        ObserverStatus {
            running: self.running.load(Ordering::SeqCst),
            events_processed: self.processed.load(Ordering::SeqCst),
            last_event_at: *self.last_event_at.lock().await,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
        }
    }
}

enum BackoffOutcome {
    Retry,
    Shutdown,
    GiveUp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorBackend;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use webhook_core::config::{
        CursorConfig, DispatcherConfig, DlqConfig, HistoryConfig, RateLimitConfig, ServiceConfig,
    };
    use webhook_core::model::{CircuitBreakerPolicy, Namespace, OperationKind, ResumeToken};
    use webhook_core::ChangeRecord;

    use crate::breaker::CircuitBreakerRegistry;
    use crate::cursor::MemoryCursorBackend;
    use crate::dispatcher::{
        Dispatcher, InMemoryAttemptStore, WebhookRequest, WebhookResponse, WebhookTransport,
    };
    use crate::dlq::{DeadLetterQueue, InMemoryDlqStore};
    use crate::error::TransportError;
    use crate::feed::testing::ScriptedFeed;
    use crate::history::{DeliveryHistory, InMemoryHistoryStore};
    use crate::ledger::InMemoryLedger;
    use crate::limiter::RateLimiterRegistry;
    use crate::registry::InMemoryRegistry;
    use crate::router::EventRouter;

    struct OkTransport;

    #[async_trait]
    impl WebhookTransport for OkTransport {
        async fn send(&self, _request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
            Ok(WebhookResponse {
                status: 200,
                headers: HashMap::new(),
                body: Vec::new(),
            })
        }
    }

    struct Fixture {
        observer: ChangeObserver,
        backend: Arc<MemoryCursorBackend>,
        cursor: Arc<CursorStore>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn record(n: u32) -> ChangeRecord {
        ChangeRecord {
            position: ResumeToken::Doc(json!({"_data": format!("pos-{n}")})),
            operation: OperationKind::Insert,
            namespace: Namespace::new("ws1", "issue"),
            document_key: json!({"_id": format!("ISSUE-{n}")}),
            full_document: Some(json!({"title": format!("Issue {n}")})),
            update: None,
            cluster_time: Utc::now(),
        }
    }

    fn fixture(feed: Arc<ScriptedFeed>, feed_config: FeedConfig) -> Fixture {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backend = Arc::new(MemoryCursorBackend::new());
        let cursor = Arc::new(CursorStore::new(
            backend.clone(),
            "svc",
            &CursorConfig {
                save_interval_ms: 0,
                ..CursorConfig::default()
            },
        ));
        let limiter = Arc::new(RateLimiterRegistry::new(&RateLimitConfig {
            global_enabled: false,
            ..RateLimitConfig::default()
        }));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerPolicy::default()));
        let history = Arc::new(DeliveryHistory::new(
            Arc::new(InMemoryHistoryStore::new()),
            &HistoryConfig::default(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(
            Arc::new(InMemoryDlqStore::new()),
            &DlqConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(OkTransport),
            limiter,
            breakers,
            Arc::new(InMemoryAttemptStore::new()),
            history,
            dlq,
            DispatcherConfig::default(),
            &ServiceConfig::default(),
            shutdown_rx.clone(),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::new(InMemoryRegistry::new()),
            dispatcher,
            Arc::new(InMemoryLedger::new()),
        ));
        let observer = ChangeObserver::new(
            feed,
            router,
            Arc::clone(&cursor),
            feed_config,
            shutdown_rx,
        );
        Fixture {
            observer,
            backend,
            cursor,
            shutdown_tx,
        }
    }

    fn fast_feed_config(max_attempts: u32) -> FeedConfig {
        FeedConfig {
            reconnect_base_delay_ms: 5,
            reconnect_max_delay_ms: 20,
            max_reconnect_attempts: max_attempts,
        }
    }

    #[tokio::test]
    async fn processes_records_and_advances_cursor() {
        // One batch of two records, then an empty batch that ends the run
        // via reconnect exhaustion
        let feed = ScriptedFeed::new(vec![vec![Ok(record(1)), Ok(record(2))]]);
        let f = fixture(Arc::clone(&feed), fast_feed_config(1));

        let exit = f.observer.run().await;
        assert!(matches!(exit, ObserverExit::FeedLost));

        let status = f.observer.status().await;
        assert_eq!(status.events_processed, 2);
        assert!(status.last_event_at.is_some());
        assert!(!status.running);

        // Cursor advanced to the last record, with the prior one in history
        let snapshot = f.backend.load().await.unwrap().unwrap();
        assert_eq!(snapshot.token, record(2).position);
        assert_eq!(snapshot.history, vec![record(1).position]);
    }

    #[tokio::test]
    async fn resumes_after_saved_cursor() {
        let feed = ScriptedFeed::new(vec![vec![]]);
        let f = fixture(Arc::clone(&feed), fast_feed_config(1));
        f.cursor.save(record(7).position, true).await;

        f.observer.run().await;
        assert_eq!(
            *feed.last_resume.lock().unwrap(),
            Some(record(7).position)
        );
    }

    #[tokio::test]
    async fn reconnects_after_feed_error_and_keeps_order() {
        let feed = ScriptedFeed::new(vec![
            vec![Ok(record(1)), Err("reset by peer".to_string())],
            vec![Ok(record(2))],
        ]);
        let f = fixture(Arc::clone(&feed), fast_feed_config(2));

        let exit = f.observer.run().await;
        assert!(matches!(exit, ObserverExit::FeedLost));
        assert_eq!(f.observer.status().await.events_processed, 2);
        assert!(feed.opens.load(std::sync::atomic::Ordering::SeqCst) >= 2);

        // The reopen resumed after the last processed record
        let snapshot = f.backend.load().await.unwrap().unwrap();
        assert_eq!(snapshot.token, record(2).position);
    }

    #[tokio::test]
    async fn gives_up_after_reconnect_budget() {
        let feed = ScriptedFeed::new(vec![
            vec![Err("down".to_string())],
            vec![Err("down".to_string())],
            vec![Err("down".to_string())],
            vec![Err("down".to_string())],
        ]);
        let f = fixture(feed, fast_feed_config(3));

        let exit = f.observer.run().await;
        assert!(matches!(exit, ObserverExit::FeedLost));
        assert_eq!(f.observer.status().await.events_processed, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_tail() {
        // A batch that never ends: error after a long scripted tail would
        // keep the loop alive; instead use reconnect loops with slow backoff
        let feed = ScriptedFeed::new(vec![vec![Err("down".to_string())]]);
        let f = fixture(
            feed,
            FeedConfig {
                reconnect_base_delay_ms: 10_000,
                reconnect_max_delay_ms: 10_000,
                max_reconnect_attempts: 10,
            },
        );

        let shutdown_tx = f.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = shutdown_tx.send(true);
        });

        let exit = f.observer.run().await;
        assert!(matches!(exit, ObserverExit::Shutdown));
    }
}
