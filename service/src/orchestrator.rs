//! Orchestrator
//!
//! Owns the lifecycle of the pipeline: builds every component from the
//! configuration, wires them together, runs the observer loop plus the
//! background timers (cursor flush, DLQ/history/limiter sweeps), and drives
//! the graceful shutdown sequence: close the feed, drain in-flight
//! deliveries within the grace period, force-flush the cursor, stop timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use webhook_core::{Config, ConfigError};

use crate::breaker::CircuitBreakerRegistry;
use crate::cursor::{CursorBackend, CursorStore, FileCursorBackend};
use crate::dispatcher::{
    AttemptStore, Dispatcher, InMemoryAttemptStore, ReqwestTransport, WebhookTransport,
};
use crate::dlq::{DeadLetterQueue, DlqStore, InMemoryDlqStore};
use crate::feed::ChangeFeed;
use crate::history::{DeliveryHistory, HistoryStore, InMemoryHistoryStore};
use crate::ledger::{EventLedger, InMemoryLedger};
use crate::limiter::RateLimiterRegistry;
use crate::observer::{ChangeObserver, ObserverExit};
use crate::registry::SubscriberRegistry;
use crate::router::EventRouter;
use crate::stats::{DlqStats, GuardStats, ServiceStats};

/// Interval for the idle-limiter reclaim sweep.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Why the service stopped; maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Requested shutdown completed cleanly
    Clean,
    /// The change feed could not be re-established
    FeedLost,
    /// The cursor store failed at startup
    CursorStoreFailed,
}

impl ShutdownReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Clean => 0,
            ShutdownReason::FeedLost => 3,
            ShutdownReason::CursorStoreFailed => 4,
        }
    }
}

/// External seams the embedding process provides.
pub struct Seams {
    pub feed: Arc<dyn ChangeFeed>,
    pub registry: Arc<dyn SubscriberRegistry>,
    /// Defaults to [`ReqwestTransport`]
    pub transport: Option<Arc<dyn WebhookTransport>>,
    /// Defaults to the file backend at `config.cursor.file_path`
    pub cursor_backend: Option<Arc<dyn CursorBackend>>,
    /// Default in-memory
    pub attempt_store: Option<Arc<dyn AttemptStore>>,
    /// Default in-memory
    pub history_store: Option<Arc<dyn HistoryStore>>,
    /// Default in-memory
    pub dlq_store: Option<Arc<dyn DlqStore>>,
    /// Default in-memory
    pub ledger: Option<Arc<dyn EventLedger>>,
}

impl Seams {
    pub fn new(feed: Arc<dyn ChangeFeed>, registry: Arc<dyn SubscriberRegistry>) -> Self {
        Self {
            feed,
            registry,
            transport: None,
            cursor_backend: None,
            attempt_store: None,
            history_store: None,
            dlq_store: None,
            ledger: None,
        }
    }
}

pub struct Orchestrator {
    config: Config,
    registry: Arc<dyn SubscriberRegistry>,
    cursor: Arc<CursorStore>,
    limiter: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    history: Arc<DeliveryHistory>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<EventRouter>,
    observer: Arc<ChangeObserver>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Validate the configuration and wire every component.
    pub fn new(config: Config, seams: Seams) -> Result<Self, ConfigError> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cursor_backend = seams.cursor_backend.unwrap_or_else(|| {
            Arc::new(FileCursorBackend::new(config.cursor.file_path.clone()))
        });
        let cursor = Arc::new(CursorStore::new(
            cursor_backend,
            config.service.name.clone(),
            &config.cursor,
        ));

        let limiter = Arc::new(RateLimiterRegistry::new(&config.rate_limit));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(
            seams
                .dlq_store
                .unwrap_or_else(|| Arc::new(InMemoryDlqStore::new())),
            &config.dlq,
        ));
        let history = Arc::new(DeliveryHistory::new(
            seams
                .history_store
                .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new())),
            &config.history,
        ));
        let transport = seams
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new(&config.dispatcher)));
        let attempts = seams
            .attempt_store
            .unwrap_or_else(|| Arc::new(InMemoryAttemptStore::new()));

        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            attempts,
            Arc::clone(&history),
            Arc::clone(&dlq),
            config.dispatcher.clone(),
            &config.service,
            shutdown_rx.clone(),
        ));

        let router = Arc::new(EventRouter::new(
            Arc::clone(&seams.registry),
            Arc::clone(&dispatcher),
            seams
                .ledger
                .unwrap_or_else(|| Arc::new(InMemoryLedger::new())),
        ));

        let observer = Arc::new(ChangeObserver::new(
            seams.feed,
            Arc::clone(&router),
            Arc::clone(&cursor),
            config.feed.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            config,
            registry: seams.registry,
            cursor,
            limiter,
            breakers,
            dlq,
            history,
            dispatcher,
            router,
            observer,
            shutdown_tx,
        })
    }

    /// Run until shutdown is requested or the feed is lost. Returns the
    /// reason, mapped to the process exit code by the caller.
    pub async fn run(&self) -> ShutdownReason {
        info!(service = %self.config.service.name, "webhook service starting");
        let timers = self.spawn_timers();

        let exit = self.observer.run().await;
        let reason = match exit {
            ObserverExit::Shutdown => ShutdownReason::Clean,
            ObserverExit::FeedLost => ShutdownReason::FeedLost,
            ObserverExit::CursorFailed(_) => ShutdownReason::CursorStoreFailed,
        };

        self.shutdown_sequence(timers).await;
        info!(?reason, "webhook service stopped");
        reason
    }

    /// Ask the service to stop; `run` completes the sequence.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Drain and tear down, in contract order.
    async fn shutdown_sequence(&self, timers: Vec<JoinHandle<()>>) {
        // (1) the feed is already closed: the observer returned
        let _ = self.shutdown_tx.send(true);

        // (2) drain in-flight dispatches within the grace period
        let grace = Duration::from_millis(self.config.service.shutdown_grace_ms);
        if !self.dispatcher.drain(grace).await {
            warn!(
                in_flight = self.dispatcher.stats().in_flight,
                "shutdown grace period elapsed with deliveries still in flight"
            );
        }

        // (3) force-flush the cursor; the DLQ store is written through on
        // every mutation and needs no extra flush
        if let Err(error) = self.cursor.flush().await {
            warn!(%error, "final cursor flush failed");
        }

        // (4) stop timers
        for timer in timers {
            timer.abort();
        }
    }

    /// Background timers: periodic cursor flush plus the retention sweeps.
    fn spawn_timers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut shutdown = self.shutdown_tx.subscribe();

        let cursor = Arc::clone(&self.cursor);
        let period = Duration::from_millis(self.config.cursor.periodic_save_ms);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(error) = cursor.flush().await {
                            warn!(%error, "periodic cursor flush failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let dlq = Arc::clone(&self.dlq);
        let dlq_period = Duration::from_millis(self.config.dlq.sweep_interval_ms);
        let mut shutdown_dlq = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(dlq_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => { dlq.sweep().await; }
                    _ = shutdown_dlq.changed() => break,
                }
            }
        }));

        let history = Arc::clone(&self.history);
        let history_period = Duration::from_millis(self.config.history.sweep_interval_ms);
        let mut shutdown_history = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(history_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => { history.sweep().await; }
                    _ = shutdown_history.changed() => break,
                }
            }
        }));

        let limiter = Arc::clone(&self.limiter);
        let mut shutdown_limiter = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => { limiter.sweep().await; }
                    _ = shutdown_limiter.changed() => break,
                }
            }
        }));

        handles
    }

    /// Readiness: the observer is tailing and the cursor store answers.
    pub async fn ready(&self) -> bool {
        self.observer.status().await.running && self.cursor.load().await.is_ok()
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            observer: self.observer.status().await,
            dispatcher: self.dispatcher.stats(),
            dlq: DlqStats {
                size: self.dlq.len().await,
                added_total: self.dlq.added_total(),
                purged_total: self.dlq.purged_total(),
                replayed_total: self.dlq.replayed_total(),
            },
            guards: GuardStats {
                rate_limiters: self.limiter.tracked().await,
                circuit_breakers: self.breakers.tracked().await,
                circuits_open: self.breakers.open_count().await,
            },
            events_routed: self.router.routed_total(),
            events_deduplicated: self.router.duplicate_total(),
            history_records: self.history.total().await,
            subscribers: self.registry.snapshot().await.len(),
        }
    }

    /// The dead-letter surface, for the external replay endpoints.
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Direct dispatch access, for manual delivery replay.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn observer(&self) -> &Arc<ChangeObserver> {
        &self.observer
    }

    pub fn history(&self) -> &Arc<DeliveryHistory> {
        &self.history
    }
}
