//! Stats surface
//!
//! Point-in-time snapshot of every component, aggregated by the
//! orchestrator. The external stats/health endpoints serialize this as-is.

use serde::Serialize;

use crate::dispatcher::DispatcherStats;
use crate::observer::ObserverStatus;

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub size: usize,
    pub added_total: u64,
    pub purged_total: u64,
    pub replayed_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    /// Per-subscriber rate limiters currently tracked
    pub rate_limiters: usize,
    /// Per-subscriber circuit breakers currently tracked
    pub circuit_breakers: usize,
    /// Breakers in the OPEN state right now
    pub circuits_open: usize,
}

/// Aggregated service snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub observer: ObserverStatus,
    pub dispatcher: DispatcherStats,
    pub dlq: DlqStats,
    pub guards: GuardStats,
    pub events_routed: u64,
    pub events_deduplicated: u64,
    pub history_records: usize,
    pub subscribers: usize,
}
