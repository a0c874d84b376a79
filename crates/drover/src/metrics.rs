//! Snapshot structs for monitoring each subsystem.

use serde::{Deserialize, Serialize};

/// Dispatch queue counters and rolling latency, as of one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Dispatches ever admitted
    pub enqueued: u64,
    /// Resolved with a result
    pub succeeded: u64,
    /// Terminal failures (exhausted, validation, routing)
    pub failed: u64,
    /// Retry attempts scheduled after transient failures
    pub retried: u64,
    /// Deadline expirations
    pub timed_out: u64,
    /// Caller cancellations and clears
    pub cancelled: u64,
    /// Currently executing attempts
    pub in_flight: usize,
    /// Waiting in the queue (ready or backing off)
    pub queued: usize,
    /// Rolling mean completion latency over the configured window
    pub avg_latency_ms: f64,
}

/// Worker pool occupancy and lifetime counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub shared: usize,
    pub total_spawned: u64,
    pub total_reaped: u64,
    pub total_replaced: u64,
    pub tasks_completed: u64,
}

/// Collector pool occupancy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorPoolStats {
    pub active: usize,
    pub retained: usize,
    pub completed_total: u64,
    pub timed_out_total: u64,
    pub cancelled_total: u64,
}
