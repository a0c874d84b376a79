//! Typed supervisor event channel.
//!
//! Liveness and lifecycle transitions are published on a broadcast channel
//! so any number of consumers can observe them without coupling to the pool
//! or the monitor.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::worker::WorkerId;

/// Lifecycle and liveness transitions observable by subscribers.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A worker process was launched and is connecting
    WorkerSpawned { worker_id: WorkerId },
    /// The worker reached idle and can accept dispatches
    WorkerReady { worker_id: WorkerId },
    /// Heartbeat round-trip exceeded the degraded threshold
    WorkerDegraded { worker_id: WorkerId, rtt_ms: f64 },
    /// Missed heartbeats, below the failure threshold
    WorkerUnresponsive { worker_id: WorkerId, misses: u32 },
    /// Back to healthy from degraded or unresponsive
    WorkerRecovered { worker_id: WorkerId },
    /// Classified failed by the monitor
    WorkerFailed { worker_id: WorkerId, misses: u32 },
    /// Failed worker replaced by a fresh one
    WorkerRestarted {
        worker_id: WorkerId,
        replacement: WorkerId,
    },
    /// Reaped after sitting idle past the threshold
    WorkerReaped { worker_id: WorkerId, idle_for: Duration },
    /// Terminated for any other reason (crash, stuck task, shutdown)
    WorkerTerminated { worker_id: WorkerId, reason: String },
    /// The pool is going away; everything in flight is rejected
    PoolShutdown,
}

/// Broadcast wrapper. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: SupervisorEvent) {
        trace!(?event, "supervisor event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
