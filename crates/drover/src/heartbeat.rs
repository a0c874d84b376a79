//! Worker liveness monitoring.
//!
//! The monitor periodically probes every registered worker with a
//! monotonically increasing heartbeat id and classifies the worker from the
//! outcome: healthy, degraded (slow), unresponsive (missing replies), or
//! failed (missed too many). Probes share the worker channel with task
//! traffic but use their own message type, so neither blocks the other.
//!
//! Classification transitions are published on the supervisor event channel.
//! A worker that reaches failed is restarted through the pool when
//! auto-restart is on; its replacement starts with a fresh health record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::events::{EventBus, SupervisorEvent};
use crate::worker::WorkerId;

/// Health classification for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Replying promptly
    Healthy,
    /// Alive but slow; no restart triggered
    Degraded,
    /// Missed heartbeats, below the failure threshold
    Unresponsive,
    /// Missed too many; restart candidate
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unresponsive => "unresponsive",
            HealthStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a probe produced no accepted reply.
#[derive(Debug, Clone)]
pub enum ProbeError {
    /// No matching reply within the timeout
    Timeout,
    /// The worker channel failed outright
    Channel(String),
    /// The pool no longer knows this worker
    UnknownWorker,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Timeout => write!(f, "heartbeat timed out"),
            ProbeError::Channel(e) => write!(f, "heartbeat channel error: {}", e),
            ProbeError::UnknownWorker => write!(f, "unknown worker"),
        }
    }
}

/// The monitor's view of the pool: send one probe, request one restart.
#[async_trait]
pub trait WorkerProber: Send + Sync {
    /// Probe `worker_id` with `heartbeat_id`; resolves with the round-trip
    /// time iff the matching reply arrived within `timeout`.
    async fn probe(
        &self,
        worker_id: &WorkerId,
        heartbeat_id: u64,
        timeout: Duration,
    ) -> Result<Duration, ProbeError>;

    /// Terminate the worker and spawn a replacement, returning its id.
    async fn restart(&self, worker_id: &WorkerId) -> anyhow::Result<WorkerId>;
}

/// Snapshot of one worker's health record.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub status: HealthStatus,
    pub last_heartbeat_at: Option<Instant>,
    pub consecutive_misses: u32,
    pub total_heartbeats: u64,
    pub successful_heartbeats: u64,
    /// Mean round-trip over the bounded sample window
    pub avg_response_ms: f64,
    pub last_heartbeat_id: u64,
}

struct HealthRecord {
    status: HealthStatus,
    last_heartbeat_at: Option<Instant>,
    consecutive_misses: u32,
    total_heartbeats: u64,
    successful_heartbeats: u64,
    window: VecDeque<f64>,
    last_heartbeat_id: u64,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_heartbeat_at: None,
            consecutive_misses: 0,
            total_heartbeats: 0,
            successful_heartbeats: 0,
            window: VecDeque::new(),
            last_heartbeat_id: 0,
        }
    }

    fn push_rtt(&mut self, rtt_ms: f64, cap: usize) {
        self.window.push_back(rtt_ms);
        while self.window.len() > cap {
            self.window.pop_front();
        }
    }

    fn avg_rtt_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    fn snapshot(&self, worker_id: &WorkerId) -> WorkerHealth {
        WorkerHealth {
            worker_id: worker_id.clone(),
            status: self.status,
            last_heartbeat_at: self.last_heartbeat_at,
            consecutive_misses: self.consecutive_misses,
            total_heartbeats: self.total_heartbeats,
            successful_heartbeats: self.successful_heartbeats,
            avg_response_ms: self.avg_rtt_ms(),
            last_heartbeat_id: self.last_heartbeat_id,
        }
    }
}

/// Periodic liveness prober over the registered worker set.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    prober: Arc<dyn WorkerProber>,
    events: EventBus,
    records: RwLock<HashMap<WorkerId, Arc<Mutex<HealthRecord>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, prober: Arc<dyn WorkerProber>, events: EventBus) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            config,
            prober,
            events,
            records: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Start the periodic probe loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.probe_round().await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("heartbeat monitor stopped");
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Begin tracking a worker. Idempotent; an existing record is kept.
    pub async fn register(&self, worker_id: WorkerId) {
        let mut records = self.records.write().await;
        records
            .entry(worker_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HealthRecord::new())));
        debug!(worker.id = %worker_id, "worker registered for heartbeats");
    }

    /// Stop tracking a worker and drop its record.
    pub async fn unregister(&self, worker_id: &WorkerId) {
        if self.records.write().await.remove(worker_id).is_some() {
            debug!(worker.id = %worker_id, "worker unregistered from heartbeats");
        }
    }

    pub async fn health(&self, worker_id: &WorkerId) -> Option<WorkerHealth> {
        let record = self.records.read().await.get(worker_id)?.clone();
        let rec = record.lock().await;
        Some(rec.snapshot(worker_id))
    }

    pub async fn status(&self, worker_id: &WorkerId) -> Option<HealthStatus> {
        self.health(worker_id).await.map(|h| h.status)
    }

    pub async fn all_health(&self) -> Vec<WorkerHealth> {
        let records: Vec<(WorkerId, Arc<Mutex<HealthRecord>>)> = self
            .records
            .read()
            .await
            .iter()
            .map(|(id, rec)| (id.clone(), rec.clone()))
            .collect();
        let mut out = Vec::with_capacity(records.len());
        for (id, record) in records {
            out.push(record.lock().await.snapshot(&id));
        }
        out
    }

    /// Probe one worker immediately and report the latest recorded status
    /// once the round completes, or once twice the reply timeout has
    /// elapsed, whichever comes first.
    pub async fn force_check(self: &Arc<Self>, worker_id: &WorkerId) -> Option<HealthStatus> {
        let _ = tokio::time::timeout(self.config.timeout * 2, self.probe_one(worker_id.clone())).await;
        self.status(worker_id).await
    }

    async fn probe_round(self: &Arc<Self>) {
        let ids: Vec<WorkerId> = self.records.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        let mut probes = JoinSet::new();
        for id in ids {
            let monitor = self.clone();
            probes.spawn(async move {
                monitor.probe_one(id).await;
            });
        }
        while probes.join_next().await.is_some() {}
    }

    async fn probe_one(self: &Arc<Self>, worker_id: WorkerId) {
        let Some(record) = self.records.read().await.get(&worker_id).cloned() else {
            return;
        };

        // strictly monotonic per worker; replies must echo this id
        let heartbeat_id = {
            let mut rec = record.lock().await;
            rec.last_heartbeat_id += 1;
            rec.last_heartbeat_id
        };

        match self
            .prober
            .probe(&worker_id, heartbeat_id, self.config.timeout)
            .await
        {
            Ok(rtt) => {
                self.record_success(&worker_id, &record, heartbeat_id, rtt)
                    .await
            }
            Err(ProbeError::UnknownWorker) => {
                debug!(worker.id = %worker_id, "probed worker unknown to pool; unregistering");
                self.unregister(&worker_id).await;
            }
            Err(e) => self.record_miss(&worker_id, &record, heartbeat_id, e).await,
        }
    }

    async fn record_success(
        self: &Arc<Self>,
        worker_id: &WorkerId,
        record: &Arc<Mutex<HealthRecord>>,
        heartbeat_id: u64,
        rtt: Duration,
    ) {
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        let (old, new) = {
            let mut rec = record.lock().await;
            if rec.last_heartbeat_id != heartbeat_id {
                // a newer probe superseded this one; its reply is stale
                debug!(worker.id = %worker_id, heartbeat_id, "dropping superseded heartbeat result");
                return;
            }
            rec.total_heartbeats += 1;
            rec.successful_heartbeats += 1;
            rec.consecutive_misses = 0;
            rec.last_heartbeat_at = Some(Instant::now());
            rec.push_rtt(rtt_ms, self.config.rtt_window);

            let old = rec.status;
            rec.status = if rtt <= self.config.degraded_threshold {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            };
            (old, rec.status)
        };

        if old != new {
            match (old, new) {
                (HealthStatus::Degraded | HealthStatus::Unresponsive, HealthStatus::Healthy) => {
                    info!(worker.id = %worker_id, "worker recovered");
                    self.events.emit(SupervisorEvent::WorkerRecovered {
                        worker_id: worker_id.clone(),
                    });
                }
                (_, HealthStatus::Degraded) => {
                    warn!(worker.id = %worker_id, rtt_ms, "worker degraded");
                    self.events.emit(SupervisorEvent::WorkerDegraded {
                        worker_id: worker_id.clone(),
                        rtt_ms,
                    });
                }
                _ => {}
            }
        }
    }

    async fn record_miss(
        self: &Arc<Self>,
        worker_id: &WorkerId,
        record: &Arc<Mutex<HealthRecord>>,
        heartbeat_id: u64,
        error: ProbeError,
    ) {
        let (old, new, misses) = {
            let mut rec = record.lock().await;
            if rec.last_heartbeat_id != heartbeat_id {
                return;
            }
            rec.total_heartbeats += 1;
            rec.consecutive_misses += 1;

            let old = rec.status;
            rec.status = if rec.consecutive_misses >= self.config.max_missed {
                HealthStatus::Failed
            } else {
                HealthStatus::Unresponsive
            };
            (old, rec.status, rec.consecutive_misses)
        };

        debug!(worker.id = %worker_id, misses, error = %error, "heartbeat miss");
        if old == new {
            return;
        }
        match new {
            HealthStatus::Unresponsive => {
                warn!(worker.id = %worker_id, misses, "worker unresponsive");
                self.events.emit(SupervisorEvent::WorkerUnresponsive {
                    worker_id: worker_id.clone(),
                    misses,
                });
            }
            HealthStatus::Failed => {
                warn!(worker.id = %worker_id, misses, "worker failed heartbeat threshold");
                self.events.emit(SupervisorEvent::WorkerFailed {
                    worker_id: worker_id.clone(),
                    misses,
                });
                if self.config.auto_restart {
                    self.spawn_restart(worker_id.clone());
                }
            }
            _ => {}
        }
    }

    /// Restart without blocking the probe round. The replacement gets a
    /// fresh record; the failed worker's record is dropped.
    fn spawn_restart(self: &Arc<Self>, worker_id: WorkerId) {
        let monitor = self.clone();
        tokio::spawn(async move {
            match monitor.prober.restart(&worker_id).await {
                Ok(replacement) => {
                    monitor.unregister(&worker_id).await;
                    monitor.register(replacement.clone()).await;
                    info!(old = %worker_id, new = %replacement, "worker restarted by monitor");
                }
                Err(e) => {
                    warn!(worker.id = %worker_id, error = %e, "worker restart failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Scripted prober: per-worker behavior, switchable mid-test.
    #[derive(Clone, Copy, Debug)]
    enum Behavior {
        Reply(Duration),
        Miss,
    }

    struct MockProber {
        behavior: StdMutex<HashMap<WorkerId, Behavior>>,
        probes_seen: StdMutex<Vec<(WorkerId, u64)>>,
        restarts: StdMutex<Vec<WorkerId>>,
    }

    impl MockProber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                behavior: StdMutex::new(HashMap::new()),
                probes_seen: StdMutex::new(Vec::new()),
                restarts: StdMutex::new(Vec::new()),
            })
        }

        fn set(&self, id: &WorkerId, b: Behavior) {
            self.behavior.lock().unwrap().insert(id.clone(), b);
        }
    }

    #[async_trait]
    impl WorkerProber for Arc<MockProber> {
        async fn probe(
            &self,
            worker_id: &WorkerId,
            heartbeat_id: u64,
            _timeout: Duration,
        ) -> Result<Duration, ProbeError> {
            self.probes_seen
                .lock()
                .unwrap()
                .push((worker_id.clone(), heartbeat_id));
            let behavior = self
                .behavior
                .lock()
                .unwrap()
                .get(worker_id)
                .copied()
                .ok_or(ProbeError::UnknownWorker)?;
            match behavior {
                Behavior::Reply(rtt) => Ok(rtt),
                Behavior::Miss => Err(ProbeError::Timeout),
            }
        }

        async fn restart(&self, worker_id: &WorkerId) -> anyhow::Result<WorkerId> {
            self.restarts.lock().unwrap().push(worker_id.clone());
            let replacement = WorkerId::new();
            self.set(&replacement, Behavior::Reply(Duration::from_millis(1)));
            Ok(replacement)
        }
    }

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(50),
            max_missed: 3,
            degraded_threshold: Duration::from_millis(10),
            auto_restart: true,
            rtt_window: 10,
        }
    }

    #[tokio::test]
    async fn healthy_worker_stays_healthy_with_monotonic_ids() {
        let prober = MockProber::new();
        let id = WorkerId::new();
        prober.set(&id, Behavior::Reply(Duration::from_millis(1)));

        let monitor = HeartbeatMonitor::new(fast_config(), Arc::new(prober.clone()), EventBus::default());
        monitor.register(id.clone()).await;

        for _ in 0..4 {
            monitor.probe_one(id.clone()).await;
        }

        let health = monitor.health(&id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.total_heartbeats, 4);
        assert_eq!(health.successful_heartbeats, 4);
        assert_eq!(health.consecutive_misses, 0);
        assert!(health.avg_response_ms > 0.0);

        let seen = prober.probes_seen.lock().unwrap();
        let ids: Vec<u64> = seen.iter().map(|(_, hb)| *hb).collect();
        assert_eq!(ids, vec![1, 2, 3, 4], "heartbeat ids must be strictly monotonic");
    }

    #[tokio::test]
    async fn slow_replies_classify_degraded_then_recover() {
        let prober = MockProber::new();
        let id = WorkerId::new();
        prober.set(&id, Behavior::Reply(Duration::from_millis(50)));

        let monitor = HeartbeatMonitor::new(fast_config(), Arc::new(prober.clone()), EventBus::default());
        let mut events = monitor.events.subscribe();
        monitor.register(id.clone()).await;

        monitor.probe_one(id.clone()).await;
        assert_eq!(monitor.status(&id).await, Some(HealthStatus::Degraded));
        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisorEvent::WorkerDegraded { .. }
        ));

        prober.set(&id, Behavior::Reply(Duration::from_millis(1)));
        monitor.probe_one(id.clone()).await;
        assert_eq!(monitor.status(&id).await, Some(HealthStatus::Healthy));
        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisorEvent::WorkerRecovered { .. }
        ));
    }

    #[tokio::test]
    async fn misses_escalate_to_failed_and_restart() {
        let prober = MockProber::new();
        let id = WorkerId::new();
        prober.set(&id, Behavior::Miss);

        let monitor = HeartbeatMonitor::new(fast_config(), Arc::new(prober.clone()), EventBus::default());
        let mut events = monitor.events.subscribe();
        monitor.register(id.clone()).await;

        monitor.probe_one(id.clone()).await;
        assert_eq!(monitor.status(&id).await, Some(HealthStatus::Unresponsive));

        monitor.probe_one(id.clone()).await;
        monitor.probe_one(id.clone()).await;
        assert_eq!(monitor.status(&id).await, Some(HealthStatus::Failed));

        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisorEvent::WorkerUnresponsive { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisorEvent::WorkerFailed { misses: 3, .. }
        ));

        // restart task runs asynchronously
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.restarts.lock().unwrap().len(), 1);

        // the failed record is gone and its replacement starts fresh
        assert!(monitor.health(&id).await.is_none());
        let all = monitor.all_health().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, HealthStatus::Healthy);
        assert_eq!(all[0].total_heartbeats, 0);
    }

    #[tokio::test]
    async fn recovery_before_threshold_resets_misses() {
        let prober = MockProber::new();
        let id = WorkerId::new();
        prober.set(&id, Behavior::Miss);

        let monitor = HeartbeatMonitor::new(fast_config(), Arc::new(prober.clone()), EventBus::default());
        monitor.register(id.clone()).await;

        monitor.probe_one(id.clone()).await;
        monitor.probe_one(id.clone()).await;
        assert_eq!(monitor.status(&id).await, Some(HealthStatus::Unresponsive));

        prober.set(&id, Behavior::Reply(Duration::from_millis(1)));
        monitor.probe_one(id.clone()).await;

        let health = monitor.health(&id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_misses, 0);
        assert!(health.successful_heartbeats <= health.total_heartbeats);
    }

    #[tokio::test]
    async fn force_check_reports_post_probe_status() {
        let prober = MockProber::new();
        let id = WorkerId::new();
        prober.set(&id, Behavior::Reply(Duration::from_millis(1)));

        let monitor = HeartbeatMonitor::new(fast_config(), Arc::new(prober.clone()), EventBus::default());
        monitor.register(id.clone()).await;

        let status = monitor.force_check(&id).await;
        assert_eq!(status, Some(HealthStatus::Healthy));
        let health = monitor.health(&id).await.unwrap();
        assert_eq!(health.total_heartbeats, 1, "force check must actually probe");
    }
}
