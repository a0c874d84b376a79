//! Worker pool: lifecycle management and task-to-worker assignment.
//!
//! The pool keeps between `min_workers` and `max_workers` dedicated workers
//! alive, assigns each ready dispatch to an idle worker (spawning on demand),
//! reaps workers that sit idle too long, and replaces workers that crash or
//! get stuck. An optional shared lane holds long-lived workers that accept
//! interleaved dispatches for GPU / shared-memory work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use droverproto::{Cancel, Cleanup, Envelope, Message, Priority, TargetType};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::dispatch::{DispatchId, TaskOutput, WorkerTask};
use crate::error::DispatchError;
use crate::events::{EventBus, SupervisorEvent};
use crate::heartbeat::{ProbeError, WorkerProber};
use crate::metrics::PoolStats;
use crate::worker::{
    AttemptUpdate, WorkerConnection, WorkerFailure, WorkerId, WorkerLauncher,
};

/// Worker lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Spawning = 0,
    Idle = 1,
    Busy = 2,
    Draining = 3,
    Dead = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Spawning,
            1 => WorkerState::Idle,
            2 => WorkerState::Busy,
            3 => WorkerState::Draining,
            _ => WorkerState::Dead,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Draining => "draining",
            WorkerState::Dead => "dead",
        }
    }
}

/// Immutable snapshot of one worker, for the monitor and observability.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub state: WorkerState,
    pub shared: bool,
    pub tasks_completed: u64,
    pub created_at: DateTime<Utc>,
    pub idle_for: Option<Duration>,
    pub current_dispatch: Option<DispatchId>,
}

struct WorkerEntry {
    id: WorkerId,
    shared: bool,
    state: AtomicU8,
    conn: WorkerConnection,
    tasks_completed: AtomicU64,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    last_used: StdMutex<Option<Instant>>,
    current_dispatch: StdMutex<Option<DispatchId>>,
    /// Wire request id of the current dispatch, for cancel forwarding
    current_request: StdMutex<Option<String>>,
}

impl WorkerEntry {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Idle → Busy, claiming the worker for one dispatch.
    fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                WorkerState::Idle as u8,
                WorkerState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Idle → Draining, claiming the worker for reaping.
    fn try_claim_for_reap(&self) -> bool {
        self.state
            .compare_exchange(
                WorkerState::Idle as u8,
                WorkerState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Busy → Idle after a task finishes on a live worker.
    fn release(&self) {
        *self.current_dispatch.lock().unwrap() = None;
        *self.current_request.lock().unwrap() = None;
        *self.last_used.lock().unwrap() = Some(Instant::now());
        self.set_state(WorkerState::Idle);
    }

    fn idle_for(&self) -> Duration {
        match *self.last_used.lock().unwrap() {
            Some(used) => used.elapsed(),
            None => self.created_at.elapsed(),
        }
    }

    fn info(&self) -> WorkerInfo {
        let state = self.state();
        WorkerInfo {
            worker_id: self.id.clone(),
            state,
            shared: self.shared,
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            created_at: self.created_at_utc,
            idle_for: matches!(state, WorkerState::Idle).then(|| self.idle_for()),
            current_dispatch: self.current_dispatch.lock().unwrap().clone(),
        }
    }
}

struct PoolCounters {
    total_spawned: AtomicU64,
    total_reaped: AtomicU64,
    total_replaced: AtomicU64,
    tasks_completed: AtomicU64,
}

/// The pool. Owns every worker record exclusively; other subsystems read
/// immutable snapshots.
pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    workers: RwLock<HashMap<WorkerId, Arc<WorkerEntry>>>,
    shared: RwLock<Vec<Arc<WorkerEntry>>>,
    shared_cursor: AtomicUsize,
    events: EventBus,
    counters: PoolCounters,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Build the pool, spawn the minimum fleet plus the shared lane, and
    /// start the idle reaper.
    pub async fn start(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        events: EventBus,
    ) -> anyhow::Result<Arc<Self>> {
        let (shutdown_tx, _) = broadcast::channel(4);
        let pool = Arc::new(Self {
            config,
            launcher,
            workers: RwLock::new(HashMap::new()),
            shared: RwLock::new(Vec::new()),
            shared_cursor: AtomicUsize::new(0),
            events,
            counters: PoolCounters {
                total_spawned: AtomicU64::new(0),
                total_reaped: AtomicU64::new(0),
                total_replaced: AtomicU64::new(0),
                tasks_completed: AtomicU64::new(0),
            },
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        });

        for _ in 0..pool.config.min_workers {
            pool.spawn_dedicated(false).await?;
        }
        for _ in 0..pool.config.shared_workers {
            pool.spawn_shared().await?;
        }

        pool.clone().start_reaper();
        info!(
            min = pool.config.min_workers,
            max = pool.config.max_workers,
            shared = pool.config.shared_workers,
            "worker pool started"
        );
        Ok(pool)
    }

    async fn launch_entry(
        self: &Arc<Self>,
        shared: bool,
        reserved: bool,
    ) -> anyhow::Result<Arc<WorkerEntry>> {
        let id = WorkerId::new();
        self.events.emit(SupervisorEvent::WorkerSpawned {
            worker_id: id.clone(),
        });

        let channels = self.launcher.launch(&id).await?;
        let entry = Arc::new(WorkerEntry {
            id: id.clone(),
            shared,
            state: AtomicU8::new(WorkerState::Spawning as u8),
            conn: WorkerConnection::new(id.clone(), channels),
            tasks_completed: AtomicU64::new(0),
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            last_used: StdMutex::new(None),
            current_dispatch: StdMutex::new(None),
            current_request: StdMutex::new(None),
        });

        self.counters.total_spawned.fetch_add(1, Ordering::Relaxed);
        self.watch_for_death(entry.clone());
        entry.set_state(if reserved {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        });
        Ok(entry)
    }

    /// Announce a worker only after it is in a registry, so probes can
    /// always resolve it.
    fn announce_ready(&self, entry: &Arc<WorkerEntry>) {
        self.events.emit(SupervisorEvent::WorkerReady {
            worker_id: entry.id.clone(),
        });
        debug!(worker.id = %entry.id, shared = entry.shared, "worker ready");
    }

    /// Spawn a dedicated worker, respecting `max_workers`. Returns `None`
    /// when the pool is full.
    async fn try_spawn_dedicated(
        self: &Arc<Self>,
        reserved: bool,
    ) -> anyhow::Result<Option<Arc<WorkerEntry>>> {
        let mut workers = self.workers.write().await;
        if workers.len() >= self.config.max_workers {
            return Ok(None);
        }
        let entry = self.launch_entry(false, reserved).await?;
        workers.insert(entry.id.clone(), entry.clone());
        drop(workers);
        self.announce_ready(&entry);
        Ok(Some(entry))
    }

    async fn spawn_dedicated(self: &Arc<Self>, reserved: bool) -> anyhow::Result<Arc<WorkerEntry>> {
        match self.try_spawn_dedicated(reserved).await? {
            Some(entry) => Ok(entry),
            None => anyhow::bail!("worker pool is at max_workers"),
        }
    }

    async fn spawn_shared(self: &Arc<Self>) -> anyhow::Result<Arc<WorkerEntry>> {
        let entry = self.launch_entry(true, false).await?;
        self.shared.write().await.push(entry.clone());
        self.announce_ready(&entry);
        Ok(entry)
    }

    /// Per-worker crash watcher. A channel that dies outside a deliberate
    /// termination fails the current dispatch and triggers replacement
    /// policy.
    fn watch_for_death(self: &Arc<Self>, entry: Arc<WorkerEntry>) {
        let weak: Weak<WorkerPool> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = entry.conn.wait_closed() => {
                    if let Some(pool) = weak.upgrade() {
                        pool.handle_worker_closed(entry).await;
                    }
                }
                _ = shutdown.recv() => {}
            }
        });
    }

    async fn handle_worker_closed(self: &Arc<Self>, entry: Arc<WorkerEntry>) {
        if entry.state() == WorkerState::Dead {
            // deliberate termination; already handled
            return;
        }
        warn!(worker.id = %entry.id, "worker channel died");
        self.remove_entry(&entry, "channel closed").await;

        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if entry.shared {
            // keep the shared lane at its configured size
            if let Err(e) = self.spawn_shared().await {
                warn!(error = %e, "failed to respawn shared worker");
            }
            return;
        }
        let below_min = self.workers.read().await.len() < self.config.min_workers;
        if below_min {
            self.counters.total_replaced.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.try_spawn_dedicated(false).await {
                warn!(error = %e, "failed to replace dead worker");
            }
        }
        // otherwise a fresh worker is lazily created on next demand
    }

    /// Mark dead, drop from the registries, and tear down the channel. Any
    /// pending request on the connection fails as a channel error.
    async fn remove_entry(&self, entry: &Arc<WorkerEntry>, reason: &str) {
        entry.set_state(WorkerState::Dead);
        self.workers.write().await.remove(&entry.id);
        self.shared.write().await.retain(|e| e.id != entry.id);
        entry.conn.terminate();
        self.events.emit(SupervisorEvent::WorkerTerminated {
            worker_id: entry.id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Find an idle dedicated worker and claim it, spawning when the pool
    /// has headroom. Waits up to `acquire_timeout`, polling availability.
    async fn acquire(self: &Arc<Self>) -> Result<Arc<WorkerEntry>, DispatchError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(DispatchError::shutdown("worker pool shutting down"));
            }
            {
                let workers = self.workers.read().await;
                for entry in workers.values() {
                    if entry.try_reserve() {
                        return Ok(entry.clone());
                    }
                }
            }
            match self.try_spawn_dedicated(true).await {
                Ok(Some(entry)) => return Ok(entry),
                Ok(None) => {}
                Err(e) => {
                    return Err(DispatchError::Transient(format!(
                        "worker spawn failed: {}",
                        e
                    )))
                }
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::Transient(format!(
                    "no worker available within {:?}",
                    self.config.acquire_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Run one attempt of a dispatch on a dedicated worker.
    ///
    /// Enforces the per-task timeout independently of the dispatch deadline;
    /// a worker that blows it is declared stuck, terminated, and replaced.
    pub async fn execute(self: &Arc<Self>, task: WorkerTask) -> Result<TaskOutput, DispatchError> {
        self.execute_with_updates(task, None).await
    }

    /// As [`execute`](Self::execute), forwarding progress and partial
    /// results to `updates`.
    pub async fn execute_with_updates(
        self: &Arc<Self>,
        task: WorkerTask,
        updates: Option<mpsc::UnboundedSender<AttemptUpdate>>,
    ) -> Result<TaskOutput, DispatchError> {
        if matches!(
            task.target_type,
            TargetType::SharedWorker | TargetType::GpuCompute
        ) {
            return self.execute_shared(task, updates).await;
        }

        let entry = self.acquire().await?;

        let envelope = Envelope::new(
            task.message.clone(),
            task.target_type,
            task.priority,
            task.timeout.as_millis().max(1) as u64,
        );
        *entry.current_dispatch.lock().unwrap() = Some(task.dispatch_id.clone());
        *entry.current_request.lock().unwrap() = Some(envelope.request_id.clone());
        debug!(
            worker.id = %entry.id,
            dispatch.id = %task.dispatch_id,
            request.id = %envelope.request_id,
            "dispatching to worker"
        );

        let outcome = self
            .run_on(&entry, &envelope, updates, task.timeout)
            .await;
        match &outcome {
            Ok(_) | Err(DispatchError::Transient(_)) => {}
            Err(e) => debug!(dispatch.id = %task.dispatch_id, error = %e, "attempt failed"),
        }
        outcome
    }

    async fn run_on(
        self: &Arc<Self>,
        entry: &Arc<WorkerEntry>,
        envelope: &Envelope,
        updates: Option<mpsc::UnboundedSender<AttemptUpdate>>,
        task_timeout: Duration,
    ) -> Result<TaskOutput, DispatchError> {
        let ttl = task_timeout + Duration::from_secs(1);
        let reply = match entry.conn.begin_request(envelope, updates, ttl) {
            Ok(rx) => rx,
            Err(e) => {
                self.remove_entry(entry, "send failed").await;
                return Err(DispatchError::Transient(e.to_string()));
            }
        };

        match tokio::time::timeout(task_timeout, reply).await {
            Ok(Ok(Ok(output))) => {
                entry.tasks_completed.fetch_add(1, Ordering::Relaxed);
                self.counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
                if !entry.shared {
                    entry.release();
                }
                Ok(output)
            }
            Ok(Ok(Err(WorkerFailure::Task(e)))) => {
                // the sandbox failed; the worker itself is fine
                if !entry.shared {
                    entry.release();
                }
                Err(DispatchError::Transient(format!("worker error: {}", e.message)))
            }
            Ok(Ok(Err(failure))) => {
                self.remove_entry(entry, "channel failure").await;
                self.maybe_replace(entry).await;
                Err(DispatchError::Transient(failure.to_string()))
            }
            Ok(Err(_recv_dropped)) => {
                entry.conn.forget(&envelope.request_id);
                if !entry.shared {
                    entry.release();
                }
                Err(DispatchError::Transient("reply channel dropped".to_string()))
            }
            Err(_elapsed) => {
                // stuck worker: its late reply must never reach anyone
                warn!(
                    worker.id = %entry.id,
                    request.id = %envelope.request_id,
                    "task timeout; terminating stuck worker"
                );
                self.remove_entry(entry, "stuck on task").await;
                self.counters.total_replaced.fetch_add(1, Ordering::Relaxed);
                if !self.shutting_down.load(Ordering::Acquire) {
                    if entry.shared {
                        let _ = self.spawn_shared().await;
                    } else {
                        let _ = self.try_spawn_dedicated(false).await;
                    }
                }
                Err(DispatchError::Transient(format!(
                    "task timed out after {:?} on worker {}",
                    task_timeout, entry.id
                )))
            }
        }
    }

    async fn maybe_replace(self: &Arc<Self>, entry: &Arc<WorkerEntry>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if entry.shared {
            let _ = self.spawn_shared().await;
        } else if self.workers.read().await.len() < self.config.min_workers {
            self.counters.total_replaced.fetch_add(1, Ordering::Relaxed);
            let _ = self.try_spawn_dedicated(false).await;
        }
    }

    /// Run an attempt on the shared lane. Shared workers accept interleaved
    /// dispatches; the connection's correlation map keeps them apart.
    async fn execute_shared(
        self: &Arc<Self>,
        task: WorkerTask,
        updates: Option<mpsc::UnboundedSender<AttemptUpdate>>,
    ) -> Result<TaskOutput, DispatchError> {
        let entry = {
            let shared = self.shared.read().await;
            if shared.is_empty() {
                return Err(DispatchError::Routing(
                    "no shared worker available".to_string(),
                ));
            }
            let i = self.shared_cursor.fetch_add(1, Ordering::Relaxed) % shared.len();
            shared[i].clone()
        };

        let envelope = Envelope::new(
            task.message.clone(),
            task.target_type,
            task.priority,
            task.timeout.as_millis().max(1) as u64,
        );
        debug!(
            worker.id = %entry.id,
            dispatch.id = %task.dispatch_id,
            "dispatching to shared worker"
        );
        self.run_on(&entry, &envelope, updates, task.timeout).await
    }

    /// Forward a cancel to whichever worker is executing `dispatch_id`, so
    /// the sandbox can stop early. Best effort; the queue discards the
    /// attempt outcome either way. Returns whether a busy worker matched.
    pub async fn cancel_dispatch(&self, dispatch_id: &DispatchId, reason: &str) -> bool {
        let workers = self.workers.read().await;
        for entry in workers.values() {
            let is_current =
                entry.current_dispatch.lock().unwrap().as_ref() == Some(dispatch_id);
            if !is_current {
                continue;
            }
            let Some(request_id) = entry.current_request.lock().unwrap().clone() else {
                continue;
            };
            let envelope = Envelope::new(
                Message::Cancel(Cancel {
                    reason: reason.to_string(),
                }),
                TargetType::Worker,
                Priority::High,
                1_000,
            )
            .with_request_id(request_id);
            debug!(
                worker.id = %entry.id,
                dispatch.id = %dispatch_id,
                "forwarding cancel to busy worker"
            );
            let _ = entry.conn.send(&envelope);
            return true;
        }
        false
    }

    /// Terminate a worker and spawn a fresh replacement. Used by the
    /// heartbeat monitor; the current dispatch (if any) fails as transient
    /// through the dying connection.
    pub async fn restart_worker(self: &Arc<Self>, worker_id: &WorkerId) -> anyhow::Result<WorkerId> {
        let entry = self
            .find(worker_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown worker: {}", worker_id))?;

        let was_shared = entry.shared;
        self.remove_entry(&entry, "restart requested").await;
        self.counters.total_replaced.fetch_add(1, Ordering::Relaxed);

        let replacement = if was_shared {
            self.spawn_shared().await?
        } else {
            match self.try_spawn_dedicated(false).await? {
                Some(entry) => entry,
                None => anyhow::bail!("pool at capacity while restarting {}", worker_id),
            }
        };
        self.events.emit(SupervisorEvent::WorkerRestarted {
            worker_id: worker_id.clone(),
            replacement: replacement.id.clone(),
        });
        info!(old = %worker_id, new = %replacement.id, "worker restarted");
        Ok(replacement.id.clone())
    }

    async fn find(&self, worker_id: &WorkerId) -> Option<Arc<WorkerEntry>> {
        if let Some(entry) = self.workers.read().await.get(worker_id) {
            return Some(entry.clone());
        }
        self.shared
            .read()
            .await
            .iter()
            .find(|e| &e.id == worker_id)
            .cloned()
    }

    /// Immutable view of every worker.
    pub async fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut out: Vec<WorkerInfo> = self
            .workers
            .read()
            .await
            .values()
            .map(|e| e.info())
            .collect();
        out.extend(self.shared.read().await.iter().map(|e| e.info()));
        out
    }

    pub async fn stats(&self) -> PoolStats {
        let workers = self.workers.read().await;
        let mut stats = PoolStats {
            size: workers.len(),
            shared: self.shared.read().await.len(),
            total_spawned: self.counters.total_spawned.load(Ordering::Relaxed),
            total_reaped: self.counters.total_reaped.load(Ordering::Relaxed),
            total_replaced: self.counters.total_replaced.load(Ordering::Relaxed),
            tasks_completed: self.counters.tasks_completed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in workers.values() {
            match entry.state() {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                _ => {}
            }
        }
        stats
    }

    pub async fn has_shared_workers(&self) -> bool {
        !self.shared.read().await.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn task_timeout(&self) -> Duration {
        self.config.task_timeout
    }

    /// Terminate every worker and reject everything in flight.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let workers: Vec<Arc<WorkerEntry>> =
            self.workers.write().await.drain().map(|(_, e)| e).collect();
        let shared: Vec<Arc<WorkerEntry>> = self.shared.write().await.drain(..).collect();
        for entry in workers.into_iter().chain(shared) {
            entry.set_state(WorkerState::Dead);
            entry.conn.terminate();
        }
        self.events.emit(SupervisorEvent::PoolShutdown);
        info!("worker pool shut down");
    }

    fn start_reaper(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.config.idle_timeout / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.reap_idle().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// One reap sweep: terminate workers idle past the threshold, never
    /// dropping below `min_workers`.
    async fn reap_idle(self: &Arc<Self>) {
        let candidates: Vec<Arc<WorkerEntry>> = {
            let workers = self.workers.read().await;
            let headroom = workers.len().saturating_sub(self.config.min_workers);
            if headroom == 0 {
                return;
            }
            let mut idle: Vec<Arc<WorkerEntry>> = workers
                .values()
                .filter(|e| e.state() == WorkerState::Idle && e.idle_for() > self.config.idle_timeout)
                .cloned()
                .collect();
            // longest idle go first
            idle.sort_by_key(|e| std::cmp::Reverse(e.idle_for()));
            idle.truncate(headroom);
            idle
        };

        for entry in candidates {
            // claim atomically so a concurrent execute can't grab it
            if !entry.try_claim_for_reap() {
                continue;
            }
            let idle_for = entry.idle_for();
            let cleanup = Envelope::new(
                Message::Cleanup(Cleanup { resources: vec![] }),
                TargetType::Worker,
                Priority::Low,
                1_000,
            );
            let _ = entry.conn.send(&cleanup);
            self.remove_entry(&entry, "idle reap").await;
            self.counters.total_reaped.fetch_add(1, Ordering::Relaxed);
            self.events.emit(SupervisorEvent::WorkerReaped {
                worker_id: entry.id.clone(),
                idle_for,
            });
            debug!(worker.id = %entry.id, ?idle_for, "reaped idle worker");
        }
    }
}

#[async_trait::async_trait]
impl WorkerProber for Arc<WorkerPool> {
    async fn probe(
        &self,
        worker_id: &WorkerId,
        heartbeat_id: u64,
        timeout: Duration,
    ) -> Result<Duration, ProbeError> {
        let entry = self
            .find(worker_id)
            .await
            .ok_or(ProbeError::UnknownWorker)?;
        entry
            .conn
            .heartbeat(heartbeat_id, timeout)
            .await
            .map_err(|e| match e {
                WorkerFailure::Channel(msg) if msg.contains("timed out") => ProbeError::Timeout,
                other => ProbeError::Channel(other.to_string()),
            })
    }

    async fn restart(&self, worker_id: &WorkerId) -> anyhow::Result<WorkerId> {
        self.restart_worker(worker_id).await
    }
}
