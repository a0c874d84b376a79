//! drover - dispatch supervisor for isolated worker fleets
//!
//! Drover admits opaque code bundles into a priority retry queue, routes
//! each one to an execution lane (in-process, dedicated worker, or shared
//! worker), runs it over the [`droverproto`] wire protocol, watches worker
//! liveness with heartbeats, and aggregates fan-out results.
//!
//! The [`Supervisor`] is the composition root: it owns the queue, the
//! worker pool, the heartbeat monitor, the router, and the collector pool,
//! all built from one [`DroverConfig`]. Workers are reached through the
//! [`worker::WorkerLauncher`] trait; the crate ships an in-process
//! reference launcher and embedders plug in their own isolation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use drover::{Bundle, DroverConfig, Supervisor};
//! use drover::worker::LocalLauncher;
//!
//! # async fn example(runner: Arc<dyn drover::worker::BundleRunner>) -> anyhow::Result<()> {
//! let launcher = Arc::new(LocalLauncher::new(runner));
//! let supervisor = Supervisor::start(DroverConfig::default(), launcher).await?;
//!
//! let bundle = Bundle::from_code("return 40 + 2", serde_json::Value::Null);
//! let handle = supervisor.dispatch(bundle).await?;
//! let output = handle.wait().await?;
//! println!("result: {}", output.value);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use droverproto::{Envelope, ExecutionMetadata, Priority, TargetType};
use tokio::sync::broadcast;
use tracing::debug;

pub mod bundle;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod router;
pub mod telemetry;
pub mod worker;

pub use bundle::{Bundle, BundlePayload};
pub use collector::{
    CollectorError, CollectorEvent, CollectorPool, ExecutionId, MergeStrategy, MergedResult,
    ResultCollector, TargetResult,
};
pub use config::{
    BackoffConfig, BackoffKind, CollectorConfig, DroverConfig, HeartbeatConfig, PoolConfig,
    QueueConfig, RouterConfig,
};
pub use dispatch::{DispatchId, DispatchOptions, DispatchSpec, TaskOutput};
pub use error::{DispatchError, ErrorKind};
pub use events::{EventBus, SupervisorEvent};
pub use heartbeat::{HealthStatus, HeartbeatMonitor, WorkerHealth};
pub use metrics::{CollectorPoolStats, PoolStats, QueueMetrics};
pub use pool::{WorkerInfo, WorkerPool, WorkerState};
pub use queue::{DispatchHandle, DispatchQueue};
pub use router::{DispatchRouter, LoadSnapshot, RouteDecision, RouteStrategy, RouteTarget};
pub use worker::WorkerId;

use crate::queue::{DispatchExecutor, QueueLoad};
use crate::worker::{BundleRunner, RunContext, WorkerLauncher};

/// The composition root. Everything is an explicit dependency built here;
/// tests construct isolated instances the same way.
pub struct Supervisor {
    config: DroverConfig,
    events: EventBus,
    pool: Arc<WorkerPool>,
    monitor: Arc<HeartbeatMonitor>,
    queue: DispatchQueue,
    collectors: Arc<CollectorPool>,
}

impl Supervisor {
    /// Start with workers only; no in-process lane.
    pub async fn start(
        config: DroverConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::start_with_runner(config, launcher, None).await
    }

    /// Start with an optional in-process runner backing the in-process
    /// routing lane.
    pub async fn start_with_runner(
        config: DroverConfig,
        launcher: Arc<dyn WorkerLauncher>,
        in_process: Option<Arc<dyn BundleRunner>>,
    ) -> anyhow::Result<Arc<Self>> {
        let events = EventBus::default();
        let pool = WorkerPool::start(config.pool.clone(), launcher, events.clone()).await?;

        let monitor = HeartbeatMonitor::new(
            config.heartbeat.clone(),
            Arc::new(pool.clone()),
            events.clone(),
        );
        monitor.start();
        Self::wire_monitor_registration(&events, &monitor, &pool).await;

        let router = Arc::new(DispatchRouter::new(config.router.clone()));
        let executor = Arc::new(RoutedExecutor {
            router,
            pool: pool.clone(),
            in_process,
            task_timeout: config.pool.task_timeout,
        });
        let queue = DispatchQueue::start(config.queue.clone(), config.backoff.clone(), executor);
        let collectors = CollectorPool::new(config.collector.clone());

        Ok(Arc::new(Self {
            config,
            events,
            pool,
            monitor,
            queue,
            collectors,
        }))
    }

    /// Keep the monitor's registration in sync with pool lifecycle events,
    /// and seed it with the workers the pool already spawned.
    async fn wire_monitor_registration(
        events: &EventBus,
        monitor: &Arc<HeartbeatMonitor>,
        pool: &Arc<WorkerPool>,
    ) {
        for info in pool.snapshot().await {
            monitor.register(info.worker_id).await;
        }
        let mut rx = events.subscribe();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SupervisorEvent::WorkerReady { worker_id }) => {
                        monitor.register(worker_id).await;
                    }
                    Ok(SupervisorEvent::WorkerTerminated { worker_id, .. })
                    | Ok(SupervisorEvent::WorkerReaped { worker_id, .. }) => {
                        monitor.unregister(&worker_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Enqueue a bundle with default options.
    pub async fn dispatch(&self, bundle: Bundle) -> Result<DispatchHandle, DispatchError> {
        self.dispatch_with(bundle, DispatchOptions::default()).await
    }

    /// Enqueue a bundle. Unset options fall back to the queue defaults; the
    /// bundle's manifest-declared priority applies when the caller does not
    /// override it.
    pub async fn dispatch_with(
        &self,
        bundle: Bundle,
        opts: DispatchOptions,
    ) -> Result<DispatchHandle, DispatchError> {
        let priority = opts
            .priority
            .or_else(|| bundle.declared_priority())
            .unwrap_or(Priority::Normal);
        let spec = DispatchSpec {
            id: DispatchId::new(),
            bundle,
            priority,
            max_attempts: opts
                .max_attempts
                .unwrap_or(self.config.queue.default_max_attempts),
            timeout: opts.timeout.unwrap_or(self.config.queue.default_timeout),
            strategy: opts.strategy,
        };
        self.queue.enqueue(spec).await
    }

    /// Cancel a dispatch by id. A queued dispatch is rejected immediately;
    /// an in-flight one has its future rejected, its eventual result
    /// discarded, and a wire cancel forwarded to the busy worker.
    pub async fn cancel(&self, id: &DispatchId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let existed = self.queue.cancel(id, reason.clone()).await;
        if existed {
            self.pool.cancel_dispatch(id, &reason).await;
        }
        existed
    }

    /// Reject every queued dispatch.
    pub async fn clear(&self, reason: impl Into<String>) {
        self.queue.clear(reason).await
    }

    /// Create a fan-out collector under this supervisor's collector pool.
    pub fn collect(
        &self,
        execution_id: ExecutionId,
        expected_targets: usize,
        strategy: MergeStrategy,
        timeout: Duration,
    ) -> Result<Arc<ResultCollector>, CollectorError> {
        self.collectors
            .create(execution_id, expected_targets, strategy, timeout)
    }

    pub fn collectors(&self) -> &Arc<CollectorPool> {
        &self.collectors
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub async fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics().await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Stop everything: the queue rejects all dispatches, the monitor stops
    /// probing, the pool terminates every worker.
    pub async fn shutdown(&self) {
        self.queue.shutdown("supervisor shutdown").await;
        self.monitor.shutdown();
        self.pool.shutdown().await;
    }
}

/// The queue's executor: route the bundle, then run the attempt on the
/// chosen lane.
struct RoutedExecutor {
    router: Arc<DispatchRouter>,
    pool: Arc<WorkerPool>,
    in_process: Option<Arc<dyn BundleRunner>>,
    task_timeout: Duration,
}

impl RoutedExecutor {
    async fn load_snapshot(&self, load: QueueLoad) -> LoadSnapshot {
        let stats = self.pool.stats().await;
        let cpu_load_pct = if stats.size == 0 {
            0.0
        } else {
            stats.busy as f64 / stats.size as f64 * 100.0
        };
        LoadSnapshot {
            active_workers: stats.size,
            busy_workers: stats.busy,
            pending_tasks: load.queued,
            cpu_load_pct,
            shared_available: self.pool.has_shared_workers().await,
            in_process_available: self.in_process.is_some(),
            workers_available: self.pool.max_workers() > 0,
        }
    }

    async fn run_in_process(&self, spec: &DispatchSpec) -> Result<TaskOutput, DispatchError> {
        let runner = self
            .in_process
            .as_ref()
            .ok_or_else(|| DispatchError::Routing("no in-process runner configured".to_string()))?
            .clone();

        let message = spec.bundle.to_message();
        let envelope = Envelope::new(
            message,
            TargetType::Worker,
            spec.priority,
            self.task_timeout.as_millis().max(1) as u64,
        );
        let ctx = RunContext::detached(WorkerId::from("in-process".to_string()), envelope.clone());

        let started = Instant::now();
        match tokio::time::timeout(self.task_timeout, runner.run(&envelope.message, ctx)).await {
            Ok(Ok(outcome)) => Ok(TaskOutput {
                value: outcome.value,
                metadata: ExecutionMetadata::new(
                    started.elapsed().as_secs_f64() * 1000.0,
                    outcome.memory_used,
                ),
            }),
            Ok(Err(e)) => Err(DispatchError::Transient(format!("in-process error: {}", e))),
            Err(_) => Err(DispatchError::Transient(format!(
                "in-process task timed out after {:?}",
                self.task_timeout
            ))),
        }
    }
}

#[async_trait]
impl DispatchExecutor for RoutedExecutor {
    async fn execute(
        &self,
        spec: &DispatchSpec,
        attempt: u32,
        load: QueueLoad,
    ) -> Result<TaskOutput, DispatchError> {
        let snapshot = self.load_snapshot(load).await;
        let decision = self.router.decide(&spec.bundle, &snapshot, spec.strategy)?;
        debug!(
            dispatch.id = %spec.id,
            attempt,
            target = ?decision.target,
            rule = decision.rule,
            complexity = decision.complexity,
            "routing decision"
        );

        match decision.target {
            RouteTarget::InProcess => self.run_in_process(spec).await,
            RouteTarget::DedicatedWorker => {
                self.pool
                    .execute(crate::dispatch::WorkerTask {
                        dispatch_id: spec.id.clone(),
                        message: spec.bundle.to_message(),
                        target_type: TargetType::Worker,
                        priority: spec.priority,
                        timeout: self.task_timeout,
                    })
                    .await
            }
            RouteTarget::SharedWorker => {
                self.pool
                    .execute(crate::dispatch::WorkerTask {
                        dispatch_id: spec.id.clone(),
                        message: spec.bundle.to_message(),
                        target_type: TargetType::SharedWorker,
                        priority: spec.priority,
                        timeout: self.task_timeout,
                    })
                    .await
            }
        }
    }
}
