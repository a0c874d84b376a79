//! End-to-end scenarios against a full supervisor with scripted workers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use drover::worker::{
    BundleRunner, LocalLauncher, RunContext, RunOutcome, WorkerChannels, WorkerId, WorkerLauncher,
};
use drover::{
    BackoffConfig, Bundle, DispatchError, DispatchOptions, DroverConfig, PoolConfig, Supervisor,
    SupervisorEvent,
};
use droverproto::{
    Envelope, ExecutionMetadata, Heartbeat, Message, Priority, TaskResult, WireFrame,
};
use serde_json::json;
use tokio::sync::mpsc;

/// Runner scripted by the dispatched code string.
struct ScriptRunner {
    attempt_times: Mutex<Vec<Instant>>,
    failures_before_success: AtomicU32,
}

impl ScriptRunner {
    fn new(failures_before_success: u32) -> Arc<Self> {
        Arc::new(Self {
            attempt_times: Mutex::new(Vec::new()),
            failures_before_success: AtomicU32::new(failures_before_success),
        })
    }

    fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleRunner for ScriptRunner {
    async fn run(&self, message: &Message, _ctx: RunContext) -> anyhow::Result<RunOutcome> {
        let code = match message {
            Message::DispatchCode(dc) => dc.code.as_str(),
            _ => anyhow::bail!("unexpected payload"),
        };
        self.attempt_times.lock().unwrap().push(Instant::now());
        match code {
            "ok" => Ok(RunOutcome {
                value: json!(42),
                memory_used: 1024,
            }),
            "flaky" => {
                let remaining = self.failures_before_success.load(Ordering::Acquire);
                if remaining > 0 {
                    self.failures_before_success
                        .store(remaining - 1, Ordering::Release);
                    anyhow::bail!("scripted failure ({} left)", remaining - 1)
                }
                Ok(json!("ok").into())
            }
            "fail" => anyhow::bail!("boom"),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(json!(null).into())
            }
            other => anyhow::bail!("unknown script: {}", other),
        }
    }
}

fn test_config() -> DroverConfig {
    DroverConfig::default()
        .with_pool(
            PoolConfig::default()
                .with_bounds(2, 2)
                .with_task_timeout(Duration::from_secs(2)),
        )
        .with_backoff(
            BackoffConfig {
                base: Duration::from_millis(100),
                ..BackoffConfig::default()
            }
            .without_jitter(),
        )
}

async fn start(runner: Arc<ScriptRunner>, config: DroverConfig) -> Arc<Supervisor> {
    Supervisor::start(config, Arc::new(LocalLauncher::new(runner)))
        .await
        .expect("supervisor must start")
}

#[tokio::test]
async fn happy_path_single_dispatch() {
    let runner = ScriptRunner::new(0);
    let supervisor = start(runner, test_config()).await;

    let handle = supervisor
        .dispatch_with(
            Bundle::from_code("ok", json!({})),
            DispatchOptions::default()
                .with_priority(Priority::Normal)
                .with_timeout(Duration::from_secs(5))
                .with_max_attempts(3),
        )
        .await
        .unwrap();

    let output = handle.wait().await.unwrap();
    assert_eq!(output.value, json!(42));
    assert_eq!(output.metadata.memory_used, 1024);
    assert!(output.metadata.execution_time >= 0.0);

    let metrics = supervisor.queue_metrics().await;
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.failed, 0);
    assert_eq!(metrics.retried, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn exponential_retry_then_success() {
    let runner = ScriptRunner::new(2);
    let supervisor = start(runner.clone(), test_config()).await;

    let handle = supervisor
        .dispatch_with(
            Bundle::from_code("flaky", json!({})),
            DispatchOptions::default()
                .with_max_attempts(3)
                .with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    let output = handle.wait().await.unwrap();
    assert_eq!(output.value, json!("ok"));

    // delays before attempts 2 and 3 follow base * multiplier^(n-1)
    let times = runner.attempt_times();
    assert_eq!(times.len(), 3);
    assert!(
        times[1] - times[0] >= Duration::from_millis(100),
        "first backoff too short: {:?}",
        times[1] - times[0]
    );
    assert!(
        times[2] - times[1] >= Duration::from_millis(200),
        "second backoff too short: {:?}",
        times[2] - times[1]
    );

    let metrics = supervisor.queue_metrics().await;
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.succeeded, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn retries_exhausted_surfaces_last_error_and_worker_is_not_poisoned() {
    let runner = ScriptRunner::new(0);
    let supervisor = start(runner, test_config()).await;

    let handle = supervisor
        .dispatch_with(
            Bundle::from_code("fail", json!({})),
            DispatchOptions::default()
                .with_max_attempts(2)
                .with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap();

    match handle.wait().await {
        Err(DispatchError::Exhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("boom"), "{last_error}");
        }
        other => panic!("expected Exhausted, got {:?}", other.map(|o| o.value)),
    }

    let metrics = supervisor.queue_metrics().await;
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.retried, 1);

    // the same pool still serves new dispatches
    let handle = supervisor
        .dispatch(Bundle::from_code("ok", json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().value, json!(42));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn dispatch_deadline_abandons_in_flight_attempt() {
    let runner = ScriptRunner::new(0);
    let supervisor = start(runner, test_config()).await;

    let started = Instant::now();
    let handle = supervisor
        .dispatch_with(
            Bundle::from_code("hang", json!({})),
            DispatchOptions::default()
                .with_max_attempts(3)
                .with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    match handle.wait().await {
        Err(DispatchError::Deadline { elapsed_ms }) => assert!(elapsed_ms >= 100),
        other => panic!("expected Deadline, got {:?}", other.map(|o| o.value)),
    }
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "deadline must fire at ~100ms, not the task timeout"
    );

    let metrics = supervisor.queue_metrics().await;
    assert_eq!(metrics.timed_out, 1);
    assert_eq!(metrics.in_flight, 0);

    // the pool keeps serving; the second worker takes this one
    let handle = supervisor
        .dispatch(Bundle::from_code("ok", json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().value, json!(42));

    supervisor.shutdown().await;
}

// ============================================================================
// Heartbeat-driven restart
// ============================================================================

/// Launcher whose workers can be muted per-worker: a muted worker keeps
/// serving dispatches but stops answering heartbeats.
struct MuteableLauncher {
    mutes: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MuteableLauncher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutes: Mutex::new(Vec::new()),
        })
    }

    fn mute_worker(&self, index: usize) {
        self.mutes.lock().unwrap()[index].store(true, Ordering::Release);
    }
}

#[async_trait]
impl WorkerLauncher for MuteableLauncher {
    async fn launch(&self, worker_id: &WorkerId) -> anyhow::Result<WorkerChannels> {
        let (sup_tx, mut worker_rx) = mpsc::channel::<WireFrame>(64);
        let (worker_tx, sup_rx) = mpsc::channel(64);
        let muted = Arc::new(AtomicBool::new(false));
        self.mutes.lock().unwrap().push(muted.clone());

        let wid = worker_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = worker_rx.recv().await {
                let Ok(envelope) = frame.decode() else { continue };
                let reply = match &envelope.message {
                    Message::Heartbeat(hb) => {
                        if muted.load(Ordering::Acquire) {
                            continue;
                        }
                        Message::HeartbeatResponse(Heartbeat {
                            heartbeat_id: hb.heartbeat_id,
                            timestamp: droverproto::monotonic_ms(),
                            worker_id: wid.clone(),
                        })
                    }
                    m if m.is_dispatch() => Message::TaskResult(TaskResult::final_value(
                        json!(1),
                        ExecutionMetadata::default(),
                    )),
                    _ => continue,
                };
                let reply = Envelope::reply_to(&envelope, reply);
                if let Ok(frame) = WireFrame::encode(&reply) {
                    let _ = worker_tx.send(frame).await;
                }
            }
        });

        Ok(WorkerChannels {
            tx: sup_tx,
            rx: sup_rx,
        })
    }
}

#[tokio::test]
async fn heartbeat_failure_triggers_restart_with_fresh_worker() {
    let launcher = MuteableLauncher::new();
    let mut config = DroverConfig::default().with_pool(PoolConfig::default().with_bounds(1, 1));
    config.heartbeat.interval = Duration::from_millis(50);
    config.heartbeat.timeout = Duration::from_millis(40);
    config.heartbeat.max_missed = 3;
    config.heartbeat.auto_restart = true;

    let supervisor = Supervisor::start(config, launcher.clone())
        .await
        .unwrap();
    let mut events = supervisor.events();

    let old_id = supervisor.pool().snapshot().await[0].worker_id.clone();

    // worker goes silent on heartbeats
    launcher.mute_worker(0);

    // expect failure then restart within a few probe intervals
    let mut failed_seen = false;
    let mut replacement = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while replacement.is_none() {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("restart must happen before the deadline")
            .expect("event stream open");
        match event {
            SupervisorEvent::WorkerFailed { worker_id, misses } => {
                assert_eq!(worker_id, old_id);
                assert!(misses >= 3);
                failed_seen = true;
            }
            SupervisorEvent::WorkerRestarted {
                worker_id,
                replacement: new_id,
            } => {
                assert_eq!(worker_id, old_id);
                replacement = Some(new_id);
            }
            _ => {}
        }
    }
    assert!(failed_seen, "failure notification precedes restart");
    let replacement = replacement.unwrap();
    assert_ne!(replacement, old_id);

    // the replacement is serving and reports healthy within a round
    tokio::time::sleep(Duration::from_millis(150)).await;
    let health = supervisor.monitor().health(&replacement).await.unwrap();
    assert_eq!(health.status, drover::HealthStatus::Healthy);

    let handle = supervisor
        .dispatch(Bundle::from_code("anything", json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().value, json!(1));

    supervisor.shutdown().await;
}
