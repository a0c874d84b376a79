//! Worker channel abstraction and the in-process reference worker.
//!
//! The supervisor never sees how a worker is isolated; it sees a pair of
//! frame channels obeying the wire protocol. [`WorkerLauncher`] produces the
//! channels, [`WorkerConnection`] owns the supervisor side of them.
//!
//! The connection runs a reactor task that owns the receive side: replies
//! are routed to pending requests by requestId via oneshot channels, orphan
//! replies are logged and dropped, and heartbeat replies go to a dedicated
//! slot so they never contend with task traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use droverproto::{
    Envelope, ExecutionMetadata, Heartbeat, Message, Priority, Progress, TargetType, TaskError,
    TaskResult, WireFrame,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::dispatch::TaskOutput;

/// Unique identifier for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The two directions of a worker's frame channel.
pub struct WorkerChannels {
    /// Supervisor → worker
    pub tx: mpsc::Sender<WireFrame>,
    /// Worker → supervisor
    pub rx: mpsc::Receiver<WireFrame>,
}

/// Produces channel pairs for fresh workers. The pool calls this every time
/// it spawns; implementations decide what actually runs on the other end.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, worker_id: &WorkerId) -> anyhow::Result<WorkerChannels>;
}

/// Why an attempt on a worker did not produce a result.
#[derive(Debug, Clone)]
pub enum WorkerFailure {
    /// Send failed or the worker's channel went away
    Channel(String),
    /// The sandbox reported an execution error (worker stays usable)
    Task(TaskError),
    /// The connection was shut down under the request
    Closed,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerFailure::Channel(e) => write!(f, "worker channel error: {}", e),
            WorkerFailure::Task(e) => write!(f, "worker error: {}", e.message),
            WorkerFailure::Closed => write!(f, "worker connection closed"),
        }
    }
}

/// Mid-attempt output streamed by a worker.
#[derive(Debug, Clone)]
pub enum AttemptUpdate {
    Progress(Progress),
    /// A non-final result (fan-out partials)
    Partial(TaskResult),
}

struct ReplySlot {
    final_tx: oneshot::Sender<Result<TaskOutput, WorkerFailure>>,
    update_tx: Option<mpsc::UnboundedSender<AttemptUpdate>>,
    deadline: Instant,
}

struct ConnState {
    pending: HashMap<String, ReplySlot>,
    /// Latest outstanding heartbeat: (id, reply slot). Replies with any
    /// other id are stale and dropped.
    heartbeat: Option<(u64, oneshot::Sender<Heartbeat>)>,
}

/// Supervisor-side handle to one worker's channel.
pub struct WorkerConnection {
    worker_id: WorkerId,
    tx: mpsc::Sender<WireFrame>,
    state: Arc<Mutex<ConnState>>,
    closed_tx: watch::Sender<bool>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerConnection {
    /// Wrap freshly launched channels. Spawns the reactor.
    pub fn new(worker_id: WorkerId, channels: WorkerChannels) -> Self {
        let state = Arc::new(Mutex::new(ConnState {
            pending: HashMap::new(),
            heartbeat: None,
        }));
        let (closed_tx, _) = watch::channel(false);

        let reactor = tokio::spawn(reactor_task(
            worker_id.clone(),
            channels.rx,
            state.clone(),
            closed_tx.clone(),
        ));

        Self {
            worker_id,
            tx: channels.tx,
            state,
            closed_tx,
            reactor: Mutex::new(Some(reactor)),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves when the worker's channel dies for any reason.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fire-and-forget send. Non-blocking: succeeds or fails immediately
    /// with a channel error.
    pub fn send(&self, envelope: &Envelope) -> Result<(), WorkerFailure> {
        let frame = WireFrame::encode(envelope)
            .map_err(|e| WorkerFailure::Channel(format!("encode failed: {}", e)))?;
        self.tx
            .try_send(frame)
            .map_err(|e| WorkerFailure::Channel(e.to_string()))
    }

    /// Register a pending request and send its envelope. The returned
    /// receiver resolves with the worker's final reply. `updates` receives
    /// progress and partial results if supplied. `ttl` bounds how long the
    /// reactor keeps the slot before expiring it.
    pub fn begin_request(
        &self,
        envelope: &Envelope,
        updates: Option<mpsc::UnboundedSender<AttemptUpdate>>,
        ttl: Duration,
    ) -> Result<oneshot::Receiver<Result<TaskOutput, WorkerFailure>>, WorkerFailure> {
        if self.is_closed() {
            return Err(WorkerFailure::Closed);
        }
        let (final_tx, final_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                envelope.request_id.clone(),
                ReplySlot {
                    final_tx,
                    update_tx: updates,
                    deadline: Instant::now() + ttl,
                },
            );
        }
        if let Err(e) = self.send(envelope) {
            self.state
                .lock()
                .unwrap()
                .pending
                .remove(&envelope.request_id);
            return Err(e);
        }
        trace!(
            worker.id = %self.worker_id,
            request.id = %envelope.request_id,
            "request registered"
        );
        Ok(final_rx)
    }

    /// Drop a pending request so any eventual reply is discarded as an
    /// orphan. The worker remains assignable.
    pub fn forget(&self, request_id: &str) {
        if self
            .state
            .lock()
            .unwrap()
            .pending
            .remove(request_id)
            .is_some()
        {
            debug!(
                worker.id = %self.worker_id,
                request.id = %request_id,
                "pending request abandoned; late reply will be dropped"
            );
        }
    }

    /// Send a heartbeat probe and await its matching reply. Only the reply
    /// echoing `heartbeat_id` is accepted; anything else is dropped as
    /// stale. Returns the round-trip time.
    pub async fn heartbeat(
        &self,
        heartbeat_id: u64,
        timeout: Duration,
    ) -> Result<Duration, WorkerFailure> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            // a newer probe supersedes any outstanding one
            state.heartbeat = Some((heartbeat_id, reply_tx));
        }

        let envelope = Envelope::new(
            Message::Heartbeat(Heartbeat {
                heartbeat_id,
                timestamp: droverproto::monotonic_ms(),
                worker_id: self.worker_id.to_string(),
            }),
            TargetType::Worker,
            Priority::Critical,
            timeout.as_millis().max(1) as u64,
        );

        let started = Instant::now();
        self.send(&envelope)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(_reply)) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(WorkerFailure::Closed),
            Err(_) => {
                // expire the slot so a late reply is dropped
                let mut state = self.state.lock().unwrap();
                if matches!(state.heartbeat, Some((id, _)) if id == heartbeat_id) {
                    state.heartbeat = None;
                }
                Err(WorkerFailure::Channel("heartbeat timed out".to_string()))
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Tear the connection down: the reactor stops and every pending
    /// request fails with [`WorkerFailure::Closed`].
    pub fn terminate(&self) {
        if let Some(handle) = self.reactor.lock().unwrap().take() {
            handle.abort();
        }
        let mut state = self.state.lock().unwrap();
        for (_, slot) in state.pending.drain() {
            let _ = slot.final_tx.send(Err(WorkerFailure::Closed));
        }
        state.heartbeat = None;
        drop(state);
        let _ = self.closed_tx.send(true);
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Reactor: owns the receive side, routes replies, expires stale slots.
async fn reactor_task(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<WireFrame>,
    state: Arc<Mutex<ConnState>>,
    closed_tx: watch::Sender<bool>,
) {
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => handle_frame(&worker_id, frame, &state),
                    None => {
                        let mut st = state.lock().unwrap();
                        let n = st.pending.len();
                        for (_, slot) in st.pending.drain() {
                            let _ = slot.final_tx.send(Err(WorkerFailure::Channel(
                                "worker channel closed".to_string(),
                            )));
                        }
                        st.heartbeat = None;
                        drop(st);
                        if n > 0 {
                            warn!(worker.id = %worker_id, pending = n, "worker channel closed with pending requests");
                        } else {
                            debug!(worker.id = %worker_id, "worker channel closed");
                        }
                        let _ = closed_tx.send(true);
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let mut st = state.lock().unwrap();
                let expired: Vec<String> = st
                    .pending
                    .iter()
                    .filter(|(_, slot)| now > slot.deadline)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if let Some(slot) = st.pending.remove(&id) {
                        debug!(worker.id = %worker_id, request.id = %id, "pending request expired");
                        let _ = slot.final_tx.send(Err(WorkerFailure::Channel(
                            "reply wait expired".to_string(),
                        )));
                    }
                }
            }
        }
    }
}

fn handle_frame(worker_id: &WorkerId, frame: WireFrame, state: &Arc<Mutex<ConnState>>) {
    let envelope = match frame.decode() {
        Ok(env) => env,
        Err(e) => {
            warn!(worker.id = %worker_id, error = %e, "dropping malformed frame from worker");
            return;
        }
    };

    let mut st = state.lock().unwrap();
    match envelope.message {
        Message::HeartbeatResponse(hb) => {
            match st.heartbeat.take() {
                Some((expected, reply_tx)) if expected == hb.heartbeat_id => {
                    let _ = reply_tx.send(hb);
                }
                Some(outstanding) => {
                    debug!(
                        worker.id = %worker_id,
                        got = hb.heartbeat_id,
                        expected = outstanding.0,
                        "stale heartbeat reply dropped"
                    );
                    st.heartbeat = Some(outstanding);
                }
                None => {
                    debug!(worker.id = %worker_id, id = hb.heartbeat_id, "unsolicited heartbeat reply dropped");
                }
            }
        }
        Message::TaskResult(result) if result.is_final => {
            match st.pending.remove(&envelope.request_id) {
                Some(slot) => {
                    let _ = slot.final_tx.send(Ok(TaskOutput {
                        value: result.value,
                        metadata: result.metadata,
                    }));
                }
                None => orphan(worker_id, &envelope.request_id, "result"),
            }
        }
        Message::TaskResult(result) => {
            match st.pending.get(&envelope.request_id) {
                Some(slot) => {
                    if let Some(tx) = &slot.update_tx {
                        let _ = tx.send(AttemptUpdate::Partial(result));
                    }
                }
                None => orphan(worker_id, &envelope.request_id, "partial"),
            }
        }
        Message::Complete(complete) => {
            match st.pending.remove(&envelope.request_id) {
                Some(slot) => {
                    let _ = slot.final_tx.send(Ok(TaskOutput {
                        value: complete.summary,
                        metadata: ExecutionMetadata::default(),
                    }));
                }
                None => orphan(worker_id, &envelope.request_id, "complete"),
            }
        }
        Message::TaskError(error) => {
            match st.pending.remove(&envelope.request_id) {
                Some(slot) => {
                    let _ = slot.final_tx.send(Err(WorkerFailure::Task(error)));
                }
                None => orphan(worker_id, &envelope.request_id, "error"),
            }
        }
        Message::Progress(progress) => {
            match st.pending.get(&envelope.request_id) {
                Some(slot) => {
                    if let Some(tx) = &slot.update_tx {
                        let _ = tx.send(AttemptUpdate::Progress(progress));
                    }
                }
                None => orphan(worker_id, &envelope.request_id, "progress"),
            }
        }
        other => {
            debug!(
                worker.id = %worker_id,
                kind = %other.kind(),
                "unexpected message kind from worker, dropped"
            );
        }
    }
}

fn orphan(worker_id: &WorkerId, request_id: &str, what: &str) {
    debug!(
        worker.id = %worker_id,
        request.id = %request_id,
        kind = what,
        "discarding orphan reply (no pending request)"
    );
}

// ============================================================================
// In-process reference worker
// ============================================================================

/// What a runner returns on success.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub value: serde_json::Value,
    pub memory_used: u64,
}

impl From<serde_json::Value> for RunOutcome {
    fn from(value: serde_json::Value) -> Self {
        Self {
            value,
            memory_used: 0,
        }
    }
}

/// Executes dispatched payloads. This is the black-box sandbox boundary:
/// drover never interprets bundle contents itself.
#[async_trait]
pub trait BundleRunner: Send + Sync {
    async fn run(&self, message: &Message, ctx: RunContext) -> anyhow::Result<RunOutcome>;
}

/// Handed to the runner so it can stream progress and partial results for
/// the request it is executing.
#[derive(Clone)]
pub struct RunContext {
    worker_id: WorkerId,
    request: Envelope,
    tx: mpsc::Sender<WireFrame>,
}

impl RunContext {
    /// Context with no live channel; progress and partials are dropped.
    /// Used by the in-process execution lane, which has no worker behind it.
    pub(crate) fn detached(worker_id: WorkerId, request: Envelope) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            worker_id,
            request,
            tx,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }

    /// Emit a progress report, `fraction` in [0, 1]. Best effort.
    pub async fn progress(&self, fraction: f64, status: impl Into<String>) {
        let reply = Envelope::reply_to(
            &self.request,
            Message::Progress(Progress {
                progress: fraction.clamp(0.0, 1.0),
                status: status.into(),
            }),
        );
        if let Ok(frame) = WireFrame::encode(&reply) {
            let _ = self.tx.send(frame).await;
        }
    }

    /// Emit a non-final partial result. Best effort.
    pub async fn partial(&self, value: serde_json::Value) {
        let reply = Envelope::reply_to(&self.request, Message::TaskResult(TaskResult::partial(value)));
        if let Ok(frame) = WireFrame::encode(&reply) {
            let _ = self.tx.send(frame).await;
        }
    }
}

/// Launches workers as in-process tokio tasks speaking the wire protocol.
/// This is the reference deployment; a process- or socket-backed launcher
/// plugs into the same trait.
pub struct LocalLauncher {
    runner: Arc<dyn BundleRunner>,
    channel_capacity: usize,
}

impl LocalLauncher {
    pub fn new(runner: Arc<dyn BundleRunner>) -> Self {
        Self {
            runner,
            channel_capacity: 256,
        }
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&self, worker_id: &WorkerId) -> anyhow::Result<WorkerChannels> {
        let (sup_tx, worker_rx) = mpsc::channel(self.channel_capacity);
        let (worker_tx, sup_rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(worker_loop(
            worker_id.clone(),
            self.runner.clone(),
            worker_rx,
            worker_tx,
        ));
        Ok(WorkerChannels {
            tx: sup_tx,
            rx: sup_rx,
        })
    }
}

/// The worker side: one loop per worker. Dispatches run on spawned tasks so
/// the loop keeps answering heartbeats while a task executes.
async fn worker_loop(
    worker_id: WorkerId,
    runner: Arc<dyn BundleRunner>,
    mut rx: mpsc::Receiver<WireFrame>,
    tx: mpsc::Sender<WireFrame>,
) {
    let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(frame) = rx.recv().await {
        active.retain(|_, handle| !handle.is_finished());

        let envelope = match frame.decode() {
            Ok(env) => env,
            Err(e) => {
                warn!(worker.id = %worker_id, error = %e, "worker dropping invalid frame");
                continue;
            }
        };

        match &envelope.message {
            Message::Heartbeat(hb) => {
                let reply = Envelope::reply_to(
                    &envelope,
                    Message::HeartbeatResponse(Heartbeat {
                        heartbeat_id: hb.heartbeat_id,
                        timestamp: droverproto::monotonic_ms(),
                        worker_id: worker_id.to_string(),
                    }),
                );
                if let Ok(frame) = WireFrame::encode(&reply) {
                    let _ = tx.send(frame).await;
                }
            }
            Message::Cancel(cancel) => {
                if let Some(handle) = active.remove(&envelope.request_id) {
                    debug!(
                        worker.id = %worker_id,
                        request.id = %envelope.request_id,
                        reason = %cancel.reason,
                        "aborting active task"
                    );
                    handle.abort();
                }
            }
            Message::Cleanup(_) => {
                // the local worker holds no resources beyond its active tasks
            }
            message if message.is_dispatch() || matches!(message, Message::Execute(_)) => {
                let runner = runner.clone();
                let tx = tx.clone();
                let request = envelope.clone();
                let wid = worker_id.clone();
                let request_id = envelope.request_id.clone();

                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let ctx = RunContext {
                        worker_id: wid,
                        request: request.clone(),
                        tx: tx.clone(),
                    };
                    let reply = match runner.run(&request.message, ctx).await {
                        Ok(outcome) => Message::TaskResult(TaskResult::final_value(
                            outcome.value,
                            ExecutionMetadata::new(
                                started.elapsed().as_secs_f64() * 1000.0,
                                outcome.memory_used,
                            ),
                        )),
                        Err(e) => Message::TaskError(TaskError::new(e.to_string())),
                    };
                    let reply_env = Envelope::reply_to(&request, reply);
                    if let Ok(frame) = WireFrame::encode(&reply_env) {
                        let _ = tx.send(frame).await;
                    }
                });
                active.insert(request_id, handle);
            }
            other => {
                debug!(
                    worker.id = %worker_id,
                    kind = %other.kind(),
                    "worker ignoring unexpected message"
                );
            }
        }
    }

    for (_, handle) in active.drain() {
        handle.abort();
    }
    debug!(worker.id = %worker_id, "worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use droverproto::Cancel;

    struct EchoRunner;

    #[async_trait]
    impl BundleRunner for EchoRunner {
        async fn run(&self, message: &Message, _ctx: RunContext) -> anyhow::Result<RunOutcome> {
            match message {
                Message::DispatchCode(dc) => Ok(RunOutcome {
                    value: serde_json::json!({ "echo": dc.code }),
                    memory_used: 64,
                }),
                _ => anyhow::bail!("unsupported payload"),
            }
        }
    }

    struct SlowRunner(Duration);

    #[async_trait]
    impl BundleRunner for SlowRunner {
        async fn run(&self, _message: &Message, _ctx: RunContext) -> anyhow::Result<RunOutcome> {
            tokio::time::sleep(self.0).await;
            Ok(serde_json::json!("done").into())
        }
    }

    fn dispatch_envelope(code: &str) -> Envelope {
        Envelope::new(
            Message::DispatchCode(droverproto::DispatchCode {
                code: code.to_string(),
                code_hash: "h".to_string(),
                context: serde_json::Value::Null,
                dependencies: vec![],
            }),
            TargetType::Worker,
            Priority::Normal,
            5_000,
        )
    }

    async fn connect(runner: Arc<dyn BundleRunner>) -> WorkerConnection {
        let id = WorkerId::new();
        let launcher = LocalLauncher::new(runner);
        let channels = launcher.launch(&id).await.unwrap();
        WorkerConnection::new(id, channels)
    }

    #[tokio::test]
    async fn request_reply_correlation() {
        let conn = connect(Arc::new(EchoRunner)).await;
        let env = dispatch_envelope("return 42");
        let rx = conn
            .begin_request(&env, None, Duration::from_secs(5))
            .unwrap();

        let output = rx.await.unwrap().unwrap();
        assert_eq!(output.value["echo"], "return 42");
        assert_eq!(output.metadata.memory_used, 64);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_answered_while_task_runs() {
        let conn = connect(Arc::new(SlowRunner(Duration::from_millis(300)))).await;
        let env = dispatch_envelope("slow");
        let rx = conn
            .begin_request(&env, None, Duration::from_secs(5))
            .unwrap();

        // worker is busy; heartbeat must still come back promptly
        let rtt = conn
            .heartbeat(1, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(rtt < Duration::from_millis(200));

        let output = rx.await.unwrap().unwrap();
        assert_eq!(output.value, serde_json::json!("done"));
    }

    #[tokio::test]
    async fn forgotten_request_drops_late_reply() {
        let conn = connect(Arc::new(SlowRunner(Duration::from_millis(50)))).await;
        let env = dispatch_envelope("slow");
        let rx = conn
            .begin_request(&env, None, Duration::from_secs(5))
            .unwrap();
        conn.forget(&env.request_id);

        // the slot is gone, so the oneshot is dropped and the eventual reply
        // is discarded as an orphan
        assert!(rx.await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.pending_count(), 0);

        // the worker is still usable afterwards
        let env2 = dispatch_envelope("again");
        let rx2 = conn
            .begin_request(&env2, None, Duration::from_secs(5))
            .unwrap();
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_aborts_active_task() {
        let conn = connect(Arc::new(SlowRunner(Duration::from_secs(10)))).await;
        let env = dispatch_envelope("forever");
        let rx = conn
            .begin_request(&env, None, Duration::from_millis(500))
            .unwrap();

        let cancel = Envelope::reply_to(
            &env,
            Message::Cancel(Cancel {
                reason: "test".to_string(),
            }),
        );
        conn.send(&cancel).unwrap();

        // the aborted task never replies; the slot expires via the sweep
        let result = tokio::time::timeout(Duration::from_secs(3), rx).await;
        match result {
            Ok(Ok(Err(_))) | Ok(Err(_)) => {}
            other => panic!("expected expiry, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn terminate_fails_pending_requests() {
        let conn = connect(Arc::new(SlowRunner(Duration::from_secs(10)))).await;
        let env = dispatch_envelope("forever");
        let rx = conn
            .begin_request(&env, None, Duration::from_secs(10))
            .unwrap();

        conn.terminate();
        match rx.await.unwrap() {
            Err(WorkerFailure::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(conn.is_closed());
    }
}
