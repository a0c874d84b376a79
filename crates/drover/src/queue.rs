//! Priority + readiness ordered dispatch queue with bounded concurrency.
//!
//! The queue is an actor: callers talk to it over a command channel and the
//! scheduler task owns all state, which is what enforces at-most-one
//! in-flight attempt per dispatch. Wakeups come from commands, attempt
//! completions, and a timer armed for the earliest next-ready or deadline
//! instant.
//!
//! Failed attempts re-enter the queue after exponential (or linear or
//! constant) backoff with symmetric jitter; the jitter exists solely to
//! spread thundering herds.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, QueueConfig};
use crate::dispatch::{DispatchId, DispatchSpec, TaskOutput};
use crate::error::DispatchError;
use crate::metrics::QueueMetrics;

/// Queue occupancy at the moment an attempt starts; handed to the executor
/// so routing can see the load it is part of.
#[derive(Debug, Clone, Copy)]
pub struct QueueLoad {
    pub queued: usize,
    pub in_flight: usize,
}

/// Runs one attempt of one dispatch. The supervisor's implementation routes
/// the bundle and executes it on the chosen lane.
#[async_trait]
pub trait DispatchExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &DispatchSpec,
        attempt: u32,
        load: QueueLoad,
    ) -> Result<TaskOutput, DispatchError>;
}

/// Caller's future for a dispatch. Resolves with the final outcome:
/// success, terminal failure, cancellation, or deadline.
#[derive(Debug)]
pub struct DispatchHandle {
    id: DispatchId,
    rx: oneshot::Receiver<Result<TaskOutput, DispatchError>>,
}

impl DispatchHandle {
    pub fn id(&self) -> &DispatchId {
        &self.id
    }

    pub async fn wait(self) -> Result<TaskOutput, DispatchError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::shutdown("queue dropped the dispatch")),
        }
    }
}

enum QueueCommand {
    Enqueue {
        spec: DispatchSpec,
        reply: oneshot::Sender<Result<TaskOutput, DispatchError>>,
    },
    Cancel {
        id: DispatchId,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Clear {
        reason: String,
    },
    AttemptFinished {
        id: DispatchId,
        attempt: u32,
        outcome: Result<TaskOutput, DispatchError>,
    },
    Metrics {
        reply: oneshot::Sender<QueueMetrics>,
    },
    Shutdown {
        reason: String,
    },
}

/// Handle to the scheduler actor.
pub struct DispatchQueue {
    cmd_tx: mpsc::Sender<QueueCommand>,
}

impl DispatchQueue {
    pub fn start(
        config: QueueConfig,
        backoff: BackoffConfig,
        executor: Arc<dyn DispatchExecutor>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let scheduler = Scheduler {
            config,
            backoff,
            executor,
            cmd_tx: cmd_tx.clone(),
            entries: HashMap::new(),
            in_flight: 0,
            counters: Counters::default(),
            latencies: VecDeque::new(),
        };
        tokio::spawn(scheduler.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Admit a dispatch. Malformed specs are rejected synchronously and
    /// never retried. The returned handle resolves with the final outcome.
    pub async fn enqueue(&self, spec: DispatchSpec) -> Result<DispatchHandle, DispatchError> {
        if spec.max_attempts == 0 {
            return Err(DispatchError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if spec.timeout.is_zero() {
            return Err(DispatchError::Validation(
                "dispatch timeout must be positive".to_string(),
            ));
        }

        let id = spec.id.clone();
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(QueueCommand::Enqueue { spec, reply })
            .await
            .map_err(|_| DispatchError::shutdown("queue stopped"))?;
        Ok(DispatchHandle { id, rx })
    }

    /// Remove a dispatch. A queued dispatch is rejected immediately; an
    /// in-flight one has its future rejected and its eventual result
    /// discarded. Returns whether the dispatch existed.
    pub async fn cancel(&self, id: &DispatchId, reason: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(QueueCommand::Cancel {
                id: id.clone(),
                reason: reason.into(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Reject every queued (not in-flight) dispatch with `reason`.
    pub async fn clear(&self, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(QueueCommand::Clear {
                reason: reason.into(),
            })
            .await;
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(QueueCommand::Metrics { reply })
            .await
            .is_err()
        {
            return QueueMetrics::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Reject everything, queued and in flight, and stop the scheduler.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(QueueCommand::Shutdown {
                reason: reason.into(),
            })
            .await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Backoff,
    InFlight,
}

struct Entry {
    spec: DispatchSpec,
    phase: Phase,
    /// Attempts started so far
    attempts: u32,
    created_at: Instant,
    deadline: Instant,
    next_ready: Instant,
    last_error: Option<DispatchError>,
    reply: Option<oneshot::Sender<Result<TaskOutput, DispatchError>>>,
}

impl Entry {
    fn resolve(&mut self, outcome: Result<TaskOutput, DispatchError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    timed_out: u64,
    cancelled: u64,
}

struct Scheduler {
    config: QueueConfig,
    backoff: BackoffConfig,
    executor: Arc<dyn DispatchExecutor>,
    cmd_tx: mpsc::Sender<QueueCommand>,
    entries: HashMap<DispatchId, Entry>,
    in_flight: usize,
    counters: Counters,
    latencies: VecDeque<f64>,
}

impl Scheduler {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<QueueCommand>) {
        loop {
            self.pump();

            let cmd = match self.next_wake() {
                Some(at) => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(cmd) => Some(cmd),
                            None => break,
                        },
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => None,
                    }
                }
                None => match cmd_rx.recv().await {
                    Some(cmd) => Some(cmd),
                    None => break,
                },
            };

            if let Some(cmd) = cmd {
                match cmd {
                    QueueCommand::Enqueue { spec, reply } => self.on_enqueue(spec, reply),
                    QueueCommand::Cancel { id, reason, reply } => {
                        let existed = self.on_cancel(&id, &reason);
                        let _ = reply.send(existed);
                    }
                    QueueCommand::Clear { reason } => self.on_clear(&reason),
                    QueueCommand::AttemptFinished {
                        id,
                        attempt,
                        outcome,
                    } => self.on_attempt_finished(&id, attempt, outcome),
                    QueueCommand::Metrics { reply } => {
                        let _ = reply.send(self.metrics());
                    }
                    QueueCommand::Shutdown { reason } => {
                        self.reject_all(&reason);
                        info!(reason = %reason, "dispatch queue shut down");
                        return;
                    }
                }
            }
        }
        // every caller handle went away
        self.reject_all("queue stopped");
    }

    /// Earliest instant anything changes without a command: a backoff
    /// becoming ready or a deadline expiring.
    fn next_wake(&self) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        let mut consider = |at: Instant| {
            wake = Some(match wake {
                Some(current) => current.min(at),
                None => at,
            });
        };
        for entry in self.entries.values() {
            consider(entry.deadline);
            if entry.phase == Phase::Backoff {
                consider(entry.next_ready);
            }
        }
        wake
    }

    /// One scheduling tick: expire deadlines, promote ready backoffs, start
    /// attempts up to the concurrency cap.
    fn pump(&mut self) {
        let now = Instant::now();

        let expired: Vec<DispatchId> = self
            .entries
            .iter()
            .filter(|(_, e)| now >= e.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(mut entry) = self.entries.remove(&id) {
                if entry.phase == Phase::InFlight {
                    self.in_flight -= 1;
                }
                self.counters.timed_out += 1;
                let elapsed_ms = entry.created_at.elapsed().as_millis() as u64;
                warn!(dispatch.id = %id, elapsed_ms, "dispatch deadline exceeded");
                entry.resolve(Err(DispatchError::Deadline { elapsed_ms }));
            }
        }

        for entry in self.entries.values_mut() {
            if entry.phase == Phase::Backoff && now >= entry.next_ready {
                entry.phase = Phase::Ready;
            }
        }

        while self.in_flight < self.config.max_concurrent {
            let next = self
                .entries
                .values()
                .filter(|e| e.phase == Phase::Ready)
                .max_by_key(|e| (e.spec.priority, std::cmp::Reverse(e.created_at)))
                .map(|e| e.spec.id.clone());
            match next {
                Some(id) => self.start_attempt(&id),
                None => break,
            }
        }
    }

    fn on_enqueue(
        &mut self,
        spec: DispatchSpec,
        reply: oneshot::Sender<Result<TaskOutput, DispatchError>>,
    ) {
        if self.entries.contains_key(&spec.id) {
            let _ = reply.send(Err(DispatchError::Validation(format!(
                "dispatch id already queued: {}",
                spec.id
            ))));
            return;
        }
        let now = Instant::now();
        let deadline = now + spec.timeout;
        debug!(
            dispatch.id = %spec.id,
            priority = %spec.priority,
            max_attempts = spec.max_attempts,
            "dispatch enqueued"
        );
        self.counters.enqueued += 1;
        self.entries.insert(
            spec.id.clone(),
            Entry {
                spec,
                phase: Phase::Ready,
                attempts: 0,
                created_at: now,
                deadline,
                next_ready: now,
                last_error: None,
                reply: Some(reply),
            },
        );
    }

    fn start_attempt(&mut self, id: &DispatchId) {
        let queued = self
            .entries
            .values()
            .filter(|e| e.phase != Phase::InFlight)
            .count()
            .saturating_sub(1);

        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.attempts += 1;
        entry.phase = Phase::InFlight;
        self.in_flight += 1;

        let attempt = entry.attempts;
        let spec = entry.spec.clone();
        let load = QueueLoad {
            queued,
            in_flight: self.in_flight,
        };
        debug!(
            dispatch.id = %id,
            attempt,
            of = spec.max_attempts,
            "starting attempt"
        );

        let executor = self.executor.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(&spec, attempt, load).await;
            let _ = cmd_tx
                .send(QueueCommand::AttemptFinished {
                    id: spec.id.clone(),
                    attempt,
                    outcome,
                })
                .await;
        });
    }

    fn on_attempt_finished(
        &mut self,
        id: &DispatchId,
        attempt: u32,
        outcome: Result<TaskOutput, DispatchError>,
    ) {
        let Some(entry) = self.entries.get_mut(id) else {
            // cancelled or timed out while in flight; the late result is
            // dropped here
            debug!(dispatch.id = %id, attempt, "discarding result for finished dispatch");
            return;
        };
        if entry.phase != Phase::InFlight || entry.attempts != attempt {
            debug!(dispatch.id = %id, attempt, "discarding stale attempt result");
            return;
        }
        self.in_flight -= 1;

        match outcome {
            Ok(output) => {
                let latency_ms = entry.created_at.elapsed().as_secs_f64() * 1000.0;
                self.latencies.push_back(latency_ms);
                while self.latencies.len() > self.config.latency_window {
                    self.latencies.pop_front();
                }
                self.counters.succeeded += 1;
                debug!(dispatch.id = %id, attempt, latency_ms, "dispatch succeeded");
                let mut entry = self.entries.remove(id).unwrap();
                entry.resolve(Ok(output));
            }
            Err(err) if err.is_retryable() && entry.attempts < entry.spec.max_attempts => {
                let unit = rand::thread_rng().gen_range(-1.0..=1.0);
                let delay = self.backoff.jittered_delay(entry.attempts, unit);
                entry.next_ready = Instant::now() + delay;
                entry.phase = Phase::Backoff;
                entry.last_error = Some(err.clone());
                self.counters.retried += 1;
                debug!(
                    dispatch.id = %id,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; backing off"
                );
            }
            Err(err) => {
                self.counters.failed += 1;
                let final_err = if err.is_retryable() {
                    // retryable but the ceiling is reached
                    DispatchError::Exhausted {
                        attempts: entry.attempts,
                        last_error: err.to_string(),
                    }
                } else {
                    err
                };
                warn!(dispatch.id = %id, attempt, error = %final_err, "dispatch failed");
                let mut entry = self.entries.remove(id).unwrap();
                entry.resolve(Err(final_err));
            }
        }
    }

    fn on_cancel(&mut self, id: &DispatchId, reason: &str) -> bool {
        match self.entries.remove(id) {
            Some(mut entry) => {
                if entry.phase == Phase::InFlight {
                    self.in_flight -= 1;
                }
                self.counters.cancelled += 1;
                info!(dispatch.id = %id, reason, "dispatch cancelled");
                entry.resolve(Err(DispatchError::cancelled(reason)));
                true
            }
            None => false,
        }
    }

    fn on_clear(&mut self, reason: &str) {
        let queued: Vec<DispatchId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.phase != Phase::InFlight)
            .map(|(id, _)| id.clone())
            .collect();
        info!(count = queued.len(), reason, "clearing queued dispatches");
        for id in queued {
            if let Some(mut entry) = self.entries.remove(&id) {
                self.counters.cancelled += 1;
                entry.resolve(Err(DispatchError::cancelled(reason)));
            }
        }
    }

    fn reject_all(&mut self, reason: &str) {
        for (_, mut entry) in self.entries.drain() {
            entry.resolve(Err(DispatchError::shutdown(reason)));
        }
        self.in_flight = 0;
    }

    fn metrics(&self) -> QueueMetrics {
        let avg_latency_ms = if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
        };
        QueueMetrics {
            enqueued: self.counters.enqueued,
            succeeded: self.counters.succeeded,
            failed: self.counters.failed,
            retried: self.counters.retried,
            timed_out: self.counters.timed_out,
            cancelled: self.counters.cancelled,
            in_flight: self.in_flight,
            queued: self
                .entries
                .values()
                .filter(|e| e.phase != Phase::InFlight)
                .count(),
            avg_latency_ms,
        }
    }
}
