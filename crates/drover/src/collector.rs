//! Multi-target result aggregation.
//!
//! A collector gathers results from a known number of producers under one
//! execution id. Each producer streams zero or more partials and exactly one
//! final; the collector completes when every expected target has sent its
//! final, merges per strategy, and computes aggregate metadata from the
//! finals. A companion pool routes incoming results to collectors by
//! execution id and retains completed merges under an LRU cap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use droverproto::ExecutionMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CollectorConfig;
use crate::metrics::CollectorPoolStats;

/// Identifier of one fan-out execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One message from a producer, partial or final.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub execution_id: ExecutionId,
    pub target_id: String,
    pub value: Value,
    pub metadata: ExecutionMetadata,
    pub is_final: bool,
}

impl TargetResult {
    pub fn final_result(
        execution_id: impl Into<ExecutionId>,
        target_id: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            target_id: target_id.into(),
            value,
            metadata: ExecutionMetadata::default(),
            is_final: true,
        }
    }

    pub fn partial(
        execution_id: impl Into<ExecutionId>,
        target_id: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            target_id: target_id.into(),
            value,
            metadata: ExecutionMetadata::default(),
            is_final: false,
        }
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Custom shallow-merge hook: `(accumulator, value, target_id) -> accumulator`.
pub type MergeFn = dyn Fn(Value, Value, &str) -> Value + Send + Sync;

/// Custom reducer over finals with an undefined initial accumulator.
pub type ReduceFn = dyn Fn(Option<Value>, Value, &str) -> Value + Send + Sync;

/// How finals become one merged value.
#[derive(Clone)]
pub enum MergeStrategy {
    /// Final payloads in completion order
    Array,
    /// Shallow merge of object finals; a custom merger overrides
    Object { merger: Option<Arc<MergeFn>> },
    /// Required reducer; the first final sees `None` as accumulator
    Reduce { reducer: Arc<ReduceFn> },
    /// Partials stream to subscribers; the final merge equals Array
    Stream,
}

impl MergeStrategy {
    pub fn object() -> Self {
        MergeStrategy::Object { merger: None }
    }

    pub fn object_with(merger: impl Fn(Value, Value, &str) -> Value + Send + Sync + 'static) -> Self {
        MergeStrategy::Object {
            merger: Some(Arc::new(merger)),
        }
    }

    pub fn reduce(reducer: impl Fn(Option<Value>, Value, &str) -> Value + Send + Sync + 'static) -> Self {
        MergeStrategy::Reduce {
            reducer: Arc::new(reducer),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            MergeStrategy::Array => "array",
            MergeStrategy::Object { .. } => "object",
            MergeStrategy::Reduce { .. } => "reduce",
            MergeStrategy::Stream => "stream",
        }
    }
}

impl std::fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MergeStrategy::{}", self.name())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CollectorError {
    #[error("wrong execution id: expected {expected}, got {got}")]
    WrongExecution { expected: String, got: String },

    #[error("collector is already terminal")]
    AlreadyTerminal,

    #[error("collection timed out with {}/{expected} targets", completed.len())]
    Timeout {
        completed: Vec<String>,
        expected: usize,
    },

    #[error("collection cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("unknown execution id: {0}")]
    UnknownExecution(String),

    #[error("execution id already collecting: {0}")]
    DuplicateExecution(String),

    #[error("expected target count must be at least 1")]
    NoTargets,
}

/// What happened to one ingested result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// A second final from the same target; ignored
    DuplicateFinalIgnored,
    /// This final completed the collection
    Completed,
}

/// Aggregate metadata computed from finals only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetadata {
    pub total_execution_ms: f64,
    pub avg_execution_ms: f64,
    pub total_memory_bytes: u64,
    pub avg_memory_bytes: u64,
}

/// The merged outcome of a completed collection.
#[derive(Debug, Clone)]
pub struct MergedResult {
    pub execution_id: ExecutionId,
    pub value: Value,
    /// Target ids in completion order
    pub completed_targets: Vec<String>,
    pub aggregate: AggregateMetadata,
    pub elapsed: Duration,
}

/// Events observable by collector subscribers.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// A partial arrived (stream strategy feeds on these)
    Partial { target_id: String, value: Value },
    /// A target delivered its final
    TargetCompleted {
        target_id: String,
        completed: usize,
        expected: usize,
    },
    Complete(MergedResult),
    TimedOut { completed_targets: Vec<String> },
    Cancelled { reason: String },
}

struct Inner {
    partials: HashMap<String, Vec<Value>>,
    finals: Vec<TargetResult>,
    completed: HashSet<String>,
    terminal: Option<Result<MergedResult, CollectorError>>,
}

/// Aggregates fan-out replies for one execution id.
pub struct ResultCollector {
    execution_id: ExecutionId,
    expected: usize,
    strategy: MergeStrategy,
    timeout: Duration,
    started: Instant,
    inner: StdMutex<Inner>,
    events: broadcast::Sender<CollectorEvent>,
    done_tx: watch::Sender<Option<Result<MergedResult, CollectorError>>>,
}

impl ResultCollector {
    pub fn new(
        execution_id: ExecutionId,
        expected: usize,
        strategy: MergeStrategy,
        timeout: Duration,
    ) -> Result<Arc<Self>, CollectorError> {
        if expected == 0 {
            return Err(CollectorError::NoTargets);
        }
        let (events, _) = broadcast::channel(64);
        let (done_tx, _) = watch::channel(None);
        let collector = Arc::new(Self {
            execution_id,
            expected,
            strategy,
            timeout,
            started: Instant::now(),
            inner: StdMutex::new(Inner {
                partials: HashMap::new(),
                finals: Vec::new(),
                completed: HashSet::new(),
                terminal: None,
            }),
            events,
            done_tx,
        });

        let watchdog = collector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(watchdog.timeout).await;
            watchdog.fire_timeout();
        });

        Ok(collector)
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn expected_targets(&self) -> usize {
        self.expected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.events.subscribe()
    }

    /// Feed one producer message in. Partials accumulate per target; the
    /// final from each distinct target counts toward completion. Duplicate
    /// finals are ignored, wrong execution ids and post-terminal calls are
    /// errors.
    pub fn ingest(&self, result: TargetResult) -> Result<IngestOutcome, CollectorError> {
        if result.execution_id != self.execution_id {
            return Err(CollectorError::WrongExecution {
                expected: self.execution_id.to_string(),
                got: result.execution_id.to_string(),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.terminal.is_some() {
            return Err(CollectorError::AlreadyTerminal);
        }

        if !result.is_final {
            inner
                .partials
                .entry(result.target_id.clone())
                .or_default()
                .push(result.value.clone());
            drop(inner);
            let _ = self.events.send(CollectorEvent::Partial {
                target_id: result.target_id,
                value: result.value,
            });
            return Ok(IngestOutcome::Accepted);
        }

        if inner.completed.contains(&result.target_id) {
            debug!(
                execution.id = %self.execution_id,
                target.id = %result.target_id,
                "ignoring duplicate final"
            );
            return Ok(IngestOutcome::DuplicateFinalIgnored);
        }

        inner.completed.insert(result.target_id.clone());
        let target_id = result.target_id.clone();
        inner.finals.push(result);
        let completed = inner.completed.len();

        if completed < self.expected {
            drop(inner);
            let _ = self.events.send(CollectorEvent::TargetCompleted {
                target_id,
                completed,
                expected: self.expected,
            });
            return Ok(IngestOutcome::Accepted);
        }

        // final target arrived; merge and go terminal
        let merged = MergedResult {
            execution_id: self.execution_id.clone(),
            value: merge(&self.strategy, &inner.finals),
            completed_targets: inner.finals.iter().map(|f| f.target_id.clone()).collect(),
            aggregate: aggregate(&inner.finals),
            elapsed: self.started.elapsed(),
        };
        inner.terminal = Some(Ok(merged.clone()));
        drop(inner);

        info!(
            execution.id = %self.execution_id,
            targets = self.expected,
            elapsed_ms = merged.elapsed.as_millis() as u64,
            "collection complete"
        );
        let _ = self.events.send(CollectorEvent::Complete(merged.clone()));
        let _ = self.done_tx.send(Some(Ok(merged)));
        Ok(IngestOutcome::Completed)
    }

    /// Resolve once the collector is terminal: completed, timed out, or
    /// cancelled.
    pub async fn wait(&self) -> Result<MergedResult, CollectorError> {
        let mut rx = self.done_tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(CollectorError::Cancelled {
                    reason: "collector dropped".to_string(),
                });
            }
        }
    }

    /// Abort the collection. Subscribers are notified; further results are
    /// rejected.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal.is_some() {
            return;
        }
        let err = CollectorError::Cancelled {
            reason: reason.clone(),
        };
        inner.terminal = Some(Err(err.clone()));
        drop(inner);

        info!(execution.id = %self.execution_id, reason = %reason, "collection cancelled");
        let _ = self.events.send(CollectorEvent::Cancelled { reason });
        let _ = self.done_tx.send(Some(Err(err)));
    }

    /// Completed target count so far.
    pub fn completed_count(&self) -> usize {
        self.inner.lock().unwrap().completed.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.lock().unwrap().terminal.is_some()
    }

    fn fire_timeout(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal.is_some() {
            return;
        }
        let completed: Vec<String> = inner
            .finals
            .iter()
            .map(|f| f.target_id.clone())
            .collect();
        let err = CollectorError::Timeout {
            completed: completed.clone(),
            expected: self.expected,
        };
        inner.terminal = Some(Err(err.clone()));
        drop(inner);

        warn!(
            execution.id = %self.execution_id,
            completed = completed.len(),
            expected = self.expected,
            "collection timed out"
        );
        let _ = self.events.send(CollectorEvent::TimedOut {
            completed_targets: completed,
        });
        let _ = self.done_tx.send(Some(Err(err)));
    }
}

fn merge(strategy: &MergeStrategy, finals: &[TargetResult]) -> Value {
    match strategy {
        MergeStrategy::Array | MergeStrategy::Stream => {
            Value::Array(finals.iter().map(|f| f.value.clone()).collect())
        }
        MergeStrategy::Object { merger: None } => {
            let mut acc = serde_json::Map::new();
            for f in finals {
                match &f.value {
                    Value::Object(map) => acc.extend(map.clone()),
                    other => {
                        // a non-object final lands under its target id
                        acc.insert(f.target_id.clone(), other.clone());
                    }
                }
            }
            Value::Object(acc)
        }
        MergeStrategy::Object {
            merger: Some(merger),
        } => {
            let mut acc = Value::Object(serde_json::Map::new());
            for f in finals {
                acc = merger(acc, f.value.clone(), &f.target_id);
            }
            acc
        }
        MergeStrategy::Reduce { reducer } => {
            let mut acc: Option<Value> = None;
            for f in finals {
                acc = Some(reducer(acc, f.value.clone(), &f.target_id));
            }
            acc.unwrap_or(Value::Null)
        }
    }
}

fn aggregate(finals: &[TargetResult]) -> AggregateMetadata {
    if finals.is_empty() {
        return AggregateMetadata::default();
    }
    let n = finals.len() as f64;
    let total_execution_ms: f64 = finals.iter().map(|f| f.metadata.execution_time).sum();
    let total_memory_bytes: u64 = finals.iter().map(|f| f.metadata.memory_used).sum();
    AggregateMetadata {
        total_execution_ms,
        avg_execution_ms: total_execution_ms / n,
        total_memory_bytes,
        avg_memory_bytes: total_memory_bytes / finals.len() as u64,
    }
}

struct Retained {
    map: HashMap<ExecutionId, MergedResult>,
    order: VecDeque<ExecutionId>,
}

/// Creates collectors, routes producer results to them by execution id, and
/// retains completed merges under an LRU cap.
pub struct CollectorPool {
    config: CollectorConfig,
    active: StdMutex<HashMap<ExecutionId, Arc<ResultCollector>>>,
    retained: StdMutex<Retained>,
    completed_total: AtomicU64,
    timed_out_total: AtomicU64,
    cancelled_total: AtomicU64,
}

impl CollectorPool {
    pub fn new(config: CollectorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            active: StdMutex::new(HashMap::new()),
            retained: StdMutex::new(Retained {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            completed_total: AtomicU64::new(0),
            timed_out_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
        })
    }

    /// Create a collector; creation is exclusive per execution id.
    pub fn create(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        expected: usize,
        strategy: MergeStrategy,
        timeout: Duration,
    ) -> Result<Arc<ResultCollector>, CollectorError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(&execution_id) {
            return Err(CollectorError::DuplicateExecution(execution_id.to_string()));
        }
        let collector = ResultCollector::new(execution_id.clone(), expected, strategy, timeout)?;
        active.insert(execution_id.clone(), collector.clone());
        drop(active);

        // retire the collector when it goes terminal
        let pool = self.clone();
        let watched = collector.clone();
        tokio::spawn(async move {
            let outcome = watched.wait().await;
            pool.retire(&execution_id, outcome);
        });

        Ok(collector)
    }

    /// Route one producer result to its collector.
    pub fn route(&self, result: TargetResult) -> Result<IngestOutcome, CollectorError> {
        let collector = {
            let active = self.active.lock().unwrap();
            active
                .get(&result.execution_id)
                .cloned()
                .ok_or_else(|| CollectorError::UnknownExecution(result.execution_id.to_string()))?
        };
        collector.ingest(result)
    }

    pub fn get(&self, execution_id: &ExecutionId) -> Option<Arc<ResultCollector>> {
        self.active.lock().unwrap().get(execution_id).cloned()
    }

    /// Completed merged result, if still retained. Touches LRU order.
    pub fn completed(&self, execution_id: &ExecutionId) -> Option<MergedResult> {
        let mut retained = self.retained.lock().unwrap();
        let result = retained.map.get(execution_id).cloned()?;
        retained.order.retain(|id| id != execution_id);
        retained.order.push_back(execution_id.clone());
        Some(result)
    }

    pub fn cancel(&self, execution_id: &ExecutionId, reason: impl Into<String>) -> bool {
        match self.get(execution_id) {
            Some(collector) => {
                collector.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> CollectorPoolStats {
        CollectorPoolStats {
            active: self.active.lock().unwrap().len(),
            retained: self.retained.lock().unwrap().map.len(),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            timed_out_total: self.timed_out_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
        }
    }

    fn retire(&self, execution_id: &ExecutionId, outcome: Result<MergedResult, CollectorError>) {
        self.active.lock().unwrap().remove(execution_id);
        match outcome {
            Ok(merged) => {
                self.completed_total.fetch_add(1, Ordering::Relaxed);
                let mut retained = self.retained.lock().unwrap();
                retained.map.insert(execution_id.clone(), merged);
                retained.order.push_back(execution_id.clone());
                while retained.order.len() > self.config.max_retained_results {
                    if let Some(evicted) = retained.order.pop_front() {
                        retained.map.remove(&evicted);
                        debug!(execution.id = %evicted, "evicted retained result");
                    }
                }
            }
            Err(CollectorError::Timeout { .. }) => {
                self.timed_out_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(CollectorError::Cancelled { .. }) => {
                self.cancelled_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}
