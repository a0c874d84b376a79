//! Dispatch domain types shared by the queue, the pool, and the supervisor.

use std::time::Duration;

use droverproto::{ExecutionMetadata, Message, Priority, TargetType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bundle::Bundle;
use crate::router::RouteStrategy;

/// Unique identifier for a dispatch. Stable across retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchId(String);

impl DispatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DispatchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A request to run a bundle, tracked by the queue until terminal.
#[derive(Debug, Clone)]
pub struct DispatchSpec {
    pub id: DispatchId,
    pub bundle: Bundle,
    pub priority: Priority,
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Explicit routing preference, if the caller has one
    pub strategy: Option<RouteStrategy>,
}

/// Caller-facing knobs for a single dispatch. Unset fields fall back to the
/// queue defaults.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub priority: Option<Priority>,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub strategy: Option<RouteStrategy>,
}

impl DispatchOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: RouteStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// What a successful attempt yields.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub value: serde_json::Value,
    pub metadata: ExecutionMetadata,
}

/// The unit of work handed to the pool: one attempt of one dispatch.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub dispatch_id: DispatchId,
    pub message: Message,
    pub target_type: TargetType,
    pub priority: Priority,
    /// Per-attempt execution budget (the pool's task timeout, not the
    /// dispatch deadline)
    pub timeout: Duration,
}
