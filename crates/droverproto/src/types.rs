//! Shared enums and metadata types for the wire protocol.
//!
//! The pattern for metadata is typed known fields plus an `extra` escape
//! hatch for extensibility.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a dispatch is meant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    /// Dedicated isolated worker
    Worker,
    /// Long-lived worker shared between dispatches
    SharedWorker,
    /// WASM module instance
    WasmModule,
    /// Remote edge node
    RemoteEdge,
    /// GPU compute context
    GpuCompute,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Worker => "worker",
            TargetType::SharedWorker => "shared-worker",
            TargetType::WasmModule => "wasm-module",
            TargetType::RemoteEdge => "remote-edge",
            TargetType::GpuCompute => "gpu-compute",
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch priority. Serialized as its numeric level (0 = critical).
///
/// Ordering is by urgency: `Critical > High > Normal > Low`, so a max-heap
/// or `Iterator::max` picks the most urgent dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Numeric wire level: 0 critical, 1 high, 2 normal, 3 low.
    pub fn level(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Urgency rank, higher runs first.
    fn rank(&self) -> u8 {
        3 - self.level()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.level()
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Priority::Critical),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::Low),
            other => Err(format!("priority level out of range: {}", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution metadata attached to a result message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    /// Wall time spent executing, milliseconds
    #[serde(default)]
    pub execution_time: f64,

    /// Peak memory used, bytes
    #[serde(default)]
    pub memory_used: u64,

    /// Anything else the worker wants to report
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ExecutionMetadata {
    pub fn new(execution_time_ms: f64, memory_used_bytes: u64) -> Self {
        Self {
            execution_time: execution_time_ms,
            memory_used: memory_used_bytes,
            extra: HashMap::new(),
        }
    }
}

/// Out-of-band handle to a zero-copy transferable resource.
///
/// Handles are never part of the serialized message body; they ride next to
/// it in a [`crate::WireFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferHandle(pub u64);

impl std::fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn priority_orders_by_urgency() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);

        let mut all = vec![Priority::Low, Priority::Critical, Priority::Normal];
        all.sort();
        assert_eq!(
            all,
            vec![Priority::Low, Priority::Normal, Priority::Critical]
        );
    }

    #[test]
    fn priority_serializes_as_level() {
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "3");

        let p: Priority = serde_json::from_str("1").unwrap();
        assert_eq!(p, Priority::High);

        assert!(serde_json::from_str::<Priority>("7").is_err());
    }

    #[test]
    fn target_type_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TargetType::SharedWorker).unwrap(),
            "\"shared-worker\""
        );
        let t: TargetType = serde_json::from_str("\"gpu-compute\"").unwrap();
        assert_eq!(t, TargetType::GpuCompute);
    }

    #[test]
    fn metadata_extra_fields_flatten() {
        let mut meta = ExecutionMetadata::new(3.0, 1024);
        meta.extra
            .insert("gcCount".to_string(), serde_json::json!(2));

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["executionTime"], 3.0);
        assert_eq!(json["memoryUsed"], 1024);
        assert_eq!(json["gcCount"], 2);

        let parsed: ExecutionMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
    }
}
