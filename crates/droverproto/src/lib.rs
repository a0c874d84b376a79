//! droverproto - Wire protocol for the Drover dispatch supervisor
//!
//! This crate defines the messages exchanged between the supervisor and its
//! workers. Every message travels inside an [`Envelope`] carrying routing and
//! correlation metadata; the payload is discriminated by the envelope's
//! `type` field.
//!
//! Serialization is JSON via serde. Zero-copy transfer handles are carried
//! out-of-band next to the serialized body (see [`WireFrame`]) and are never
//! part of the body itself.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;
use uuid::Uuid;

pub mod error;
pub mod frame;
pub mod types;

pub use error::ProtocolError;
pub use frame::WireFrame;
pub use types::{ExecutionMetadata, Priority, TargetType, TransferHandle};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Milliseconds on the process-local monotonic clock.
///
/// Used to stamp outgoing envelopes. The zero point is the first call in
/// this process, so timestamps are comparable within a process only.
pub fn monotonic_ms() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64() * 1000.0
}

/// Envelope wraps every message with correlation and routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Protocol version, e.g. "1.0"
    pub version: String,

    /// The message, discriminated by `type` with its `payload` alongside
    #[serde(flatten)]
    pub message: Message,

    /// Unique per logical request; replies echo it
    pub request_id: String,

    /// Intended execution target class
    pub target_type: TargetType,

    /// Dispatch priority
    pub priority: Priority,

    /// Monotonic milliseconds at the sender
    pub timestamp: f64,

    /// Deadline in milliseconds relative to `timestamp`
    pub timeout: u64,

    /// Zero-copy handles, carried out-of-band (never serialized in the body)
    #[serde(skip)]
    pub transfer: Vec<TransferHandle>,
}

impl Envelope {
    /// Create an envelope for a fresh request with a generated id.
    pub fn new(message: Message, target_type: TargetType, priority: Priority, timeout_ms: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            message,
            request_id: Uuid::new_v4().to_string(),
            target_type,
            priority,
            timestamp: monotonic_ms(),
            timeout: timeout_ms,
            transfer: Vec::new(),
        }
    }

    /// Create a reply to `request`, echoing its correlation metadata.
    pub fn reply_to(request: &Envelope, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            message,
            request_id: request.request_id.clone(),
            target_type: request.target_type,
            priority: request.priority,
            timestamp: monotonic_ms(),
            timeout: request.timeout,
            transfer: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_transfer(mut self, handles: Vec<TransferHandle>) -> Self {
        self.transfer = handles;
        self
    }

    /// Validate the envelope against the wire rules.
    ///
    /// Enum-typed fields are already enforced by deserialization; this checks
    /// the value-level rules: supported version, non-empty requestId, finite
    /// timestamp, positive timeout.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let major = self.version.split('.').next().unwrap_or("");
        if major != "1" {
            return Err(ProtocolError::UnsupportedVersion(self.version.clone()));
        }
        if self.request_id.is_empty() {
            return Err(ProtocolError::EmptyRequestId);
        }
        if !self.timestamp.is_finite() {
            return Err(ProtocolError::InvalidTimestamp(self.timestamp));
        }
        if self.timeout == 0 {
            return Err(ProtocolError::NonPositiveTimeout(self.timeout));
        }
        Ok(())
    }

    /// Message kind, for handler routing.
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

/// All message types in the protocol. Discriminated by `type`, with the
/// type-specific body under `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Dispatch source code for execution
    #[serde(rename = "dispatch:code")]
    DispatchCode(DispatchCode),

    /// Dispatch a WASM binary
    #[serde(rename = "dispatch:wasm")]
    DispatchWasm(DispatchWasm),

    /// Dispatch a multi-module bundle
    #[serde(rename = "dispatch:bundle")]
    DispatchBundle(DispatchBundle),

    /// Invoke the previously dispatched code with arguments
    #[serde(rename = "execute")]
    Execute(Execute),

    /// Final or partial result of a dispatch
    #[serde(rename = "result")]
    TaskResult(TaskResult),

    /// Progress report while a dispatch runs
    #[serde(rename = "progress")]
    Progress(Progress),

    /// Execution failed
    #[serde(rename = "error")]
    TaskError(TaskError),

    /// Dispatch completed, with a summary
    #[serde(rename = "complete")]
    Complete(Complete),

    /// Abort the referenced request
    #[serde(rename = "cancel")]
    Cancel(Cancel),

    /// Release named resources
    #[serde(rename = "cleanup")]
    Cleanup(Cleanup),

    /// Liveness probe
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),

    /// Liveness probe reply
    #[serde(rename = "heartbeat-response")]
    HeartbeatResponse(Heartbeat),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::DispatchCode(_) => MessageKind::DispatchCode,
            Message::DispatchWasm(_) => MessageKind::DispatchWasm,
            Message::DispatchBundle(_) => MessageKind::DispatchBundle,
            Message::Execute(_) => MessageKind::Execute,
            Message::TaskResult(_) => MessageKind::TaskResult,
            Message::Progress(_) => MessageKind::Progress,
            Message::TaskError(_) => MessageKind::TaskError,
            Message::Complete(_) => MessageKind::Complete,
            Message::Cancel(_) => MessageKind::Cancel,
            Message::Cleanup(_) => MessageKind::Cleanup,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::HeartbeatResponse(_) => MessageKind::HeartbeatResponse,
        }
    }

    /// True for any of the dispatch:* variants.
    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            Message::DispatchCode(_) | Message::DispatchWasm(_) | Message::DispatchBundle(_)
        )
    }

    /// True for message types a worker sends back about a request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Message::TaskResult(_)
                | Message::Progress(_)
                | Message::TaskError(_)
                | Message::Complete(_)
                | Message::HeartbeatResponse(_)
        )
    }
}

/// Message discriminant, used as the key in handler maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DispatchCode,
    DispatchWasm,
    DispatchBundle,
    Execute,
    TaskResult,
    Progress,
    TaskError,
    Complete,
    Cancel,
    Cleanup,
    Heartbeat,
    HeartbeatResponse,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::DispatchCode => "dispatch:code",
            MessageKind::DispatchWasm => "dispatch:wasm",
            MessageKind::DispatchBundle => "dispatch:bundle",
            MessageKind::Execute => "execute",
            MessageKind::TaskResult => "result",
            MessageKind::Progress => "progress",
            MessageKind::TaskError => "error",
            MessageKind::Complete => "complete",
            MessageKind::Cancel => "cancel",
            MessageKind::Cleanup => "cleanup",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::HeartbeatResponse => "heartbeat-response",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source code dispatch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCode {
    pub code: String,
    /// Content hash of `code`, used as the routing fingerprint
    pub code_hash: String,
    /// Opaque execution context handed to the sandbox
    pub context: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// WASM module dispatch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchWasm {
    #[serde(with = "base64_bytes")]
    pub binary: Vec<u8>,
    pub hash: String,
    pub entry_point: String,
    #[serde(default)]
    pub imports: Vec<String>,
    pub memory: WasmMemory,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Linear memory limits for a WASM dispatch, in 64KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmMemory {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// Multi-module bundle dispatch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchBundle {
    pub manifest: BundleManifest,
    pub modules: Vec<BundleModule>,
    pub entry_point: String,
    pub context: serde_json::Value,
}

/// Declared bundle characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub name: String,
    pub version: String,
    /// Priority declared by the bundle author, if any
    pub priority: Option<Priority>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default)]
    pub requires_shared_memory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleModule {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub binary: Vec<u8>,
}

/// Invoke arguments for previously dispatched code.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Execute {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Result payload. `is_final` distinguishes the single final result of a
/// target from streamed partials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub value: serde_json::Value,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
    #[serde(default = "default_true")]
    pub is_final: bool,
}

fn default_true() -> bool {
    true
}

impl TaskResult {
    pub fn final_value(value: serde_json::Value, metadata: ExecutionMetadata) -> Self {
        Self {
            value,
            metadata,
            is_final: true,
        }
    }

    pub fn partial(value: serde_json::Value) -> Self {
        Self {
            value,
            metadata: ExecutionMetadata::default(),
            is_final: false,
        }
    }
}

/// Progress report, `progress` in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub progress: f64,
    pub status: String,
}

/// Execution error payload. `stack` and `name` are optional so a bare
/// `{message}` form is also valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complete {
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cleanup {
    pub resources: Vec<String>,
}

/// Heartbeat probe and reply share one shape. Ids are strictly monotonic per
/// worker; a reply echoes the probe's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub heartbeat_id: u64,
    pub timestamp: f64,
    pub worker_id: String,
}

/// Base64 encoding for binary fields in JSON bodies.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_dispatch() -> Envelope {
        Envelope::new(
            Message::DispatchCode(DispatchCode {
                code: "return 40 + 2".to_string(),
                code_hash: "abc123".to_string(),
                context: serde_json::json!({"invocation": 1}),
                dependencies: vec!["left-pad".to_string()],
            }),
            TargetType::Worker,
            Priority::Normal,
            5_000,
        )
    }

    #[test]
    fn envelope_roundtrip() {
        let env = sample_dispatch();
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, parsed);
    }

    #[test]
    fn envelope_wire_shape_matches_table() {
        let env = sample_dispatch();
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["version"], "1.0");
        assert_eq!(value["type"], "dispatch:code");
        assert_eq!(value["targetType"], "worker");
        assert_eq!(value["priority"], 2);
        assert!(value["payload"].is_object());
        assert!(value["requestId"].is_string());
        assert!(value["timestamp"].is_number());
        assert_eq!(value["timeout"], 5_000);
        // transfer handles are out-of-band, never in the body
        assert!(value.get("transfer").is_none());
    }

    #[test]
    fn reply_echoes_request_id() {
        let req = sample_dispatch();
        let reply = Envelope::reply_to(
            &req,
            Message::TaskResult(TaskResult::final_value(
                serde_json::json!(42),
                ExecutionMetadata::new(3.0, 1024),
            )),
        );
        assert_eq!(reply.request_id, req.request_id);
        assert_eq!(reply.priority, req.priority);
        assert!(reply.message.is_reply());
    }

    #[test]
    fn wasm_binary_rides_as_base64() {
        let env = Envelope::new(
            Message::DispatchWasm(DispatchWasm {
                binary: vec![0x00, 0x61, 0x73, 0x6d], // \0asm
                hash: "deadbeef".to_string(),
                entry_point: "main".to_string(),
                imports: vec![],
                memory: WasmMemory {
                    initial: 16,
                    maximum: Some(256),
                },
                args: vec![serde_json::json!(7)],
            }),
            TargetType::WasmModule,
            Priority::High,
            10_000,
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("AGFzbQ==")); // base64 of \0asm

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, parsed);
    }

    #[test]
    fn heartbeat_response_roundtrip() {
        let env = Envelope::new(
            Message::HeartbeatResponse(Heartbeat {
                heartbeat_id: 17,
                timestamp: monotonic_ms(),
                worker_id: "w-1".to_string(),
            }),
            TargetType::Worker,
            Priority::Critical,
            2_000,
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("heartbeat-response"));
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, parsed);
    }

    #[test]
    fn bare_error_message_is_valid() {
        let json = serde_json::json!({
            "version": "1.0",
            "type": "error",
            "payload": {"message": "boom"},
            "requestId": "r-1",
            "targetType": "worker",
            "priority": 2,
            "timestamp": 12.5,
            "timeout": 5000
        });
        let env: Envelope = serde_json::from_value(json).unwrap();
        match &env.message {
            Message::TaskError(e) => {
                assert_eq!(e.message, "boom");
                assert_eq!(e.stack, None);
            }
            other => panic!("expected error message, got {:?}", other.kind()),
        }
        env.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_envelopes() {
        let mut env = sample_dispatch();
        env.request_id = String::new();
        assert!(matches!(
            env.validate(),
            Err(ProtocolError::EmptyRequestId)
        ));

        let mut env = sample_dispatch();
        env.version = "2.0".to_string();
        assert!(matches!(
            env.validate(),
            Err(ProtocolError::UnsupportedVersion(_))
        ));

        let mut env = sample_dispatch();
        env.timeout = 0;
        assert!(matches!(
            env.validate(),
            Err(ProtocolError::NonPositiveTimeout(0))
        ));

        let mut env = sample_dispatch();
        env.timestamp = f64::NAN;
        assert!(matches!(
            env.validate(),
            Err(ProtocolError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        let json = serde_json::json!({
            "version": "1.0",
            "type": "dispatch:ectoplasm",
            "payload": {},
            "requestId": "r-2",
            "targetType": "worker",
            "priority": 2,
            "timestamp": 1.0,
            "timeout": 1000
        });
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(MessageKind::DispatchCode.as_str(), "dispatch:code");
        assert_eq!(MessageKind::TaskResult.as_str(), "result");
        assert_eq!(MessageKind::HeartbeatResponse.as_str(), "heartbeat-response");
    }
}
