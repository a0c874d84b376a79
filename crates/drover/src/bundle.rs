//! Code bundles: the opaque units of work the supervisor dispatches.
//!
//! A bundle is immutable once built. Its fingerprint is a blake3 hash of the
//! content, used by the router as a cache key so a bundle is only scored
//! once.

use droverproto::{
    BundleManifest, BundleModule, DispatchBundle, DispatchCode, DispatchWasm, Message, Priority,
    WasmMemory,
};
use serde_json::Value;

/// The content variants a bundle can carry.
#[derive(Debug, Clone)]
pub enum BundlePayload {
    /// Source code plus execution context
    Code { code: String, context: Value },
    /// A WASM binary
    Wasm {
        binary: Vec<u8>,
        entry_point: String,
        imports: Vec<String>,
        memory: WasmMemory,
        args: Vec<Value>,
    },
    /// Multiple modules under one manifest
    Modules {
        name: String,
        version: String,
        modules: Vec<BundleModule>,
        entry_point: String,
        context: Value,
    },
}

/// An immutable unit of dispatchable work.
#[derive(Debug, Clone)]
pub struct Bundle {
    fingerprint: String,
    size_bytes: u64,
    dependencies: Vec<String>,
    requires_gpu: bool,
    requires_shared_memory: bool,
    declared_priority: Option<Priority>,
    payload: BundlePayload,
}

impl Bundle {
    /// Bundle wrapping source code.
    pub fn from_code(code: impl Into<String>, context: Value) -> Self {
        let code = code.into();
        let fingerprint = hex::encode(blake3::hash(code.as_bytes()).as_bytes());
        let size_bytes = code.len() as u64;
        Self {
            fingerprint,
            size_bytes,
            dependencies: Vec::new(),
            requires_gpu: false,
            requires_shared_memory: false,
            declared_priority: None,
            payload: BundlePayload::Code { code, context },
        }
    }

    /// Bundle wrapping a WASM binary.
    pub fn from_wasm(
        binary: Vec<u8>,
        entry_point: impl Into<String>,
        memory: WasmMemory,
        args: Vec<Value>,
    ) -> Self {
        let fingerprint = hex::encode(blake3::hash(&binary).as_bytes());
        let size_bytes = binary.len() as u64;
        Self {
            fingerprint,
            size_bytes,
            dependencies: Vec::new(),
            requires_gpu: false,
            requires_shared_memory: false,
            declared_priority: None,
            payload: BundlePayload::Wasm {
                binary,
                entry_point: entry_point.into(),
                imports: Vec::new(),
                memory,
                args,
            },
        }
    }

    /// Bundle built from a manifest and its modules. Characteristics come
    /// from the manifest.
    pub fn from_manifest(
        manifest: BundleManifest,
        modules: Vec<BundleModule>,
        entry_point: impl Into<String>,
        context: Value,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(manifest.name.as_bytes());
        hasher.update(manifest.version.as_bytes());
        let mut size_bytes = 0u64;
        for module in &modules {
            hasher.update(module.id.as_bytes());
            hasher.update(&module.binary);
            size_bytes += module.binary.len() as u64;
        }
        Self {
            fingerprint: hex::encode(hasher.finalize().as_bytes()),
            size_bytes,
            dependencies: manifest.dependencies.clone(),
            requires_gpu: manifest.requires_gpu,
            requires_shared_memory: manifest.requires_shared_memory,
            declared_priority: manifest.priority,
            payload: BundlePayload::Modules {
                name: manifest.name,
                version: manifest.version,
                modules,
                entry_point: entry_point.into(),
                context,
            },
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_gpu(mut self) -> Self {
        self.requires_gpu = true;
        self
    }

    pub fn with_shared_memory(mut self) -> Self {
        self.requires_shared_memory = true;
        self
    }

    pub fn with_declared_priority(mut self, priority: Priority) -> Self {
        self.declared_priority = Some(priority);
        self
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn requires_gpu(&self) -> bool {
        self.requires_gpu
    }

    pub fn requires_shared_memory(&self) -> bool {
        self.requires_shared_memory
    }

    pub fn declared_priority(&self) -> Option<Priority> {
        self.declared_priority
    }

    pub fn payload(&self) -> &BundlePayload {
        &self.payload
    }

    /// The wire message that dispatches this bundle to a worker.
    pub fn to_message(&self) -> Message {
        match &self.payload {
            BundlePayload::Code { code, context } => Message::DispatchCode(DispatchCode {
                code: code.clone(),
                code_hash: self.fingerprint.clone(),
                context: context.clone(),
                dependencies: self.dependencies.clone(),
            }),
            BundlePayload::Wasm {
                binary,
                entry_point,
                imports,
                memory,
                args,
            } => Message::DispatchWasm(DispatchWasm {
                binary: binary.clone(),
                hash: self.fingerprint.clone(),
                entry_point: entry_point.clone(),
                imports: imports.clone(),
                memory: *memory,
                args: args.clone(),
            }),
            BundlePayload::Modules {
                name,
                version,
                modules,
                entry_point,
                context,
            } => Message::DispatchBundle(DispatchBundle {
                manifest: BundleManifest {
                    name: name.clone(),
                    version: version.clone(),
                    priority: self.declared_priority,
                    dependencies: self.dependencies.clone(),
                    requires_gpu: self.requires_gpu,
                    requires_shared_memory: self.requires_shared_memory,
                },
                modules: modules.clone(),
                entry_point: entry_point.clone(),
                context: context.clone(),
            }),
        }
    }
}
