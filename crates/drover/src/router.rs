//! Routing decisions: where should a bundle run?
//!
//! The router scores a bundle's complexity from its characteristics, then
//! walks a fixed rule list against the current load snapshot. The rule order
//! is part of the contract and is encoded in one `if`-chain so it cannot be
//! re-sorted by configuration.
//!
//! Bundles are profiled once per fingerprint; the cache is write-once
//! read-many.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::config::RouterConfig;
use crate::error::DispatchError;

/// Explicit routing preference a caller may attach to a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStrategy {
    InProcess,
    Worker,
    SharedWorker,
}

/// Where the dispatch will actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteTarget {
    /// On the supervisor's own runtime, no worker occupied
    InProcess,
    /// Any idle dedicated worker (the pool picks the least loaded)
    DedicatedWorker,
    /// The shared lane
    SharedWorker,
}

/// System load at decision time.
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
    pub active_workers: usize,
    pub busy_workers: usize,
    /// Dispatches waiting in the queue
    pub pending_tasks: usize,
    /// CPU proxy in percent
    pub cpu_load_pct: f64,
    pub shared_available: bool,
    pub in_process_available: bool,
    pub workers_available: bool,
}

/// One routing decision, with the estimates that informed it.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub target: RouteTarget,
    pub complexity: f64,
    pub estimated_latency_ms: f64,
    pub estimated_memory_bytes: u64,
    /// Which rule fired, for logs
    pub rule: &'static str,
}

#[derive(Debug, Clone, Copy)]
struct BundleProfile {
    complexity: f64,
    estimated_latency_ms: f64,
    estimated_memory_bytes: u64,
}

/// Stateless decision logic plus the fingerprint-keyed profile cache.
pub struct DispatchRouter {
    config: RouterConfig,
    cache: DashMap<String, BundleProfile>,
}

impl DispatchRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            cache: DashMap::new(),
        }
    }

    /// Complexity score in [0, 100]:
    /// size factor (capped 30) + dependency factor (capped 30)
    /// + 20 for GPU + 20 for shared memory.
    pub fn complexity_score(bundle: &Bundle) -> f64 {
        let size_factor = (bundle.size_kb() / 10.0).min(30.0);
        let dep_factor = (3.0 * bundle.dependencies().len() as f64).min(30.0);
        let gpu = if bundle.requires_gpu() { 20.0 } else { 0.0 };
        let shm = if bundle.requires_shared_memory() { 20.0 } else { 0.0 };
        (size_factor + dep_factor + gpu + shm).clamp(0.0, 100.0)
    }

    fn profile(&self, bundle: &Bundle) -> BundleProfile {
        if let Some(cached) = self.cache.get(bundle.fingerprint()) {
            return *cached;
        }
        let complexity = Self::complexity_score(bundle);
        let profile = BundleProfile {
            complexity,
            // crude but monotone in complexity; good enough to rank targets
            estimated_latency_ms: 5.0 + complexity * 2.0,
            estimated_memory_bytes: bundle.size_bytes() * 3 + 8 * 1024 * 1024,
        };
        self.cache.insert(bundle.fingerprint().to_string(), profile);
        profile
    }

    /// Walk the rule list in its fixed order and return the first target
    /// that applies. Fails with a routing error only when no lane exists at
    /// all.
    pub fn decide(
        &self,
        bundle: &Bundle,
        load: &LoadSnapshot,
        explicit: Option<RouteStrategy>,
    ) -> Result<RouteDecision, DispatchError> {
        let profile = self.profile(bundle);
        let decision = |target, rule| RouteDecision {
            target,
            complexity: profile.complexity,
            estimated_latency_ms: profile.estimated_latency_ms,
            estimated_memory_bytes: profile.estimated_memory_bytes,
            rule,
        };

        // 1. GPU or shared-memory requirements pin to the shared lane
        if (bundle.requires_gpu() || bundle.requires_shared_memory()) && load.shared_available {
            return Ok(decision(RouteTarget::SharedWorker, "gpu-shm"));
        }

        // 2. Caller's explicit strategy, if that lane is available
        if let Some(strategy) = explicit {
            let target = match strategy {
                RouteStrategy::InProcess if load.in_process_available => {
                    Some(RouteTarget::InProcess)
                }
                RouteStrategy::Worker if load.workers_available => {
                    Some(RouteTarget::DedicatedWorker)
                }
                RouteStrategy::SharedWorker if load.shared_available => {
                    Some(RouteTarget::SharedWorker)
                }
                _ => None,
            };
            if let Some(target) = target {
                return Ok(decision(target, "explicit"));
            }
        }

        // 3. Cheap bundle on a quiet system runs in-process
        if profile.complexity < self.config.main_thread_threshold
            && load.cpu_load_pct < self.config.low_load_cpu_pct
            && load.pending_tasks < self.config.low_load_max_pending
            && load.in_process_available
        {
            return Ok(decision(RouteTarget::InProcess, "low-complexity-low-load"));
        }

        // 4. Heavy bundles prefer the shared lane
        if profile.complexity > self.config.shared_worker_threshold && load.shared_available {
            return Ok(decision(RouteTarget::SharedWorker, "high-complexity"));
        }

        // 5. Least-loaded dedicated worker
        if load.workers_available {
            return Ok(decision(RouteTarget::DedicatedWorker, "least-loaded"));
        }

        // 6. Fallback
        if load.in_process_available {
            return Ok(decision(RouteTarget::InProcess, "fallback"));
        }

        Err(DispatchError::Routing(
            "no execution lane available".to_string(),
        ))
    }

    pub fn cached_profiles(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn small_bundle() -> Bundle {
        Bundle::from_code("return 1", Value::Null)
    }

    fn heavy_bundle() -> Bundle {
        // ~300KB of code => size factor capped at 30; 12 deps => capped at 30
        let code = "x".repeat(300 * 1024);
        Bundle::from_code(code, Value::Null)
            .with_dependencies((0..12).map(|i| format!("dep{}", i)).collect())
    }

    fn quiet_load() -> LoadSnapshot {
        LoadSnapshot {
            active_workers: 2,
            busy_workers: 0,
            pending_tasks: 0,
            cpu_load_pct: 10.0,
            shared_available: true,
            in_process_available: true,
            workers_available: true,
        }
    }

    #[test]
    fn complexity_components_and_clamp() {
        assert!(DispatchRouter::complexity_score(&small_bundle()) < 1.0);

        let heavy = heavy_bundle();
        assert_eq!(DispatchRouter::complexity_score(&heavy), 60.0);

        let maxed = heavy_bundle().with_gpu().with_shared_memory();
        assert_eq!(DispatchRouter::complexity_score(&maxed), 100.0);
    }

    #[test]
    fn gpu_requirement_pins_to_shared_lane() {
        let router = DispatchRouter::new(RouterConfig::default());
        let bundle = small_bundle().with_gpu();
        let d = router.decide(&bundle, &quiet_load(), None).unwrap();
        assert_eq!(d.target, RouteTarget::SharedWorker);
        assert_eq!(d.rule, "gpu-shm");
    }

    #[test]
    fn gpu_without_shared_lane_falls_through() {
        let router = DispatchRouter::new(RouterConfig::default());
        let bundle = small_bundle().with_gpu();
        let mut load = quiet_load();
        load.shared_available = false;
        // rule 1 unavailable; complexity 20 on a quiet system is not < 10,
        // so the dedicated pool takes it
        let d = router.decide(&bundle, &load, None).unwrap();
        assert_eq!(d.target, RouteTarget::DedicatedWorker);
    }

    #[test]
    fn explicit_strategy_wins_when_available() {
        let router = DispatchRouter::new(RouterConfig::default());
        let d = router
            .decide(
                &heavy_bundle(),
                &quiet_load(),
                Some(RouteStrategy::InProcess),
            )
            .unwrap();
        assert_eq!(d.target, RouteTarget::InProcess);
        assert_eq!(d.rule, "explicit");
    }

    #[test]
    fn cheap_bundle_quiet_system_runs_in_process() {
        let router = DispatchRouter::new(RouterConfig::default());
        let d = router.decide(&small_bundle(), &quiet_load(), None).unwrap();
        assert_eq!(d.target, RouteTarget::InProcess);
        assert_eq!(d.rule, "low-complexity-low-load");
    }

    #[test]
    fn cheap_bundle_busy_system_goes_to_pool() {
        let router = DispatchRouter::new(RouterConfig::default());
        let mut load = quiet_load();
        load.cpu_load_pct = 80.0;
        let d = router.decide(&small_bundle(), &load, None).unwrap();
        assert_eq!(d.target, RouteTarget::DedicatedWorker);
        assert_eq!(d.rule, "least-loaded");
    }

    #[test]
    fn heavy_bundle_prefers_shared_lane() {
        let router = DispatchRouter::new(RouterConfig::default());
        let d = router.decide(&heavy_bundle(), &quiet_load(), None).unwrap();
        assert_eq!(d.target, RouteTarget::SharedWorker);
        assert_eq!(d.rule, "high-complexity");
    }

    #[test]
    fn fallback_and_no_lane_error() {
        let router = DispatchRouter::new(RouterConfig::default());
        let mut load = quiet_load();
        load.shared_available = false;
        load.workers_available = false;
        let d = router.decide(&heavy_bundle(), &load, None).unwrap();
        assert_eq!(d.target, RouteTarget::InProcess);
        assert_eq!(d.rule, "fallback");

        load.in_process_available = false;
        let err = router.decide(&heavy_bundle(), &load, None).unwrap_err();
        assert!(matches!(err, DispatchError::Routing(_)));
    }

    #[test]
    fn profiles_are_cached_by_fingerprint() {
        let router = DispatchRouter::new(RouterConfig::default());
        let bundle = small_bundle();
        let _ = router.decide(&bundle, &quiet_load(), None).unwrap();
        let _ = router.decide(&bundle, &quiet_load(), None).unwrap();
        assert_eq!(router.cached_profiles(), 1);
    }
}
