//! Construction-time configuration for every subsystem.
//!
//! All knobs are supplied when the supervisor is built; nothing is read from
//! files or the environment. Defaults match the reference deployment of a
//! single process supervising local workers.

use std::time::Duration;

/// Worker pool bounds and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Lower bound kept alive through idle reaping and failures
    pub min_workers: usize,
    /// Upper bound on spawned workers
    pub max_workers: usize,
    /// Idle reap threshold
    pub idle_timeout: Duration,
    /// Per-worker task timeout, independent of the dispatch deadline
    pub task_timeout: Duration,
    /// How long `execute` waits for an idle worker before giving up
    pub acquire_timeout: Duration,
    /// Long-lived shared workers that accept interleaved dispatches.
    /// Zero means the shared lane is unavailable.
    pub shared_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: num_cpus::get().max(2),
            idle_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            shared_workers: 0,
        }
    }
}

impl PoolConfig {
    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max.max(min);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_shared_workers(mut self, count: usize) -> Self {
        self.shared_workers = count;
        self
    }
}

/// Retry delay shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Exponential,
    Linear,
    Constant,
}

/// Backoff between retry attempts, plus symmetric jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    /// First delay
    pub base: Duration,
    /// Cap on the computed delay (before jitter)
    pub max: Duration,
    /// Exponential growth factor
    pub multiplier: f64,
    /// Jitter factor in [0, 1]; the delay is perturbed by
    /// `delay * jitter * U(-1, 1)` and clamped to zero
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn constant(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Constant,
            base,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Deterministic delay before the attempt following `failed_attempts`
    /// failures, without jitter.
    ///
    /// Exponential: `base * multiplier^(n-1)`, linear: `base * n`,
    /// constant: `base`. All capped at `max`.
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let raw = match self.kind {
            BackoffKind::Exponential => {
                let factor = self.multiplier.powi(failed_attempts.saturating_sub(1) as i32);
                self.base.as_secs_f64() * factor
            }
            BackoffKind::Linear => self.base.as_secs_f64() * failed_attempts as f64,
            BackoffKind::Constant => self.base.as_secs_f64(),
        };
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }

    /// Delay with symmetric jitter applied, clamped to zero. `unit` must be
    /// drawn uniformly from [-1, 1].
    pub fn jittered_delay(&self, failed_attempts: u32, unit: f64) -> Duration {
        let base = self.delay_for_attempt(failed_attempts).as_secs_f64();
        let jittered = base + base * self.jitter * unit;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Dispatch queue admission and retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// In-flight cap; excess dispatches stay queued
    pub max_concurrent: usize,
    /// Retry ceiling when the caller does not specify one
    pub default_max_attempts: u32,
    /// Dispatch deadline when the caller does not specify one
    pub default_timeout: Duration,
    /// Completion latencies kept for the rolling average
    pub latency_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_max_attempts: 3,
            default_timeout: Duration::from_secs(5),
            latency_window: 100,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, cap: usize) -> Self {
        self.max_concurrent = cap;
        self
    }

    pub fn with_defaults(mut self, max_attempts: u32, timeout: Duration) -> Self {
        self.default_max_attempts = max_attempts;
        self.default_timeout = timeout;
        self
    }
}

/// Liveness probing policy.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to probe each worker
    pub interval: Duration,
    /// How long to wait for a probe reply
    pub timeout: Duration,
    /// Consecutive misses before a worker is classified failed
    pub max_missed: u32,
    /// Round-trip above this is degraded rather than healthy
    pub degraded_threshold: Duration,
    /// Request a pool restart when a worker is classified failed
    pub auto_restart: bool,
    /// Round-trip samples kept for the rolling mean
    pub rtt_window: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            max_missed: 3,
            degraded_threshold: Duration::from_secs(1),
            auto_restart: true,
            rtt_window: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }
}

/// Routing cutoffs. Complexity scores run 0..=100.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Below this the bundle is cheap enough to run in-process
    pub main_thread_threshold: f64,
    /// Above this the bundle prefers the shared lane
    pub shared_worker_threshold: f64,
    /// CPU proxy must be below this for the in-process route
    pub low_load_cpu_pct: f64,
    /// Pending tasks must be below this for the in-process route
    pub low_load_max_pending: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            main_thread_threshold: 10.0,
            shared_worker_threshold: 50.0,
            low_load_cpu_pct: 50.0,
            low_load_max_pending: 3,
        }
    }
}

/// Result collector retention.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Completed merged results retained under LRU eviction
    pub max_retained_results: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_retained_results: 100,
        }
    }
}

/// Everything the supervisor needs, in one place.
#[derive(Debug, Clone, Default)]
pub struct DroverConfig {
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub backoff: BackoffConfig,
    pub heartbeat: HeartbeatConfig,
    pub router: RouterConfig,
    pub collector: CollectorConfig,
}

impl DroverConfig {
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_growth() {
        let cfg = BackoffConfig {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        };

        assert_eq!(cfg.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(400));
        // capped
        assert_eq!(cfg.delay_for_attempt(30), Duration::from_secs(30));
    }

    #[test]
    fn linear_and_constant_backoff() {
        let linear = BackoffConfig {
            kind: BackoffKind::Linear,
            base: Duration::from_millis(50),
            max: Duration::from_millis(120),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(linear.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(120));

        let constant = BackoffConfig::constant(Duration::from_millis(75)).without_jitter();
        assert_eq!(constant.delay_for_attempt(1), Duration::from_millis(75));
        assert_eq!(constant.delay_for_attempt(9), Duration::from_millis(75));
    }

    #[test]
    fn jitter_stays_within_bounds_and_clamps() {
        let cfg = BackoffConfig {
            kind: BackoffKind::Constant,
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        };

        // extremes of U(-1, 1)
        assert_eq!(cfg.jittered_delay(1, 1.0), Duration::from_millis(150));
        assert_eq!(cfg.jittered_delay(1, -1.0), Duration::from_millis(50));

        // full negative jitter can never go below zero
        let heavy = BackoffConfig {
            jitter: 1.0,
            ..cfg
        };
        assert_eq!(heavy.jittered_delay(1, -1.0), Duration::ZERO);
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = DroverConfig::default();
        assert_eq!(cfg.pool.min_workers, 2);
        assert_eq!(cfg.queue.max_concurrent, 10);
        assert_eq!(cfg.queue.default_max_attempts, 3);
        assert_eq!(cfg.backoff.base, Duration::from_millis(100));
        assert_eq!(cfg.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat.max_missed, 3);
        assert!(cfg.heartbeat.auto_restart);
        assert_eq!(cfg.router.main_thread_threshold, 10.0);
        assert_eq!(cfg.collector.max_retained_results, 100);
    }
}
