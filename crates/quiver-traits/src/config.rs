//! Engine configuration.
//!
//! Configuration contains:
//! - Graph build policy (strict or best-effort)
//! - Executor job packing and failure policy
//! - Dispatcher retry, timeout and queueing limits
//! - Cache cycle scoping
//! - Change detection between cycles
//!
//! Configuration does NOT contain:
//! - Function definitions (those are registered explicitly)
//! - Market data values

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// POLICIES
// =============================================================================

/// What the graph builder does with an unsatisfiable requested value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Abort the whole build.
    #[default]
    Strict,
    /// Drop the requested value, keep building, report the failure.
    BestEffort,
}

/// How cache entries survive a cycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Entries are cleared at every cycle boundary.
    #[default]
    Scoped,
    /// Entries are retained and act as pre-satisfied inputs next cycle.
    Incremental,
}

/// What the executor does when a failure reaches a requested value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the affected roots and keep executing independent branches.
    #[default]
    Continue,
    /// Stop forming batches as soon as any requested value fails.
    AbortOnRootFailure,
}

/// How the dispatcher picks an invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Lowest in-flight/capacity ratio, ties broken round-robin.
    #[default]
    LeastLoaded,
    /// Strict rotation over invokers with spare capacity.
    RoundRobin,
}

// =============================================================================
// SECTION CONFIGS
// =============================================================================

/// Graph builder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Unsatisfied requirement policy.
    pub mode: BuildMode,
}

/// Graph executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum node invocations per job.
    pub max_job_size: usize,
    /// Root failure policy.
    pub failure_policy: FailurePolicy,
    /// Graph-level deadline (cancels the execution when elapsed).
    pub deadline_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_job_size: 64,
            failure_policy: FailurePolicy::Continue,
            deadline_ms: None,
        }
    }
}

impl ExecutorConfig {
    /// Graph-level deadline as a duration.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Job dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum attempts per job (first dispatch included).
    pub max_attempts: u32,
    /// Response deadline per attempt.
    pub response_timeout_ms: u64,
    /// Maximum jobs waiting for invoker capacity.
    pub max_queued_jobs: usize,
    /// Invoker selection policy.
    pub selection: SelectionPolicy,
    /// How often queued jobs are re-offered when no completion frees capacity.
    pub requeue_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            response_timeout_ms: 30_000,
            max_queued_jobs: 10_000,
            selection: SelectionPolicy::LeastLoaded,
            requeue_interval_ms: 50,
        }
    }
}

impl DispatchConfig {
    /// Config for latency-sensitive intraday cycles.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 2,
            response_timeout_ms: 2_000,
            max_queued_jobs: 1_000,
            selection: SelectionPolicy::LeastLoaded,
            requeue_interval_ms: 5,
        }
    }

    /// Response deadline as a duration.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Requeue interval as a duration.
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }
}

/// Computation cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cycle scoping.
    pub mode: CacheMode,
}

/// Change detection between cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Largest move of a numeric result still reported as unchanged.
    /// Zero compares exactly.
    pub tolerance: f64,
}

// =============================================================================
// ENGINE CONFIG
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name, used as the cycle name on jobs.
    pub name: String,
    /// Graph builder section.
    pub build: BuildConfig,
    /// Executor section.
    pub executor: ExecutorConfig,
    /// Dispatcher section.
    pub dispatch: DispatchConfig,
    /// Cache section.
    pub cache: CacheConfig,
    /// Result delta section.
    pub delta: DeltaConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "quiver".to_string(),
            build: BuildConfig::default(),
            executor: ExecutorConfig::default(),
            dispatch: DispatchConfig::default(),
            cache: CacheConfig::default(),
            delta: DeltaConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a minimal configuration for testing.
    pub fn minimal() -> Self {
        Self {
            name: "test".to_string(),
            build: BuildConfig::default(),
            executor: ExecutorConfig {
                max_job_size: 16,
                ..Default::default()
            },
            dispatch: DispatchConfig {
                max_attempts: 3,
                response_timeout_ms: 1_000,
                max_queued_jobs: 100,
                selection: SelectionPolicy::LeastLoaded,
                requeue_interval_ms: 5,
            },
            cache: CacheConfig::default(),
            delta: DeltaConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.build.mode, BuildMode::Strict);
        assert_eq!(config.cache.mode, CacheMode::Scoped);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.response_timeout(), Duration::from_secs(30));
        assert_eq!(config.executor.deadline(), None);
        assert_eq!(config.delta.tolerance, 0.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"build":{"mode":"best_effort"},"dispatch":{"max_attempts":5}}"#)
                .unwrap();
        assert_eq!(config.build.mode, BuildMode::BestEffort);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.max_queued_jobs, 10_000);
        assert_eq!(config.name, "quiver");
    }
}
