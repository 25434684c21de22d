//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mutate::operators;

/// Execution strategy for one mutant's test subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Stop at the first failing test; fast, no matrix.
    StopOnFirstFailure,
    /// Run every selected test; slower, populates the mutation matrix.
    RunAll,
}

/// Configuration for one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Root directory where run state is persisted.
    pub run_root: PathBuf,
    /// Worker executable spawned per isolated channel.
    pub worker_exe: PathBuf,
    /// Bounded worker pool size.
    pub workers: usize,
    /// Timeout multiplier over the subset's baseline duration.
    pub timeout_factor: f64,
    /// Constant timeout floor added on top, in milliseconds.
    pub timeout_constant_ms: u64,
    /// Execution strategy.
    pub mode: ExecutionMode,
    /// Operator groups to register, in registry order.
    pub operator_groups: Vec<String>,
    /// Interceptor names disabled for this run (all are on by default
    /// unless marked opt-in).
    pub disabled_interceptors: Vec<String>,
    /// Bounded attempts to spawn a worker before the run fails.
    pub spawn_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            run_root: cwd.join(".bytemute").join("runs"),
            worker_exe: PathBuf::from("bytemute-worker"),
            workers: 2,
            timeout_factor: 1.25,
            timeout_constant_ms: 4000,
            mode: ExecutionMode::StopOnFirstFailure,
            operator_groups: operators::default_group_names(),
            disabled_interceptors: Vec::new(),
            spawn_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Set run-state root.
    pub fn with_run_root(mut self, run_root: impl Into<PathBuf>) -> Self {
        self.run_root = run_root.into();
        self
    }

    /// Set the worker executable path.
    pub fn with_worker_exe(mut self, worker_exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = worker_exe.into();
        self
    }

    /// Set worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set timeout derivation parameters.
    pub fn with_timeout(mut self, factor: f64, constant_ms: u64) -> Self {
        self.timeout_factor = factor;
        self.timeout_constant_ms = constant_ms;
        self
    }

    /// Set execution strategy.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Restrict the operator registry to the named groups.
    pub fn with_operator_groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        self.operator_groups = groups.into_iter().collect();
        self
    }

    /// Disable an interceptor by name.
    pub fn without_interceptor(mut self, name: impl Into<String>) -> Self {
        self.disabled_interceptors.push(name.into());
        self
    }

    /// Per-mutant deadline for a subset whose baseline took `baseline_ms`.
    pub fn timeout_for(&self, baseline_ms: u64) -> u64 {
        (baseline_ms as f64 * self.timeout_factor) as u64 + self.timeout_constant_ms
    }
}
