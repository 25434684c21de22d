//! Event model for append-only analysis run logs.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::mutate::MutantId;
use crate::outcome::MutationResult;

/// Log event emitted during an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// New run created.
    RunStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Configuration snapshot for compatibility checks.
        config: EngineConfig,
    },
    /// Existing run resumed.
    RunResumed {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutants pending before resume.
        remaining: usize,
    },
    /// A unit failed to decode and was excluded from the run.
    UnitRejected {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Index of the unit in the caller-supplied order.
        index: usize,
        /// Decode failure detail.
        error: String,
    },
    /// The instrumented baseline run finished green.
    BaselineCompleted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Tests profiled.
        tests: usize,
        /// Sum of baseline test durations.
        total_duration_ms: u64,
    },
    /// A mutant passed the filter pipeline and is scheduled.
    MutantDiscovered {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutant identity.
        mutant: MutantId,
        /// Human-readable description.
        description: String,
        /// Source line of the mutation site.
        line: u32,
    },
    /// A mutant's evaluation was dispatched.
    MutantStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutant identity.
        mutant: MutantId,
    },
    /// A mutant was finalized.
    MutantFinished {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Terminal result.
        result: MutationResult,
    },
    /// Run interrupted by signal or caller.
    RunInterrupted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Free-form reason.
        reason: String,
    },
    /// Run completed terminally.
    RunCompleted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Final mutation score.
        score: f64,
    },
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    (duration.as_secs() as i64)
        .saturating_mul(1000)
        .saturating_add(duration.subsec_millis() as i64)
}
