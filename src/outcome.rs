//! Terminal mutant statuses, per-mutant results, matrix, and score.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mutate::MutantId;
use crate::suite::{TestDescriptor, TestVerdict};

/// Terminal (and the one pre-terminal) status of a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    /// No baseline test covers the mutant's block; never scheduled.
    NoCoverage,
    /// Every selected test passed.
    Survived,
    /// A selected test failed.
    Killed,
    /// The evaluation exceeded its baseline-derived deadline.
    TimedOut,
    /// The channel failed or closed without completing.
    RunError,
    /// The worker exhausted its memory budget.
    MemoryError,
    /// Scheduled, not yet finalized.
    NotStarted,
}

impl DetectionStatus {
    /// True for every status except [`DetectionStatus::NotStarted`].
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }
}

/// Finalized (or not-yet-started) outcome of one mutant.
///
/// Constructed through the per-status constructors so the killing-test
/// invariant (`killing_test` is present iff the status is `Killed`) holds
/// everywhere by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Mutant identity.
    pub mutant: MutantId,
    /// Status; transitions from `NotStarted` exactly once.
    pub status: DetectionStatus,
    /// The test that killed the mutant, iff `Killed`.
    pub killing_test: Option<TestDescriptor>,
    /// Tests executed before finalization.
    pub tests_executed: u32,
    /// Wall-clock time of the evaluation.
    pub elapsed_ms: u64,
    /// Failure detail for error statuses.
    pub detail: Option<String>,
}

impl MutationResult {
    /// A scheduled, not-yet-evaluated mutant.
    pub fn not_started(mutant: MutantId) -> Self {
        Self {
            mutant,
            status: DetectionStatus::NotStarted,
            killing_test: None,
            tests_executed: 0,
            elapsed_ms: 0,
            detail: None,
        }
    }

    /// Finalized without a worker: no covering test exists.
    pub fn no_coverage(mutant: MutantId) -> Self {
        Self {
            mutant,
            status: DetectionStatus::NoCoverage,
            killing_test: None,
            tests_executed: 0,
            elapsed_ms: 0,
            detail: None,
        }
    }

    /// Finalized killed by `killing_test`.
    pub fn killed(
        mutant: MutantId,
        killing_test: TestDescriptor,
        tests_executed: u32,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            mutant,
            status: DetectionStatus::Killed,
            killing_test: Some(killing_test),
            tests_executed,
            elapsed_ms,
            detail: None,
        }
    }

    /// Finalized survived: every selected test passed.
    pub fn survived(mutant: MutantId, tests_executed: u32, elapsed_ms: u64) -> Self {
        Self {
            mutant,
            status: DetectionStatus::Survived,
            killing_test: None,
            tests_executed,
            elapsed_ms,
            detail: None,
        }
    }

    /// Finalized after exceeding the evaluation deadline.
    pub fn timed_out(mutant: MutantId, tests_executed: u32, elapsed_ms: u64) -> Self {
        Self {
            mutant,
            status: DetectionStatus::TimedOut,
            killing_test: None,
            tests_executed,
            elapsed_ms,
            detail: None,
        }
    }

    /// Finalized after an abnormal channel end.
    pub fn run_error(
        mutant: MutantId,
        detail: impl Into<String>,
        tests_executed: u32,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            mutant,
            status: DetectionStatus::RunError,
            killing_test: None,
            tests_executed,
            elapsed_ms,
            detail: Some(detail.into()),
        }
    }

    /// Finalized after the worker signalled memory exhaustion.
    pub fn memory_error(mutant: MutantId, tests_executed: u32, elapsed_ms: u64) -> Self {
        Self {
            mutant,
            status: DetectionStatus::MemoryError,
            killing_test: None,
            tests_executed,
            elapsed_ms,
            detail: None,
        }
    }

    /// The killing-test invariant, checkable at aggregation boundaries.
    pub fn invariant_holds(&self) -> bool {
        self.killing_test.is_some() == (self.status == DetectionStatus::Killed)
    }
}

/// Dense (mutant × test) outcome table, populated in run-all mode.
///
/// Entries merge commutatively, so aggregation order between concurrent
/// evaluations is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationMatrix {
    cells: BTreeMap<MutantId, BTreeMap<TestDescriptor, TestVerdict>>,
}

impl MutationMatrix {
    /// Empty matrix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one verdict.
    pub fn record(&mut self, mutant: MutantId, test: TestDescriptor, verdict: TestVerdict) {
        self.cells.entry(mutant).or_default().insert(test, verdict);
    }

    /// Look up one cell.
    pub fn cell(&self, mutant: &MutantId, test: &TestDescriptor) -> Option<TestVerdict> {
        self.cells.get(mutant).and_then(|row| row.get(test)).copied()
    }

    /// Row for one mutant.
    pub fn row(&self, mutant: &MutantId) -> Option<&BTreeMap<TestDescriptor, TestVerdict>> {
        self.cells.get(mutant)
    }

    /// Number of mutants with at least one cell.
    pub fn mutants(&self) -> usize {
        self.cells.len()
    }

    /// True when no cell has been recorded.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Merge another matrix in; commutative with respect to disjoint and
    /// identical cells.
    pub fn merge(&mut self, other: MutationMatrix) {
        for (mutant, row) in other.cells {
            let target = self.cells.entry(mutant).or_default();
            for (test, verdict) in row {
                target.insert(test, verdict);
            }
        }
    }
}

/// Aggregated counts and the mutation score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCard {
    /// All finalized mutants seen.
    pub total: usize,
    /// Killed mutants.
    pub killed: usize,
    /// Survived mutants.
    pub survived: usize,
    /// Timed-out mutants.
    pub timed_out: usize,
    /// Run-error mutants.
    pub run_error: usize,
    /// Memory-error mutants.
    pub memory_error: usize,
    /// Mutants with no covering test.
    pub no_coverage: usize,
    /// Mutants still pending (resume material).
    pub not_started: usize,
}

impl ScoreCard {
    /// Fold one result into the counts.
    pub fn add(&mut self, result: &MutationResult) {
        self.total += 1;
        match result.status {
            DetectionStatus::Killed => self.killed += 1,
            DetectionStatus::Survived => self.survived += 1,
            DetectionStatus::TimedOut => self.timed_out += 1,
            DetectionStatus::RunError => self.run_error += 1,
            DetectionStatus::MemoryError => self.memory_error += 1,
            DetectionStatus::NoCoverage => self.no_coverage += 1,
            DetectionStatus::NotStarted => self.not_started += 1,
        }
    }

    /// Build a card from a finished result set.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a MutationResult>) -> Self {
        let mut card = Self::default();
        for result in results {
            card.add(result);
        }
        card
    }

    /// Mutation score: killed / (killed + survived), by convention
    /// excluding no-coverage (and error/timeout) mutants from the
    /// denominator. 0 when nothing was scorable.
    pub fn score(&self) -> f64 {
        let denominator = self.killed + self.survived;
        if denominator == 0 {
            return 0.0;
        }
        self.killed as f64 / denominator as f64
    }
}
