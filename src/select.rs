//! Coverage-driven test selection.
//!
//! Coverage is a necessary, not sufficient, condition for detection: only
//! tests whose baseline execution touched a mutant's block can possibly
//! kill it, so only those are ever scheduled.

use crate::coverage::CoverageRecord;
use crate::model::BlockRef;
use crate::mutate::Mutant;
use crate::suite::TestDescriptor;

/// Ordered minimal test subset for one mutant; empty means no coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Tests to run, cheapest baseline duration first.
    pub tests: Vec<TestDescriptor>,
    /// Sum of the subset's baseline durations.
    pub baseline_ms: u64,
}

impl Selection {
    /// True when no covering test exists.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Selects test subsets against a fixed coverage record.
pub struct TestSelector<'a> {
    record: &'a CoverageRecord,
}

impl<'a> TestSelector<'a> {
    /// Build a selector over a finished record.
    pub fn new(record: &'a CoverageRecord) -> Self {
        Self { record }
    }

    /// Subset for a mutant: tests covering its block, ordered by baseline
    /// duration ascending with descriptor order breaking ties, so
    /// early-exit evaluation is reproducible.
    pub fn select(&self, mutant: &Mutant) -> Selection {
        let block = BlockRef {
            unit: mutant.id.unit.clone(),
            method: mutant.id.method,
            block: mutant.id.block,
        };

        let mut tests: Vec<TestDescriptor> = self
            .record
            .tests_covering(&block)
            .into_iter()
            .cloned()
            .collect();
        tests.sort_by(|a, b| {
            self.record
                .duration_of(a)
                .cmp(&self.record.duration_of(b))
                .then_with(|| a.cmp(b))
        });

        let baseline_ms = tests.iter().map(|t| self.record.duration_of(t)).sum();
        Selection { tests, baseline_ms }
    }
}
