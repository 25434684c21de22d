//! Baseline coverage profiling: one instrumented run of the whole suite
//! against the unmodified program.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EngineConfig, ExecutionMode};
use crate::exec::channel::{ChannelError, WorkerChannel};
use crate::exec::protocol::{JobKind, PROTOCOL_VERSION, WireMessage};
use crate::model::BlockRef;
use crate::suite::{TestDescriptor, TestVerdict};

/// Per-test slice of the coverage record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCoverage {
    /// Blocks the test entered during the baseline run.
    pub blocks: BTreeSet<BlockRef>,
    /// Baseline wall-clock duration of the test.
    pub duration_ms: u64,
}

/// Mapping from test to the blocks it executed at baseline. Built once,
/// read-only thereafter; shared by every scheduling decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    per_test: BTreeMap<TestDescriptor, TestCoverage>,
}

impl CoverageRecord {
    /// Record one test's coverage; test-construction seam for callers
    /// that do not profile through a worker.
    pub fn insert(&mut self, test: TestDescriptor, coverage: TestCoverage) {
        self.per_test.insert(test, coverage);
    }

    /// Number of tests recorded.
    pub fn tests(&self) -> usize {
        self.per_test.len()
    }

    /// Baseline duration of one test, 0 when unknown.
    pub fn duration_of(&self, test: &TestDescriptor) -> u64 {
        self.per_test.get(test).map(|c| c.duration_ms).unwrap_or(0)
    }

    /// Coverage of one test.
    pub fn coverage_of(&self, test: &TestDescriptor) -> Option<&TestCoverage> {
        self.per_test.get(test)
    }

    /// Tests whose baseline execution entered `block`, in descriptor
    /// order.
    pub fn tests_covering<'a>(&'a self, block: &BlockRef) -> Vec<&'a TestDescriptor> {
        self.per_test
            .iter()
            .filter(|(_, coverage)| coverage.blocks.contains(block))
            .map(|(test, _)| test)
            .collect()
    }

    /// Sum of all baseline durations.
    pub fn total_duration_ms(&self) -> u64 {
        self.per_test.values().map(|c| c.duration_ms).sum()
    }
}

/// A test failed against the unmodified program; mutation analysis is
/// meaningless against a red baseline.
#[derive(Debug, Error)]
#[error("baseline failed: {} test(s) failed on the unmodified program", failures.len())]
pub struct BaselineFailureError {
    /// The failing tests with their failure details.
    pub failures: Vec<(TestDescriptor, Option<String>)>,
}

/// Profiler failures.
#[derive(Debug, Error)]
pub enum CoverageError {
    /// Red baseline; fatal before any mutation.
    #[error(transparent)]
    Baseline(#[from] BaselineFailureError),
    /// The profiling channel failed.
    #[error("baseline channel error: {0}")]
    Channel(#[from] ChannelError),
    /// The profiling channel closed before reporting every test.
    #[error("baseline ended after {seen} of {expected} tests")]
    Incomplete {
        /// Tests reported before the stream ended.
        seen: usize,
        /// Tests requested.
        expected: usize,
    },
}

/// Sink the finished coverage record is pushed to.
pub trait CoverageExporter {
    /// Receive the finished record.
    fn export(&mut self, record: &CoverageRecord);
}

/// Exporter that drops the record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExporter;

impl CoverageExporter for NullExporter {
    fn export(&mut self, _record: &CoverageRecord) {}
}

/// Run the full suite once, unmutated and instrumented, through one
/// worker channel. Every test must pass; no mutation occurs here.
pub fn profile_baseline(
    config: &EngineConfig,
    bundle: &Path,
    tests: &[TestDescriptor],
) -> Result<CoverageRecord, CoverageError> {
    let mut channel = WorkerChannel::open(&config.worker_exe, bundle, config.spawn_retries)?;

    // Generous deadline: the baseline has no mutant to run away, so the
    // constant budget is granted per test.
    let budget = config
        .timeout_constant_ms
        .saturating_mul(tests.len().max(1) as u64);
    let deadline = Instant::now() + Duration::from_millis(budget);

    channel.send(&WireMessage::Job {
        version: PROTOCOL_VERSION,
        kind: JobKind::Baseline,
        tests: tests.to_vec(),
        mode: ExecutionMode::RunAll,
    })?;

    let mut record = CoverageRecord::default();
    let mut failures: Vec<(TestDescriptor, Option<String>)> = Vec::new();

    loop {
        match channel.recv_by(deadline)? {
            Some(WireMessage::TestStarted { .. }) => {}
            Some(WireMessage::TestResult {
                test,
                verdict,
                detail,
                duration_ms,
                covered,
            }) => {
                if verdict == TestVerdict::Fail {
                    failures.push((test.clone(), detail));
                }
                record.insert(
                    test,
                    TestCoverage {
                        blocks: covered.into_iter().collect(),
                        duration_ms,
                    },
                );
            }
            Some(WireMessage::Done { .. }) => break,
            Some(other) => {
                channel.terminate();
                return Err(ChannelError::Protocol(
                    crate::exec::protocol::ProtocolError::UnexpectedMessage {
                        expected: "test event or done",
                        got: other.label(),
                    },
                )
                .into());
            }
            None => {
                channel.terminate();
                return Err(CoverageError::Incomplete {
                    seen: record.tests(),
                    expected: tests.len(),
                });
            }
        }
    }
    channel.terminate();

    if !failures.is_empty() {
        return Err(BaselineFailureError { failures }.into());
    }
    if record.tests() != tests.len() {
        return Err(CoverageError::Incomplete {
            seen: record.tests(),
            expected: tests.len(),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, MethodId};

    fn block(n: u32) -> BlockRef {
        BlockRef {
            unit: "calc".to_string(),
            method: MethodId(0),
            block: BlockId(n),
        }
    }

    fn record_with(entries: &[(&str, &[u32], u64)]) -> CoverageRecord {
        let mut record = CoverageRecord::default();
        for (name, blocks, duration_ms) in entries {
            record.insert(
                TestDescriptor::new("calc_tests", *name),
                TestCoverage {
                    blocks: blocks.iter().map(|n| block(*n)).collect(),
                    duration_ms: *duration_ms,
                },
            );
        }
        record
    }

    #[test]
    fn covering_tests_are_exact_and_descriptor_ordered() {
        let record = record_with(&[
            ("b_touches_both", &[0, 1], 5),
            ("a_touches_one", &[0], 3),
            ("c_touches_none", &[], 1),
        ]);

        let covering: Vec<String> = record
            .tests_covering(&block(0))
            .into_iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(covering, vec!["a_touches_one", "b_touches_both"]);

        assert_eq!(record.tests_covering(&block(1)).len(), 1);
        assert!(record.tests_covering(&block(9)).is_empty());
    }

    #[test]
    fn durations_aggregate_and_default_to_zero() {
        let record = record_with(&[("a", &[0], 3), ("b", &[1], 7)]);
        assert_eq!(record.total_duration_ms(), 10);
        assert_eq!(
            record.duration_of(&TestDescriptor::new("calc_tests", "a")),
            3
        );
        assert_eq!(
            record.duration_of(&TestDescriptor::new("calc_tests", "missing")),
            0
        );
    }

    #[test]
    fn baseline_failure_lists_every_red_test() {
        let err = BaselineFailureError {
            failures: vec![
                (TestDescriptor::new("t", "a"), Some("expected 3, got 1".to_string())),
                (TestDescriptor::new("t", "b"), None),
            ],
        };
        assert!(err.to_string().contains("2 test(s)"));
    }

    #[test]
    fn null_exporter_accepts_any_record() {
        let record = record_with(&[("a", &[0], 1)]);
        NullExporter.export(&record);
    }
}
