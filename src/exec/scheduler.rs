//! Execution scheduler: bounded worker pool, per-mutant deadlines,
//! exactly-one-finalization semantics.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{EngineConfig, ExecutionMode};
use crate::mutate::Mutant;
use crate::outcome::MutationResult;
use crate::suite::{TestDescriptor, TestVerdict};

use super::channel::{ChannelError, WorkerChannel};
use super::protocol::{JobKind, PROTOCOL_VERSION, WireMessage};
use super::worker::MEMORY_EXIT_CODE;

/// One unit of scheduler work: an accepted mutant with its ordered,
/// non-empty test subset and the subset's baseline duration.
#[derive(Debug, Clone)]
pub struct EvaluationTask {
    /// The mutant to evaluate.
    pub mutant: Mutant,
    /// Selected tests, in execution order.
    pub tests: Vec<TestDescriptor>,
    /// Sum of the subset's baseline durations, for the deadline.
    pub baseline_ms: u64,
}

/// A finalized evaluation: the terminal result plus per-test verdicts
/// (matrix rows in run-all mode).
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The finalized result; exactly one per task.
    pub result: MutationResult,
    /// Verdicts observed before finalization.
    pub verdicts: Vec<(TestDescriptor, TestVerdict)>,
}

/// What a pool thread reports back per task.
#[derive(Debug)]
pub enum Completion {
    /// A mutant was finalized.
    Evaluated(Evaluation),
    /// The scheduler itself cannot continue; fatal for the run.
    Infrastructure(SchedulerError),
}

/// Scheduler-level (run-fatal) failures, distinct from per-mutant ones.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No worker could be spawned within the bounded retry budget; an
    /// environment failure, not an analysis result.
    #[error("worker pool unavailable: {0}")]
    WorkerUnavailable(#[from] ChannelError),
}

/// Dispatches evaluation tasks across a bounded pool of worker threads,
/// one isolated channel per evaluation.
pub struct ExecutionScheduler {
    config: EngineConfig,
    bundle: PathBuf,
}

impl ExecutionScheduler {
    /// Build a scheduler for one run.
    pub fn new(config: EngineConfig, bundle: impl Into<PathBuf>) -> Self {
        Self {
            config,
            bundle: bundle.into(),
        }
    }

    /// Evaluate every task, streaming completions in whatever order they
    /// finish. The receiver closes once all pool threads drain or the
    /// cancel flag stops them; cancelled tasks are simply never finalized.
    pub fn run(
        &self,
        tasks: Vec<EvaluationTask>,
        cancel: Arc<AtomicBool>,
    ) -> mpsc::Receiver<Completion> {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));

        for _ in 0..self.config.workers.max(1) {
            let tx = tx.clone();
            let queue = Arc::clone(&queue);
            let cancel = Arc::clone(&cancel);
            let config = self.config.clone();
            let bundle = self.bundle.clone();

            std::thread::spawn(move || {
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let task = {
                        let mut queue = queue.lock().expect("task queue should lock");
                        queue.pop_front()
                    };
                    let Some(task) = task else { break };

                    let completion = evaluate(&config, &bundle, task);
                    let fatal = matches!(completion, Completion::Infrastructure(_));
                    if fatal {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    if tx.send(completion).is_err() || fatal {
                        break;
                    }
                }
            });
        }

        rx
    }
}

fn evaluate(config: &EngineConfig, bundle: &Path, task: EvaluationTask) -> Completion {
    let start = Instant::now();
    let deadline = start + Duration::from_millis(config.timeout_for(task.baseline_ms));
    let mutant = task.mutant;

    let mut channel =
        match WorkerChannel::open(&config.worker_exe, bundle, config.spawn_retries) {
            Ok(channel) => channel,
            Err(err) => return Completion::Infrastructure(SchedulerError::WorkerUnavailable(err)),
        };

    let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

    let job = WireMessage::Job {
        version: PROTOCOL_VERSION,
        kind: JobKind::Mutant {
            unit: mutant.id.unit.clone(),
            rewritten_unit: mutant.rewritten_unit.clone(),
        },
        tests: task.tests.clone(),
        mode: config.mode,
    };
    if let Err(err) = channel.send(&job) {
        channel.terminate();
        return Completion::Evaluated(Evaluation {
            result: MutationResult::run_error(mutant.id, err.to_string(), 0, elapsed(start)),
            verdicts: Vec::new(),
        });
    }

    let mut verdicts: Vec<(TestDescriptor, TestVerdict)> = Vec::new();
    let mut executed = 0u32;
    let mut first_failure: Option<TestDescriptor> = None;

    loop {
        match channel.recv_by(deadline) {
            Ok(Some(WireMessage::TestStarted { .. })) => {}
            Ok(Some(WireMessage::TestResult { test, verdict, .. })) => {
                executed += 1;
                verdicts.push((test.clone(), verdict));
                if verdict == TestVerdict::Fail {
                    if first_failure.is_none() {
                        first_failure = Some(test);
                    }
                    // First failure wins; only matrix mode keeps reading.
                    if config.mode == ExecutionMode::StopOnFirstFailure {
                        channel.terminate();
                        let killing = first_failure.expect("failure was just recorded");
                        return Completion::Evaluated(Evaluation {
                            result: MutationResult::killed(
                                mutant.id,
                                killing,
                                executed,
                                elapsed(start),
                            ),
                            verdicts,
                        });
                    }
                }
            }
            Ok(Some(WireMessage::Done { .. })) => {
                channel.terminate();
                let result = match first_failure {
                    Some(killing) => {
                        MutationResult::killed(mutant.id, killing, executed, elapsed(start))
                    }
                    None => MutationResult::survived(mutant.id, executed, elapsed(start)),
                };
                return Completion::Evaluated(Evaluation { result, verdicts });
            }
            Ok(Some(other @ WireMessage::Job { .. })) => {
                channel.terminate();
                return Completion::Evaluated(Evaluation {
                    result: MutationResult::run_error(
                        mutant.id,
                        format!("unexpected {} message from worker", other.label()),
                        executed,
                        elapsed(start),
                    ),
                    verdicts,
                });
            }
            Ok(None) => {
                // Closed without DONE: a crash. The exit code tells memory
                // exhaustion apart from everything else.
                let result = if channel.exit_code() == Some(MEMORY_EXIT_CODE) {
                    MutationResult::memory_error(mutant.id, executed, elapsed(start))
                } else {
                    MutationResult::run_error(
                        mutant.id,
                        "channel closed without completion",
                        executed,
                        elapsed(start),
                    )
                };
                return Completion::Evaluated(Evaluation { result, verdicts });
            }
            Err(ChannelError::DeadlineExceeded) => {
                channel.terminate();
                debug_assert!(channel.is_terminated());
                return Completion::Evaluated(Evaluation {
                    result: MutationResult::timed_out(mutant.id, executed, elapsed(start)),
                    verdicts,
                });
            }
            Err(err) => {
                let result = if channel.exit_code() == Some(MEMORY_EXIT_CODE) {
                    MutationResult::memory_error(mutant.id, executed, elapsed(start))
                } else {
                    MutationResult::run_error(mutant.id, err.to_string(), executed, elapsed(start))
                };
                return Completion::Evaluated(Evaluation { result, verdicts });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, Instruction, MethodId, UnitBuilder, decode_unit};
    use crate::mutate::{MutantGenerator, MutantId};
    use crate::outcome::DetectionStatus;

    fn fixture_task() -> EvaluationTask {
        let bytes = UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::Return, 3);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = MutantGenerator::from_groups(&["MATH".to_string()])
            .expect("MATH should resolve")
            .generate(&unit);
        EvaluationTask {
            mutant: mutants.into_iter().next().expect("one mutant expected"),
            tests: vec![TestDescriptor::new("calc_tests", "sum_works")],
            baseline_ms: 5,
        }
    }

    #[test]
    fn unusable_worker_executable_is_a_fatal_infrastructure_failure() {
        let config = EngineConfig::default()
            .with_worker_exe("/nonexistent/bytemute-worker-missing")
            .with_workers(1);
        let scheduler = ExecutionScheduler::new(config, "/nonexistent/bundle.bin");
        let cancel = Arc::new(AtomicBool::new(false));

        let completions: Vec<Completion> =
            scheduler.run(vec![fixture_task()], cancel.clone()).iter().collect();
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0], Completion::Infrastructure(_)));
        assert!(cancel.load(Ordering::SeqCst), "fatal failure should cancel the pool");
    }

    #[test]
    fn infrastructure_failure_stops_remaining_tasks() {
        let config = EngineConfig::default()
            .with_worker_exe("/nonexistent/bytemute-worker-missing")
            .with_workers(1);
        let scheduler = ExecutionScheduler::new(config, "/nonexistent/bundle.bin");
        let cancel = Arc::new(AtomicBool::new(false));

        let tasks = vec![fixture_task(), fixture_task(), fixture_task()];
        let completions: Vec<Completion> = scheduler.run(tasks, cancel).iter().collect();
        // The first failure cancels the pool; the rest are never finalized.
        assert_eq!(completions.len(), 1);
    }

    #[test]
    fn cancelled_scheduler_finalizes_nothing() {
        let config = EngineConfig::default()
            .with_worker_exe("/nonexistent/bytemute-worker-missing")
            .with_workers(2);
        let scheduler = ExecutionScheduler::new(config, "/nonexistent/bundle.bin");
        let cancel = Arc::new(AtomicBool::new(true));

        let completions: Vec<Completion> =
            scheduler.run(vec![fixture_task()], cancel).iter().collect();
        assert!(completions.is_empty());
    }

    #[test]
    fn evaluation_results_reference_the_scheduled_mutant() {
        // Structural check on the result constructors the evaluator uses.
        let id = MutantId {
            unit: "calc".to_string(),
            unit_hash: 9,
            method: MethodId(0),
            block: BlockId(0),
            offset: 2,
            operator: "math_add_to_sub".to_string(),
            occurrence: 0,
        };
        let killed = MutationResult::killed(
            id.clone(),
            TestDescriptor::new("calc_tests", "sum_works"),
            1,
            12,
        );
        assert_eq!(killed.mutant, id);
        assert_eq!(killed.status, DetectionStatus::Killed);
        assert!(killed.invariant_holds());
    }
}
