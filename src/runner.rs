//! Analysis run orchestration (new run, resume, interruption).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use thiserror::Error;

use crate::config::{EngineConfig, ExecutionMode};
use crate::coverage::{CoverageError, CoverageExporter, CoverageRecord, profile_baseline};
use crate::events::{RunEvent, now_timestamp_ms};
use crate::exec::scheduler::{Completion, EvaluationTask, ExecutionScheduler, SchedulerError};
use crate::model::decode_unit;
use crate::mutate::{FilterPipeline, Mutant, MutantGenerator, operators};
use crate::outcome::{MutationMatrix, MutationResult, ScoreCard};
use crate::select::TestSelector;
use crate::state::{RunSnapshot, StateError, append_event, replay_events};
use crate::suite::{BundleError, SuiteBundle, TestCase};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Whether a fatal error came from the environment or from the analysis
/// preconditions themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFailureKind {
    /// The surroundings are broken: workers cannot spawn, state cannot be
    /// written, channels cannot be read.
    Environment,
    /// The analysis input is unusable: red baseline, nothing to mutate.
    Analysis,
}

/// Fatal preconditions checked before any mutant is scheduled.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Every supplied unit failed to decode.
    #[error("no loadable units: every supplied unit failed to decode")]
    NoLoadableUnits,
    /// The suite holds no tests.
    #[error("empty test suite")]
    EmptySuite,
    /// A configured operator group does not exist.
    #[error("unknown operator group {0}")]
    UnknownOperatorGroup(String),
    /// Generation plus filtering left nothing to evaluate.
    #[error("no mutants found after filtering")]
    NoMutants,
    /// The pool cannot be empty.
    #[error("worker pool size must be at least 1")]
    ZeroWorkers,
}

/// Run orchestration errors.
#[derive(Debug, Error)]
pub enum RunError {
    /// Fatal precondition failure.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    /// Baseline profiling failure (red baseline or broken channel).
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    /// Run-log persistence failure.
    #[error("state error: {0}")]
    State(#[from] StateError),
    /// Bundle persistence failure.
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),
    /// Worker infrastructure failure.
    #[error("scheduler failure: {0}")]
    Scheduler(#[from] SchedulerError),
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Signal handler installation failed.
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

impl RunError {
    /// Classify the failure for the caller's diagnostics.
    pub fn classification(&self) -> RunFailureKind {
        match self {
            Self::Configuration(_) => RunFailureKind::Analysis,
            Self::Coverage(CoverageError::Baseline(_)) => RunFailureKind::Analysis,
            Self::Coverage(_)
            | Self::State(_)
            | Self::Bundle(_)
            | Self::Scheduler(_)
            | Self::Io(_)
            | Self::Signal(_) => RunFailureKind::Environment,
        }
    }
}

/// Completion-ordered consumer of finalized results; the seam the report
/// layer plugs into.
pub trait ResultSink {
    /// Receive one finalized result.
    fn accept(&mut self, result: &MutationResult);
}

/// Sink that retains every result, in completion order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// Results in completion order.
    pub results: Vec<MutationResult>,
}

impl ResultSink for CollectingSink {
    fn accept(&mut self, result: &MutationResult) {
        self.results.push(result.clone());
    }
}

/// Result returned by run/resume operations.
#[derive(Debug)]
pub struct RunOutcome {
    /// Run id.
    pub run_id: String,
    /// Path to the run directory.
    pub run_dir: PathBuf,
    /// Finalized results, in completion order.
    pub results: Vec<MutationResult>,
    /// Aggregate counts and score.
    pub score: ScoreCard,
    /// Full matrix; populated in run-all mode only.
    pub matrix: Option<MutationMatrix>,
    /// Materialized snapshot after the operation.
    pub snapshot: RunSnapshot,
}

fn install_signal_handler_once() -> Result<(), RunError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(RunError::Signal(msg.clone())),
    }
}

/// Request interruption of the current run; the embedding layer's
/// cancellation point, equivalent to a received interrupt signal.
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn generate_run_id() -> String {
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!("run-{}-{}-{}", now_timestamp_ms(), std::process::id(), seq)
}

fn events_path(run_dir: &Path) -> PathBuf {
    run_dir.join("events.jsonl")
}

fn validate(config: &EngineConfig, suite: &[TestCase]) -> Result<(), ConfigurationError> {
    if config.workers == 0 {
        return Err(ConfigurationError::ZeroWorkers);
    }
    if suite.is_empty() {
        return Err(ConfigurationError::EmptySuite);
    }
    for group in &config.operator_groups {
        if !operators::is_known_group(group) {
            return Err(ConfigurationError::UnknownOperatorGroup(group.clone()));
        }
    }
    Ok(())
}

struct Prepared {
    bundle_path: PathBuf,
    coverage: CoverageRecord,
    accepted: Vec<Mutant>,
}

fn prepare(
    config: &EngineConfig,
    run_id: &str,
    run_dir: &Path,
    events: &Path,
    unit_bytes: &[Vec<u8>],
    suite: &[TestCase],
    exporter: &mut dyn CoverageExporter,
) -> Result<Prepared, RunError> {
    // Decode what loads; a malformed unit is fatal for that unit only.
    let mut loaded_bytes = Vec::new();
    let mut units = Vec::new();
    for (index, bytes) in unit_bytes.iter().enumerate() {
        match decode_unit(bytes) {
            Ok(unit) => {
                loaded_bytes.push(bytes.clone());
                units.push(unit);
            }
            Err(err) => {
                append_event(
                    events,
                    &RunEvent::UnitRejected {
                        run_id: run_id.to_string(),
                        timestamp_ms: now_timestamp_ms(),
                        index,
                        error: err.to_string(),
                    },
                )?;
            }
        }
    }
    if units.is_empty() {
        return Err(ConfigurationError::NoLoadableUnits.into());
    }

    let bundle_path = run_dir.join("bundle.bin");
    let bundle = SuiteBundle {
        units: loaded_bytes,
        tests: suite.to_vec(),
    };
    bundle.write_to(&bundle_path)?;

    let descriptors: Vec<_> = suite.iter().map(|t| t.descriptor.clone()).collect();
    let coverage = profile_baseline(config, &bundle_path, &descriptors)?;
    append_event(
        events,
        &RunEvent::BaselineCompleted {
            run_id: run_id.to_string(),
            timestamp_ms: now_timestamp_ms(),
            tests: coverage.tests(),
            total_duration_ms: coverage.total_duration_ms(),
        },
    )?;
    exporter.export(&coverage);
    println!(
        "bytemute: baseline green, {} test(s) profiled in {} ms",
        coverage.tests(),
        coverage.total_duration_ms()
    );

    let generator = MutantGenerator::from_groups(&config.operator_groups)
        .expect("operator groups were validated before preparation");
    let pipeline = FilterPipeline::standard(&config.disabled_interceptors);

    let mut accepted = Vec::new();
    for unit in &units {
        let candidates = generator.generate(unit);
        accepted.extend(pipeline.apply(candidates, unit));
    }
    println!(
        "bytemute: {} mutant(s) accepted across {} unit(s)",
        accepted.len(),
        units.len()
    );

    Ok(Prepared {
        bundle_path,
        coverage,
        accepted,
    })
}

struct EvaluationRun {
    results: Vec<MutationResult>,
    matrix: Option<MutationMatrix>,
    interrupted: bool,
}

fn evaluate_mutants(
    config: &EngineConfig,
    run_id: &str,
    events: &Path,
    bundle_path: &Path,
    coverage: &CoverageRecord,
    mutants: Vec<Mutant>,
    sink: &mut dyn ResultSink,
) -> Result<EvaluationRun, RunError> {
    let mut results = Vec::new();
    let mut matrix = match config.mode {
        ExecutionMode::RunAll => Some(MutationMatrix::new()),
        ExecutionMode::StopOnFirstFailure => None,
    };

    let selector = TestSelector::new(coverage);
    let mut tasks = Vec::new();
    for mutant in mutants {
        let selection = selector.select(&mutant);
        if selection.is_empty() {
            // Finalized without ever opening a channel.
            let result = MutationResult::no_coverage(mutant.id.clone());
            append_event(
                events,
                &RunEvent::MutantFinished {
                    run_id: run_id.to_string(),
                    timestamp_ms: now_timestamp_ms(),
                    result: result.clone(),
                },
            )?;
            sink.accept(&result);
            results.push(result);
            continue;
        }
        tasks.push(EvaluationTask {
            mutant,
            tests: selection.tests,
            baseline_ms: selection.baseline_ms,
        });
    }

    if INTERRUPTED.load(Ordering::SeqCst) {
        append_event(
            events,
            &RunEvent::RunInterrupted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                reason: "received interrupt signal before dispatch".to_string(),
            },
        )?;
        return Ok(EvaluationRun {
            results,
            matrix,
            interrupted: true,
        });
    }

    let total = tasks.len();
    println!("bytemute: dispatching {total} mutant(s) across {} worker(s)", config.workers);
    for task in &tasks {
        append_event(
            events,
            &RunEvent::MutantStarted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                mutant: task.mutant.id.clone(),
            },
        )?;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let scheduler = ExecutionScheduler::new(config.clone(), bundle_path);
    let rx = scheduler.run(tasks, Arc::clone(&cancel));

    let mut infrastructure: Option<SchedulerError> = None;
    let mut finalized = 0usize;
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(Completion::Evaluated(evaluation)) => {
                append_event(
                    events,
                    &RunEvent::MutantFinished {
                        run_id: run_id.to_string(),
                        timestamp_ms: now_timestamp_ms(),
                        result: evaluation.result.clone(),
                    },
                )?;
                if let Some(matrix) = matrix.as_mut() {
                    for (test, verdict) in &evaluation.verdicts {
                        matrix.record(
                            evaluation.result.mutant.clone(),
                            test.clone(),
                            *verdict,
                        );
                    }
                }
                sink.accept(&evaluation.result);
                finalized += 1;
                println!(
                    "bytemute: {finalized}/{total} finalized: {}",
                    evaluation.result.mutant
                );
                results.push(evaluation.result);
            }
            Ok(Completion::Infrastructure(err)) => {
                infrastructure = Some(err);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if INTERRUPTED.load(Ordering::SeqCst) {
                    cancel.store(true, Ordering::SeqCst);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(err) = infrastructure {
        return Err(err.into());
    }

    let interrupted = INTERRUPTED.load(Ordering::SeqCst);
    if interrupted {
        append_event(
            events,
            &RunEvent::RunInterrupted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                reason: "received interrupt signal".to_string(),
            },
        )?;
    }

    Ok(EvaluationRun {
        results,
        matrix,
        interrupted,
    })
}

/// Start a new analysis run: load, profile, generate, filter, select,
/// schedule, aggregate.
pub fn run_new(
    config: &EngineConfig,
    unit_bytes: &[Vec<u8>],
    suite: &[TestCase],
    exporter: &mut dyn CoverageExporter,
    sink: &mut dyn ResultSink,
) -> Result<RunOutcome, RunError> {
    install_signal_handler_once()?;
    INTERRUPTED.store(false, Ordering::SeqCst);
    validate(config, suite)?;

    let run_id = generate_run_id();
    let run_dir = config.run_root.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;
    let events = events_path(&run_dir);

    append_event(
        &events,
        &RunEvent::RunStarted {
            run_id: run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            config: config.clone(),
        },
    )?;

    let prepared = prepare(config, &run_id, &run_dir, &events, unit_bytes, suite, exporter)?;
    if prepared.accepted.is_empty() {
        return Err(ConfigurationError::NoMutants.into());
    }

    for mutant in &prepared.accepted {
        append_event(
            &events,
            &RunEvent::MutantDiscovered {
                run_id: run_id.clone(),
                timestamp_ms: now_timestamp_ms(),
                mutant: mutant.id.clone(),
                description: mutant.description.clone(),
                line: mutant.line,
            },
        )?;
    }

    let evaluation = evaluate_mutants(
        config,
        &run_id,
        &events,
        &prepared.bundle_path,
        &prepared.coverage,
        prepared.accepted,
        sink,
    )?;

    finish_run(&run_id, run_dir, &events, evaluation)
}

/// Resume an existing run id: reschedule only mutants without a terminal
/// status, preserving every prior outcome.
pub fn resume_run(
    config: &EngineConfig,
    run_id: &str,
    unit_bytes: &[Vec<u8>],
    suite: &[TestCase],
    exporter: &mut dyn CoverageExporter,
    sink: &mut dyn ResultSink,
) -> Result<RunOutcome, RunError> {
    install_signal_handler_once()?;
    INTERRUPTED.store(false, Ordering::SeqCst);
    validate(config, suite)?;

    let run_dir = config.run_root.join(run_id);
    let events = events_path(&run_dir);
    let snapshot = replay_events(&events)?;
    let pending = snapshot.pending_mutants();

    if snapshot.completed && pending.is_empty() {
        println!("bytemute: run {run_id} already completed");
        let results: Vec<MutationResult> = snapshot
            .mutants
            .values()
            .filter_map(|m| m.result.clone())
            .collect();
        let score = ScoreCard::from_results(&results);
        return Ok(RunOutcome {
            run_id: run_id.to_string(),
            run_dir,
            results,
            score,
            matrix: None,
            snapshot,
        });
    }

    println!(
        "bytemute: resuming run {run_id}, {} mutant(s) remaining",
        pending.len()
    );
    append_event(
        &events,
        &RunEvent::RunResumed {
            run_id: run_id.to_string(),
            timestamp_ms: now_timestamp_ms(),
            remaining: pending.len(),
        },
    )?;

    let prepared = prepare(config, run_id, &run_dir, &events, unit_bytes, suite, exporter)?;

    // Regeneration is deterministic, so pending identities resolve to
    // freshly generated mutants; anything left over no longer exists in
    // this program version and is finalized as a run error.
    let mut regenerated: BTreeMap<String, Mutant> = prepared
        .accepted
        .into_iter()
        .map(|m| (m.id.to_string(), m))
        .collect();

    let mut to_run = Vec::new();
    for id in pending {
        match regenerated.remove(&id.to_string()) {
            Some(mutant) => to_run.push(mutant),
            None => {
                let result = MutationResult::run_error(
                    id,
                    "mutant is no longer generated for this program",
                    0,
                    0,
                );
                append_event(
                    &events,
                    &RunEvent::MutantFinished {
                        run_id: run_id.to_string(),
                        timestamp_ms: now_timestamp_ms(),
                        result: result.clone(),
                    },
                )?;
                sink.accept(&result);
            }
        }
    }

    let evaluation = evaluate_mutants(
        config,
        run_id,
        &events,
        &prepared.bundle_path,
        &prepared.coverage,
        to_run,
        sink,
    )?;

    finish_run(run_id, run_dir, &events, evaluation)
}

fn finish_run(
    run_id: &str,
    run_dir: PathBuf,
    events: &Path,
    evaluation: EvaluationRun,
) -> Result<RunOutcome, RunError> {
    let snapshot = replay_events(events)?;
    let score = snapshot.score_card();

    if !evaluation.interrupted {
        append_event(
            events,
            &RunEvent::RunCompleted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                score: score.score(),
            },
        )?;
    }

    let snapshot = replay_events(events)?;
    Ok(RunOutcome {
        run_id: run_id.to_string(),
        run_dir,
        results: evaluation.results,
        score,
        matrix: evaluation.matrix.filter(|m| !m.is_empty()),
        snapshot,
    })
}

/// Load a run's snapshot without executing anything.
pub fn load_run_status(config: &EngineConfig, run_id: &str) -> Result<RunSnapshot, RunError> {
    let events = events_path(&config.run_root.join(run_id));
    Ok(replay_events(&events)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{BaselineFailureError, NullExporter};

    #[test]
    fn validation_rejects_bad_configuration_before_any_io() {
        let config = EngineConfig::default().with_workers(0);
        let err = validate(&config, &[]).expect_err("zero workers should fail");
        assert!(matches!(err, ConfigurationError::ZeroWorkers));

        let config = EngineConfig::default();
        let err = validate(&config, &[]).expect_err("empty suite should fail");
        assert!(matches!(err, ConfigurationError::EmptySuite));

        let config =
            EngineConfig::default().with_operator_groups(["BOGUS".to_string()]);
        let suite = vec![crate::suite::TestCase::invoking(
            crate::suite::TestDescriptor::new("t", "a"),
            "calc",
            "sum",
            vec![],
        )];
        let err = validate(&config, &suite).expect_err("unknown group should fail");
        assert!(matches!(err, ConfigurationError::UnknownOperatorGroup(_)));
    }

    #[test]
    fn classification_splits_environment_from_analysis() {
        let analysis: RunError = ConfigurationError::NoMutants.into();
        assert_eq!(analysis.classification(), RunFailureKind::Analysis);

        let analysis: RunError = CoverageError::Baseline(BaselineFailureError {
            failures: vec![],
        })
        .into();
        assert_eq!(analysis.classification(), RunFailureKind::Analysis);

        let environment: RunError = CoverageError::Incomplete {
            seen: 0,
            expected: 3,
        }
        .into();
        assert_eq!(environment.classification(), RunFailureKind::Environment);

        let environment: RunError =
            RunError::Io(std::io::Error::other("disk is gone"));
        assert_eq!(environment.classification(), RunFailureKind::Environment);
    }

    #[test]
    fn run_ids_are_unique_and_parseable_shape() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
        assert_eq!(a.split('-').count(), 4);
    }

    #[test]
    fn collecting_sink_preserves_completion_order() {
        use crate::model::{BlockId, MethodId};
        use crate::mutate::MutantId;

        let id = |offset: u32| MutantId {
            unit: "calc".to_string(),
            unit_hash: 1,
            method: MethodId(0),
            block: BlockId(0),
            offset,
            operator: "math_add_to_sub".to_string(),
            occurrence: 0,
        };

        let mut sink = CollectingSink::default();
        sink.accept(&MutationResult::survived(id(3), 1, 1));
        sink.accept(&MutationResult::no_coverage(id(1)));
        assert_eq!(sink.results[0].mutant.offset, 3);
        assert_eq!(sink.results[1].mutant.offset, 1);
    }

    #[test]
    fn null_exporter_is_a_valid_collaborator() {
        let mut exporter = NullExporter;
        exporter.export(&CoverageRecord::default());
    }
}
