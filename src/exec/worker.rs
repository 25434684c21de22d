//! Worker half of the isolated execution channel.
//!
//! A worker process loads the suite bundle it was spawned with, connects
//! back to the coordinator, serves exactly one job, and exits. A crash,
//! runaway loop, or corrupted state here can never touch the coordinator.

use std::collections::BTreeSet;
use std::net::TcpStream;
use std::path::Path;
use std::time::Instant;

use thiserror::Error;

use crate::config::ExecutionMode;
use crate::model::{BlockRef, MalformedUnitError, ProgramSet, decode_unit};
use crate::suite::{Assertion, BundleError, SuiteBundle, TestCase, TestDescriptor, TestVerdict};

use super::interp::{Interpreter, Trap};
use super::protocol::{
    JobKind, PROTOCOL_VERSION, ProtocolError, WireMessage, read_frame, write_frame,
};

/// Exit code signalling resource exhaustion inside the worker; the
/// coordinator classifies it as a memory error rather than a run error.
pub const MEMORY_EXIT_CODE: i32 = 73;

/// Worker-side failures; any of these end the process with a non-zero,
/// non-memory exit and surface as a run error on the coordinator.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Bundle could not be read or decoded.
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),
    /// A bundled or rewritten unit failed to decode.
    #[error("malformed unit: {0}")]
    Malformed(#[from] MalformedUnitError),
    /// Channel traffic violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Connection to the coordinator failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A job named a test the bundle does not hold.
    #[error("job names unknown test {0}")]
    UnknownTest(TestDescriptor),
}

/// Outcome of running one test in-process.
struct TestExecution {
    verdict: TestVerdict,
    detail: Option<String>,
    covered: Vec<BlockRef>,
    duration_ms: u64,
}

/// Serve one job: connect to `127.0.0.1:port`, execute, stream results.
///
/// Returns normally after `Done`; exits the process with
/// [`MEMORY_EXIT_CODE`] when the interpreter reports resource exhaustion.
pub fn serve(port: u16, bundle_path: &Path) -> Result<(), WorkerError> {
    let bundle = SuiteBundle::read_from(bundle_path)?;
    let mut set = ProgramSet::default();
    for bytes in &bundle.units {
        set.units.push(decode_unit(bytes)?);
    }

    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    let job = read_frame(&mut stream)?.ok_or(ProtocolError::UnexpectedMessage {
        expected: "job",
        got: "end of stream",
    })?;

    let WireMessage::Job {
        version,
        kind,
        tests,
        mode,
    } = job
    else {
        return Err(ProtocolError::UnexpectedMessage {
            expected: "job",
            got: job.label(),
        }
        .into());
    };
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: version,
        }
        .into());
    }

    let collect_coverage = matches!(kind, JobKind::Baseline);
    if let JobKind::Mutant {
        unit,
        rewritten_unit,
    } = kind
    {
        let decoded = decode_unit(&rewritten_unit)?;
        if decoded.name != unit || !set.replace_unit(decoded) {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "rewritten unit matching a bundled unit",
                got: "unknown unit",
            }
            .into());
        }
    }

    let mut executed = 0u32;
    let mut failed = 0u32;
    for descriptor in &tests {
        let case = bundle
            .test(descriptor)
            .ok_or_else(|| WorkerError::UnknownTest(descriptor.clone()))?;

        write_frame(
            &mut stream,
            &WireMessage::TestStarted {
                test: descriptor.clone(),
            },
        )?;

        let execution = run_test(&set, case, collect_coverage);
        executed += 1;
        if execution.verdict == TestVerdict::Fail {
            failed += 1;
        }

        write_frame(
            &mut stream,
            &WireMessage::TestResult {
                test: descriptor.clone(),
                verdict: execution.verdict,
                detail: execution.detail,
                duration_ms: execution.duration_ms,
                covered: execution.covered,
            },
        )?;

        if execution.verdict == TestVerdict::Fail && mode == ExecutionMode::StopOnFirstFailure {
            break;
        }
    }

    write_frame(&mut stream, &WireMessage::Done { executed, failed })?;
    Ok(())
}

fn run_test(set: &ProgramSet, case: &TestCase, collect_coverage: bool) -> TestExecution {
    let start = Instant::now();
    let mut covered: BTreeSet<BlockRef> = BTreeSet::new();
    let mut observer = |block: BlockRef| {
        if collect_coverage {
            covered.insert(block);
        }
    };

    let outcome = Interpreter::new(set).invoke(
        &case.target_unit,
        &case.target_method,
        &case.args,
        &mut observer,
    );

    let (verdict, detail) = match outcome {
        Ok(value) => match case.assertion {
            Assertion::Expects(expected) if value != expected => (
                TestVerdict::Fail,
                Some(format!("expected {expected}, got {value}")),
            ),
            _ => (TestVerdict::Pass, None),
        },
        Err(trap) if trap.is_resource_exhaustion() => {
            // Hard exit: the coordinator reads this from the exit code,
            // not the stream.
            std::process::exit(MEMORY_EXIT_CODE);
        }
        Err(trap) => (TestVerdict::Fail, Some(format!("trap: {trap}"))),
    };

    TestExecution {
        verdict,
        detail,
        covered: covered.into_iter().collect(),
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
