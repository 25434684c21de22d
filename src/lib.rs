//! # bytemute
//!
//! `bytemute` is an instruction-level mutation-analysis engine. It measures
//! the real fault-detection strength of a test suite by systematically
//! altering compiled program logic ("mutants"), re-running the relevant
//! tests against each altered version in an isolated worker process, and
//! recording whether any test detects the change.
//!
//! The crate is organized around:
//! - `model`: binary program units decoded into methods, blocks, and
//!   instructions
//! - `coverage`: one instrumented baseline run producing the coverage
//!   record
//! - `mutate`: operator registry, deterministic generation, and the
//!   filter pipeline
//! - `select`: coverage-driven minimal test subsets
//! - `exec`: wire protocol, isolated worker channels, and the bounded
//!   concurrent scheduler
//! - `outcome`: detection statuses, the mutation matrix, and the score
//! - `runner`: end-to-end orchestration with an append-only run log
//!
//! Report rendering, CLI option parsing, and artifact discovery belong to
//! the layers embedding this engine, not to the engine itself.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod config;
pub mod coverage;
pub mod events;
pub mod exec;
pub mod model;
pub mod mutate;
pub mod outcome;
pub mod runner;
pub mod select;
pub mod state;
pub mod suite;

pub use config::{EngineConfig, ExecutionMode};
pub use coverage::{
    BaselineFailureError, CoverageError, CoverageExporter, CoverageRecord, NullExporter,
};
pub use model::{MalformedUnitError, ProgramSet, ProgramUnit};
pub use mutate::{FilterPipeline, Mutant, MutantGenerator, MutantId, MutationOperator};
pub use outcome::{DetectionStatus, MutationMatrix, MutationResult, ScoreCard};
pub use runner::{
    CollectingSink, ConfigurationError, ResultSink, RunError, RunFailureKind, RunOutcome,
    load_run_status, request_interrupt, resume_run, run_new,
};
pub use select::TestSelector;
pub use suite::{Assertion, SuiteBundle, TestCase, TestDescriptor, TestVerdict};
