//! Event replay and run-state projection.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use crate::events::RunEvent;
use crate::mutate::MutantId;
use crate::outcome::{DetectionStatus, MutationResult, ScoreCard};

/// Per-mutant state in a replay snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MutantState {
    /// Mutant identity.
    pub id: MutantId,
    /// Human-readable description.
    pub description: String,
    /// Source line of the mutation site.
    pub line: u32,
    /// Derived status; `NotStarted` until a finished event lands.
    pub status: DetectionStatus,
    /// Whether a started event was seen without a finished one.
    pub dispatched: bool,
    /// Terminal result, once finalized.
    pub result: Option<MutationResult>,
}

/// Materialized run state derived from `events.jsonl`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    /// Run id.
    pub run_id: String,
    /// Mutants keyed by their display id.
    pub mutants: BTreeMap<String, MutantState>,
    /// Malformed event lines ignored during replay.
    pub malformed_lines: usize,
    /// Whether any interruption event occurred.
    pub interrupted: bool,
    /// Whether a completion event occurred.
    pub completed: bool,
}

impl RunSnapshot {
    /// Mutants without a terminal status; the resume queue.
    pub fn pending_mutants(&self) -> Vec<MutantId> {
        self.mutants
            .values()
            .filter(|m| !m.status.is_terminal())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Aggregate counts over the snapshot.
    pub fn score_card(&self) -> ScoreCard {
        let mut card = ScoreCard::default();
        for state in self.mutants.values() {
            match &state.result {
                Some(result) => card.add(result),
                None => card.add(&MutationResult::not_started(state.id.clone())),
            }
        }
        card
    }
}

/// State replay errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Replay an event log into a snapshot, tolerating a malformed tail.
pub fn replay_events(events_path: &Path) -> Result<RunSnapshot, StateError> {
    let file = std::fs::File::open(events_path)?;
    let reader = BufReader::new(file);

    let mut snapshot = RunSnapshot::default();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<RunEvent>(&line) {
            Ok(event) => event,
            Err(_) => {
                snapshot.malformed_lines += 1;
                continue;
            }
        };

        match event {
            RunEvent::RunStarted { run_id, .. } | RunEvent::RunResumed { run_id, .. } => {
                if snapshot.run_id.is_empty() {
                    snapshot.run_id = run_id;
                }
            }
            RunEvent::UnitRejected { .. } | RunEvent::BaselineCompleted { .. } => {}
            RunEvent::MutantDiscovered {
                mutant,
                description,
                line,
                ..
            } => {
                snapshot.mutants.insert(
                    mutant.to_string(),
                    MutantState {
                        id: mutant,
                        description,
                        line,
                        status: DetectionStatus::NotStarted,
                        dispatched: false,
                        result: None,
                    },
                );
            }
            RunEvent::MutantStarted { mutant, .. } => {
                if let Some(state) = snapshot.mutants.get_mut(&mutant.to_string()) {
                    state.dispatched = true;
                }
            }
            RunEvent::MutantFinished { result, .. } => {
                if let Some(state) = snapshot.mutants.get_mut(&result.mutant.to_string()) {
                    state.status = result.status;
                    state.result = Some(result);
                }
            }
            RunEvent::RunInterrupted { .. } => {
                snapshot.interrupted = true;
            }
            RunEvent::RunCompleted { .. } => {
                snapshot.completed = true;
            }
        }
    }

    Ok(snapshot)
}

/// Append one event as a JSONL line.
pub fn append_event(events_path: &Path, event: &RunEvent) -> Result<(), StateError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path)?;
    let json = serde_json::to_string(event).expect("run events should serialize");
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}
