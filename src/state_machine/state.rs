use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use super::job::{FailureDetail, PipelineRun, StageError};

/// The five ordered stages every contract passes through.
///
/// Each job flows through: INGEST → EXTRACT → VALIDATE → ROUTE → PERSIST
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Extract,
    Validate,
    Route,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Ingest,
        Stage::Extract,
        Stage::Validate,
        Stage::Route,
        Stage::Persist,
    ];

    /// The stage that follows this one, or `None` after `Persist`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Ingest => Some(Stage::Extract),
            Stage::Extract => Some(Stage::Validate),
            Stage::Validate => Some(Stage::Route),
            Stage::Route => Some(Stage::Persist),
            Stage::Persist => None,
        }
    }

    fn index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ingest => write!(f, "INGEST"),
            Stage::Extract => write!(f, "EXTRACT"),
            Stage::Validate => write!(f, "VALIDATE"),
            Stage::Route => write!(f, "ROUTE"),
            Stage::Persist => write!(f, "PERSIST"),
        }
    }
}

/// Progress marker for a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineState {
    At(Stage),
    Done,
    Failed(FailureDetail),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::At(_))
    }
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next stage.
    Next(Stage),
    /// Run the current stage again with the same inputs.
    Retry {
        stage: Stage,
        attempt: u32,
        reason: StageError,
    },
    /// All five stages succeeded.
    Done,
    /// The run ended in a terminal failure.
    Failed(FailureDetail),
}

/// Drives a [`PipelineRun`] through the stages.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the next transition for `run` given the outcome of
    /// its current stage.
    ///
    /// - Success advances to the following stage, or to `Done` after `Persist`.
    /// - A transient failure retries the same stage while the stage's retry
    ///   bound allows; otherwise, and for every non-transient failure, the run
    ///   becomes `Failed(stage, cause)`.
    /// - Terminal states are sticky and report themselves again.
    pub fn next(run: &mut PipelineRun, outcome: Result<(), StageError>) -> Transition {
        let stage = match &run.state {
            PipelineState::At(stage) => *stage,
            PipelineState::Done => return Transition::Done,
            PipelineState::Failed(detail) => return Transition::Failed(detail.clone()),
        };

        let transition = match outcome {
            Ok(()) => match stage.next() {
                Some(next) => Transition::Next(next),
                None => Transition::Done,
            },
            Err(err) => Self::handle_failure(run, stage, err),
        };

        run.state_history.push(stage);
        match &transition {
            Transition::Next(next) => {
                run.state = PipelineState::At(*next);
                run.stage_retries = 0;
            }
            Transition::Retry { .. } => {
                // Counters were already bumped in handle_failure.
            }
            Transition::Done => run.state = PipelineState::Done,
            Transition::Failed(detail) => run.state = PipelineState::Failed(detail.clone()),
        }

        transition
    }

    fn handle_failure(run: &mut PipelineRun, stage: Stage, err: StageError) -> Transition {
        let bound = run.retry_config.bound_for(stage);
        if err.kind.is_transient() && run.stage_retries < bound {
            run.stage_retries += 1;
            run.retry_count += 1;
            Transition::Retry {
                stage,
                attempt: run.stage_retries,
                reason: err,
            }
        } else {
            Transition::Failed(FailureDetail::from_stage_error(stage, err))
        }
    }
}

/// Shared, lock-free view of the stage a run is currently in.
///
/// The worker keeps a clone so it can attribute a crash to the right stage.
#[derive(Debug, Clone, Default)]
pub struct StageCursor(Arc<AtomicU8>);

impl StageCursor {
    pub fn set(&self, stage: Stage) {
        self.0.store(stage.index(), Ordering::Release);
    }

    pub fn get(&self) -> Stage {
        let idx = self.0.load(Ordering::Acquire) as usize;
        Stage::ALL.get(idx).copied().unwrap_or(Stage::Ingest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::state_machine::job::RetryConfig;

    fn make_run(extract: u32, validate: u32) -> PipelineRun {
        PipelineRun::new(
            "req-1".to_string(),
            RetryConfig {
                extract_max_retries: extract,
                validate_max_retries: validate,
                base_delay_ms: 0,
            },
        )
    }

    fn schema(msg: &str) -> StageError {
        StageError::new(FailureKind::SchemaViolation, msg)
    }

    #[test]
    fn happy_path_walks_all_stages() {
        let mut run = make_run(1, 1);
        assert_eq!(run.state, PipelineState::At(Stage::Ingest));

        for expected in [Stage::Extract, Stage::Validate, Stage::Route, Stage::Persist] {
            let t = StateMachine::next(&mut run, Ok(()));
            assert_eq!(t, Transition::Next(expected));
            assert_eq!(run.state, PipelineState::At(expected));
        }

        let t = StateMachine::next(&mut run, Ok(()));
        assert_eq!(t, Transition::Done);
        assert_eq!(run.state, PipelineState::Done);

        // Done is terminal.
        assert_eq!(StateMachine::next(&mut run, Ok(())), Transition::Done);
        assert_eq!(run.state_history, Stage::ALL.to_vec());
    }

    #[test]
    fn ingest_failure_is_never_retried() {
        let mut run = make_run(3, 3);
        let t = StateMachine::next(
            &mut run,
            Err(StageError::new(FailureKind::InvalidDocument, "not a pdf")),
        );
        match t {
            Transition::Failed(detail) => {
                assert_eq!(detail.stage, Stage::Ingest);
                assert_eq!(detail.kind, FailureKind::InvalidDocument);
                assert!(!detail.retriable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(run.state.is_terminal());
        assert_eq!(run.retry_count, 0);
    }

    #[test]
    fn extract_retries_up_to_bound_then_fails() {
        let mut run = make_run(2, 0);
        StateMachine::next(&mut run, Ok(()));
        assert_eq!(run.state, PipelineState::At(Stage::Extract));

        let t = StateMachine::next(&mut run, Err(schema("bad json")));
        assert!(matches!(t, Transition::Retry { attempt: 1, .. }));
        let t = StateMachine::next(&mut run, Err(schema("bad json again")));
        assert!(matches!(t, Transition::Retry { attempt: 2, .. }));

        let t = StateMachine::next(&mut run, Err(schema("still bad")));
        match t {
            Transition::Failed(detail) => {
                assert_eq!(detail.stage, Stage::Extract);
                assert_eq!(detail.kind, FailureKind::SchemaViolation);
                assert_eq!(detail.message, "still bad");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(run.retry_count, 2);
        assert_eq!(
            run.state_history,
            vec![Stage::Ingest, Stage::Extract, Stage::Extract, Stage::Extract]
        );
    }

    #[test]
    fn retry_budget_resets_per_stage() {
        let mut run = make_run(1, 1);
        StateMachine::next(&mut run, Ok(()));
        assert!(matches!(
            StateMachine::next(&mut run, Err(schema("x"))),
            Transition::Retry { stage: Stage::Extract, .. }
        ));
        StateMachine::next(&mut run, Ok(()));
        assert!(matches!(
            StateMachine::next(
                &mut run,
                Err(StageError::new(FailureKind::ProviderError, "503"))
            ),
            Transition::Retry { stage: Stage::Validate, attempt: 1, .. }
        ));
        assert_eq!(StateMachine::next(&mut run, Ok(())), Transition::Next(Stage::Route));
        assert_eq!(run.retry_count, 2);
    }

    #[test]
    fn persist_storage_error_fails_without_retry() {
        let mut run = make_run(1, 1);
        for _ in 0..4 {
            StateMachine::next(&mut run, Ok(()));
        }
        let t = StateMachine::next(
            &mut run,
            Err(StageError::new(FailureKind::StorageError, "store offline")),
        );
        assert!(matches!(t, Transition::Failed(ref d) if d.stage == Stage::Persist));
    }

    #[test]
    fn cursor_tracks_stage() {
        let cursor = StageCursor::default();
        assert_eq!(cursor.get(), Stage::Ingest);
        let shared = cursor.clone();
        shared.set(Stage::Validate);
        assert_eq!(cursor.get(), Stage::Validate);
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Ingest.to_string(), "INGEST");
        assert_eq!(Stage::Persist.to_string(), "PERSIST");
        assert_eq!(Stage::Persist.next(), None);
    }
}
