mod job;
mod state;

pub use job::{
    FailureDetail, JobStatus, PipelineRun, ProcessingLogEntry, RetryConfig, StageError,
};
pub use state::{PipelineState, Stage, StageCursor, StateMachine, Transition};
