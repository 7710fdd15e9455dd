use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{PipelineState, Stage};
use crate::contract::{ContractId, ContractPayload, Decision};
use crate::error::FailureKind;

/// A single failed attempt of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Terminal failure of a job, recorded for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    /// Whether a fresh submission might succeed.
    pub retriable: bool,
}

impl FailureDetail {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            retriable,
        }
    }

    pub fn from_stage_error(stage: Stage, err: StageError) -> Self {
        let retriable = err.kind.is_transient();
        Self {
            stage,
            kind: err.kind,
            message: err.message,
            retriable,
        }
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.kind, self.message)
    }
}

/// Tracks the lifecycle status of a job in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-stage retry bounds for transient failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub extract_max_retries: u32,
    pub validate_max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            extract_max_retries: 1,
            validate_max_retries: 1,
            base_delay_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Retries allowed within `stage`. Only model-facing stages retry.
    pub fn bound_for(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Extract => self.extract_max_retries,
            Stage::Validate => self.validate_max_retries,
            Stage::Ingest | Stage::Route | Stage::Persist => 0,
        }
    }

    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// State owned by the orchestrator for the duration of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub request_id: String,
    pub state: PipelineState,
    pub state_history: Vec<Stage>,
    /// Retries spent in the current stage.
    pub stage_retries: u32,
    /// Retries spent across the whole run.
    pub retry_count: u32,
    pub retry_config: RetryConfig,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(request_id: String, retry_config: RetryConfig) -> Self {
        Self {
            request_id,
            state: PipelineState::At(Stage::Ingest),
            state_history: Vec::new(),
            stage_retries: 0,
            retry_count: 0,
            retry_config,
            started_at: Utc::now(),
        }
    }

    /// The stage the run ended in (or is currently at).
    pub fn final_stage(&self) -> Stage {
        match &self.state {
            PipelineState::At(stage) => *stage,
            PipelineState::Failed(detail) => detail.stage,
            PipelineState::Done => Stage::Persist,
        }
    }
}

/// Audit entry written once per terminal job, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub request_id: String,
    pub contract_id: Option<ContractId>,
    pub sender: String,
    pub subject: String,
    pub filename: String,
    pub final_stage: Stage,
    pub status: JobStatus,
    pub decision: Option<Decision>,
    pub failure: Option<FailureDetail>,
    /// Set when the decision was reached but the contract write failed.
    pub persistence_error: Option<String>,
    pub state_transitions: Vec<Stage>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl ProcessingLogEntry {
    /// Build the audit entry for a finished run.
    pub fn from_run(run: &PipelineRun, payload: &ContractPayload) -> Self {
        let now = Utc::now();
        let (status, failure) = match &run.state {
            PipelineState::Failed(detail) => (JobStatus::Failed, Some(detail.clone())),
            PipelineState::Done => (JobStatus::Completed, None),
            PipelineState::At(_) => (JobStatus::Running, None),
        };

        Self {
            request_id: run.request_id.clone(),
            contract_id: None,
            sender: payload.sender.clone(),
            subject: payload.subject.clone(),
            filename: payload.filename.clone(),
            final_stage: run.final_stage(),
            status,
            decision: None,
            failure,
            persistence_error: None,
            state_transitions: run.state_history.clone(),
            retry_count: run.retry_count,
            started_at: run.started_at,
            completed_at: now,
            duration_ms: (now - run.started_at).num_milliseconds(),
        }
    }

    /// Build the audit entry for a job whose worker crashed mid-run.
    pub fn for_fault(request_id: &str, payload: &ContractPayload, failure: FailureDetail) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.to_string(),
            contract_id: None,
            sender: payload.sender.clone(),
            subject: payload.subject.clone(),
            filename: payload.filename.clone(),
            final_stage: failure.stage,
            status: JobStatus::Failed,
            decision: None,
            failure: Some(failure),
            persistence_error: None,
            state_transitions: Vec::new(),
            retry_count: 0,
            started_at: payload.received_at,
            completed_at: now,
            duration_ms: (now - payload.received_at).num_milliseconds(),
        }
    }
}
