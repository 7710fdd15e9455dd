use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cleaning::clean_fields;
use crate::collaborators::{Collaborators, Store, StoreError};
use crate::contract::{
    ContractPayload, Decision, ExtractedFields, Outcome, RoutingDecision, ValidationReport,
};
use crate::document::{IngestLimits, check_pdf};
use crate::error::FailureKind;
use crate::router::Router;
use crate::state_machine::{
    FailureDetail, PipelineRun, PipelineState, ProcessingLogEntry, RetryConfig, Stage,
    StageCursor, StageError, StateMachine, Transition,
};

/// Knobs for a single pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub retry: RetryConfig,
    pub ingest: IngestLimits,
    pub max_input_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            ingest: IngestLimits::default(),
            max_input_chars: 24_000,
        }
    }
}

/// Stage outputs accumulated while a run moves forward.
#[derive(Default)]
struct StageOutputs {
    text: Option<String>,
    fields: Option<ExtractedFields>,
    report: Option<ValidationReport>,
    routing: Option<RoutingDecision>,
}

fn upstream<'a, T>(value: &'a Option<T>, what: &str) -> Result<&'a T, StageError> {
    value
        .as_ref()
        .ok_or_else(|| StageError::new(FailureKind::WorkerFault, format!("{what} missing from an earlier stage")))
}

/// Drives contracts through INGEST → EXTRACT → VALIDATE → ROUTE → PERSIST.
pub struct ContractOrchestrator {
    collaborators: Collaborators,
    router: Router,
    settings: PipelineSettings,
}

impl ContractOrchestrator {
    pub fn new(collaborators: Collaborators, router: Router, settings: PipelineSettings) -> Self {
        Self {
            collaborators,
            router,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.collaborators.store
    }

    /// Run one contract through every stage.
    ///
    /// `commit` records the result wherever the caller tracks the job and
    /// reports whether this run's result is the one that stuck. The
    /// processing-log entry is written only when it did, so a run that lost
    /// to another terminal write (the reaper, a crash handler) leaves no
    /// second entry behind. `cursor` always holds the stage being executed.
    pub async fn run<F>(
        &self,
        request_id: &str,
        payload: &ContractPayload,
        cursor: &StageCursor,
        commit: F,
    ) -> Result<Outcome, FailureDetail>
    where
        F: FnOnce(&Result<Outcome, FailureDetail>) -> bool + Send,
    {
        let (result, entry) = self.drive(request_id, payload, cursor).await;
        if commit(&result) {
            self.write_log(&entry).await;
        } else {
            warn!(request_id, status = ?entry.status, "result superseded, log entry dropped");
        }
        result
    }

    async fn drive(
        &self,
        request_id: &str,
        payload: &ContractPayload,
        cursor: &StageCursor,
    ) -> (Result<Outcome, FailureDetail>, ProcessingLogEntry) {
        let mut run = PipelineRun::new(request_id.to_string(), self.settings.retry);
        let mut outputs = StageOutputs::default();
        info!(request_id, filename = %payload.filename, "pipeline started");

        while let PipelineState::At(stage) = run.state {
            cursor.set(stage);
            if stage == Stage::Persist {
                break;
            }

            let outcome = self.execute(stage, payload, &mut outputs).await;
            match StateMachine::next(&mut run, outcome) {
                Transition::Next(next) => {
                    debug!(request_id, from = %stage, to = %next, "stage complete");
                }
                Transition::Retry { stage, attempt, reason } => {
                    let delay_ms = run.retry_config.delay_for_attempt(attempt);
                    warn!(
                        request_id,
                        stage = %stage,
                        attempt,
                        max = run.retry_config.bound_for(stage),
                        delay_ms,
                        reason = %reason,
                        "retrying stage"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Transition::Failed(_) | Transition::Done => {}
            }
        }

        if matches!(run.state, PipelineState::Failed(_)) {
            cursor.set(Stage::Persist);
            return Self::finish_failed(&run, payload);
        }

        self.persist(run, payload, outputs).await
    }

    async fn execute(
        &self,
        stage: Stage,
        payload: &ContractPayload,
        outputs: &mut StageOutputs,
    ) -> Result<(), StageError> {
        match stage {
            Stage::Ingest => {
                check_pdf(&payload.bytes, self.settings.ingest)
                    .map_err(|e| StageError::new(FailureKind::InvalidDocument, e.to_string()))?;
                let text = self.collaborators.extractor.extract_text(&payload.bytes).await?;
                if text.trim().is_empty() {
                    return Err(StageError::new(FailureKind::InvalidDocument, "document has no text"));
                }
                outputs.text = Some(text);
            }
            Stage::Extract => {
                let text = upstream(&outputs.text, "document text")?;
                let raw = self
                    .collaborators
                    .extractor
                    .extract_fields(text, self.settings.max_input_chars)
                    .await?;
                let fields = clean_fields(&raw)
                    .map_err(|e| StageError::new(FailureKind::SchemaViolation, e.to_string()))?;
                outputs.fields = Some(fields);
            }
            Stage::Validate => {
                let fields = upstream(&outputs.fields, "extracted fields")?;
                let chunks = self.collaborators.retriever.retrieve(fields).await?;
                let raw = self.collaborators.validator.validate(fields, &chunks).await?;
                let report: ValidationReport = serde_json::from_value(raw).map_err(|e| {
                    StageError::new(FailureKind::SchemaViolation, format!("validation report: {e}"))
                })?;
                report
                    .check()
                    .map_err(|msg| StageError::new(FailureKind::SchemaViolation, msg))?;
                outputs.report = Some(report);
            }
            Stage::Route => {
                let fields = upstream(&outputs.fields, "extracted fields")?;
                let report = upstream(&outputs.report, "validation report")?;
                let routing = self.router.route(
                    Some(report.confidence),
                    report.requires_human_review,
                    &report.violations,
                    fields,
                );
                outputs.routing = Some(routing);
            }
            Stage::Persist => {}
        }
        Ok(())
    }

    /// PERSIST: the contract record, a review-queue entry when routed to
    /// review, and the processing log. A failed write keeps the decision.
    async fn persist(
        &self,
        mut run: PipelineRun,
        payload: &ContractPayload,
        outputs: StageOutputs,
    ) -> (Result<Outcome, FailureDetail>, ProcessingLogEntry) {
        let request_id = run.request_id.clone();
        let (fields, report, routing) = match (outputs.fields, outputs.report, outputs.routing) {
            (Some(f), Some(r), Some(d)) => (f, r, d),
            _ => {
                let err = StageError::new(FailureKind::WorkerFault, "persist reached without a routing decision");
                StateMachine::next(&mut run, Err(err));
                return Self::finish_failed(&run, payload);
            }
        };

        let mut outcome = Outcome {
            decision: routing.decision,
            risk_level: routing.risk_level,
            requires_review: routing.decision == Decision::Review,
            extracted_fields: fields,
            violations: report.violations,
            reasons: routing.reasons,
            contract_record_id: request_id.clone(),
            persisted: false,
        };

        let store = &self.collaborators.store;
        let mut persistence_error = None;
        match store.save_contract(&request_id, &outcome.extracted_fields, &outcome).await {
            Ok(contract_id) => {
                outcome.contract_record_id = contract_id;
                outcome.persisted = true;
                if outcome.decision == Decision::Review {
                    if let Err(e) = store.enqueue_review(&outcome.contract_record_id, &outcome).await {
                        error!(request_id, error = %e, "review queue write failed");
                        persistence_error = Some(e.to_string());
                    }
                }
            }
            Err(StoreError::Unavailable(msg)) => {
                let err = StageError::new(FailureKind::StorageError, msg);
                StateMachine::next(&mut run, Err(err));
                return Self::finish_failed(&run, payload);
            }
            Err(e) => {
                error!(request_id, error = %e, "contract write failed, keeping decision");
                persistence_error = Some(e.to_string());
            }
        }

        StateMachine::next(&mut run, Ok(()));

        let mut entry = ProcessingLogEntry::from_run(&run, payload);
        entry.contract_id = outcome.persisted.then(|| outcome.contract_record_id.clone());
        entry.decision = Some(outcome.decision);
        entry.persistence_error = persistence_error;

        info!(
            request_id,
            decision = %outcome.decision,
            risk_level = %outcome.risk_level,
            contract_id = %outcome.contract_record_id,
            retries = run.retry_count,
            "pipeline complete"
        );
        (Ok(outcome), entry)
    }

    fn finish_failed(
        run: &PipelineRun,
        payload: &ContractPayload,
    ) -> (Result<Outcome, FailureDetail>, ProcessingLogEntry) {
        let entry = ProcessingLogEntry::from_run(run, payload);
        let result = match &run.state {
            PipelineState::Failed(detail) => {
                warn!(request_id = %run.request_id, failure = %detail, "pipeline failed");
                Err(detail.clone())
            }
            _ => Err(FailureDetail::new(
                run.final_stage(),
                FailureKind::WorkerFault,
                "run ended in an unexpected state",
                false,
            )),
        };
        (result, entry)
    }

    /// Audit entry for a job that ended without its run logging: a crashed
    /// worker, or a job the reaper abandoned.
    pub async fn record_fault(&self, request_id: &str, payload: &ContractPayload, failure: FailureDetail) {
        let entry = ProcessingLogEntry::for_fault(request_id, payload, failure);
        self.write_log(&entry).await;
    }

    async fn write_log(&self, entry: &ProcessingLogEntry) {
        if let Err(e) = self.collaborators.store.append_log(entry).await {
            error!(request_id = %entry.request_id, error = %e, "processing log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryStore;
    use crate::collaborators::testing::{
        FaultyStore, ScriptedExtractor, ScriptedValidator, StaticRetriever, clean_fields_json,
        contract_pdf, malformed, report_json,
    };
    use crate::contract::RiskLevel;
    use crate::state_machine::JobStatus;

    struct Harness {
        extractor: Arc<ScriptedExtractor>,
        validator: Arc<ScriptedValidator>,
        store: Arc<InMemoryStore>,
        orchestrator: ContractOrchestrator,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            retry: RetryConfig {
                extract_max_retries: 1,
                validate_max_retries: 1,
                base_delay_ms: 0,
            },
            ..Default::default()
        }
    }

    fn harness(extractor: ScriptedExtractor, validator: ScriptedValidator) -> Harness {
        let extractor = Arc::new(extractor);
        let validator = Arc::new(validator);
        let store = Arc::new(InMemoryStore::new());
        let collaborators = Collaborators {
            extractor: extractor.clone(),
            validator: validator.clone(),
            retriever: Arc::new(StaticRetriever(Vec::new())),
            store: store.clone(),
        };
        Harness {
            extractor,
            validator,
            store,
            orchestrator: ContractOrchestrator::new(collaborators, Router::default(), settings()),
        }
    }

    fn payload(bytes: Vec<u8>) -> ContractPayload {
        ContractPayload::new("legal@acme.test", "MSA for signature", "msa.pdf", bytes)
    }

    async fn run(h: &Harness, bytes: Vec<u8>) -> Result<Outcome, FailureDetail> {
        h.orchestrator
            .run("req-1", &payload(bytes), &StageCursor::default(), |_| true)
            .await
    }

    #[tokio::test]
    async fn clean_low_value_contract_is_approved() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        let outcome = run(&h, contract_pdf()).await.unwrap();
        assert_eq!(outcome.decision, Decision::Approved);
        assert_eq!(outcome.risk_level, RiskLevel::Low);
        assert!(!outcome.requires_review);
        assert!(outcome.persisted);
        assert!(outcome.contract_record_id.starts_with("ctr-"));

        assert!(h.store.list_review_queue(10, 0).await.unwrap().is_empty());
        assert_eq!(h.store.list_approved(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flagged_high_value_contract_goes_to_review_queue() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(900_000.0)),
            ScriptedValidator::returning(report_json(0.9, true, &["value_over_threshold"])),
        );

        let outcome = run(&h, contract_pdf()).await.unwrap();
        assert_eq!(outcome.decision, Decision::Review);
        assert_eq!(outcome.risk_level, RiskLevel::High);
        assert!(!outcome.violations.is_empty());

        let queue = h.store.list_review_queue(10, 0).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].contract_id, outcome.contract_record_id);
        assert_eq!(queue[0].violations[0].code, "value_over_threshold");
    }

    #[tokio::test]
    async fn non_pdf_upload_fails_at_ingest_without_a_record() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        let failure = run(&h, b"PK\x03\x04 definitely a zip".to_vec()).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Ingest);
        assert_eq!(failure.kind, FailureKind::InvalidDocument);
        assert!(!failure.retriable);
        assert_eq!(h.extractor.calls(), 0);

        assert!(h.store.list_approved(10, 0).await.unwrap().is_empty());
        assert!(h.store.list_review_queue(10, 0).await.unwrap().is_empty());
        let logs = h.store.list_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, JobStatus::Failed);
        assert_eq!(logs[0].final_stage, Stage::Ingest);
    }

    #[tokio::test]
    async fn malformed_extraction_once_succeeds_after_one_retry() {
        let h = harness(
            ScriptedExtractor::sequence(vec![malformed(), Ok(clean_fields_json(70_000.0))]),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        let outcome = run(&h, contract_pdf()).await.unwrap();
        assert_eq!(outcome.decision, Decision::Approved);
        assert_eq!(h.extractor.calls(), 2);

        let logs = h.store.list_logs(10, 0).await.unwrap();
        assert_eq!(logs[0].retry_count, 1);
    }

    #[tokio::test]
    async fn always_malformed_extraction_stops_at_the_bound() {
        let h = harness(
            ScriptedExtractor::sequence(vec![malformed()]),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        let failure = run(&h, contract_pdf()).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Extract);
        assert_eq!(failure.kind, FailureKind::SchemaViolation);
        // One call plus exactly one retry.
        assert_eq!(h.extractor.calls(), 2);
        assert_eq!(h.validator.calls(), 0);
    }

    #[tokio::test]
    async fn cleaning_failure_is_retried_like_malformed_output() {
        let h = harness(
            ScriptedExtractor::sequence(vec![Ok(serde_json::json!(["not", "an", "object"]))]),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        let failure = run(&h, contract_pdf()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::SchemaViolation);
        assert_eq!(h.extractor.calls(), 2);
    }

    #[tokio::test]
    async fn validation_schema_violations_follow_the_same_bound() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::sequence(vec![Ok(serde_json::json!({"confidence": 0.9}))]),
        );

        let failure = run(&h, contract_pdf()).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Validate);
        assert_eq!(failure.kind, FailureKind::SchemaViolation);
        assert_eq!(h.validator.calls(), 2);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_a_schema_violation() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::sequence(vec![
                Ok(report_json(1.7, false, &[])),
                Ok(report_json(0.95, false, &[])),
            ]),
        );

        let outcome = run(&h, contract_pdf()).await.unwrap();
        assert_eq!(outcome.decision, Decision::Approved);
        assert_eq!(h.validator.calls(), 2);
    }

    #[tokio::test]
    async fn every_run_writes_exactly_one_log_entry() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        run(&h, contract_pdf()).await.unwrap();
        run(&h, b"not a pdf".to_vec()).await.unwrap_err();

        let logs = h.store.list_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, JobStatus::Completed);
        assert_eq!(logs[0].final_stage, Stage::Persist);
        assert_eq!(logs[0].decision, Some(Decision::Approved));
        assert_eq!(logs[0].state_transitions, Stage::ALL.to_vec());
        assert_eq!(logs[1].status, JobStatus::Failed);
        assert_eq!(logs[1].decision, None);
    }

    async fn run_against(store: FaultyStore) -> (Result<Outcome, FailureDetail>, Arc<FaultyStore>) {
        let store = Arc::new(store);
        let collaborators = Collaborators {
            extractor: Arc::new(ScriptedExtractor::returning(clean_fields_json(70_000.0))),
            validator: Arc::new(ScriptedValidator::returning(report_json(0.95, false, &[]))),
            retriever: Arc::new(StaticRetriever(Vec::new())),
            store: store.clone(),
        };
        let orch = ContractOrchestrator::new(collaborators, Router::default(), settings());
        let result = orch
            .run("req-7", &payload(contract_pdf()), &StageCursor::default(), |_| true)
            .await;
        (result, store)
    }

    #[tokio::test]
    async fn failed_write_keeps_the_decision_and_flags_the_log() {
        let (result, store) = run_against(FaultyStore {
            inner: InMemoryStore::new(),
            unavailable: false,
        })
        .await;

        let outcome = result.unwrap();
        assert_eq!(outcome.decision, Decision::Approved);
        assert!(!outcome.persisted);
        assert_eq!(outcome.contract_record_id, "req-7");

        let logs = store.list_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, JobStatus::Completed);
        assert!(logs[0].persistence_error.as_deref().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn unreachable_store_fails_at_persist() {
        let (result, store) = run_against(FaultyStore {
            inner: InMemoryStore::new(),
            unavailable: true,
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.stage, Stage::Persist);
        assert_eq!(failure.kind, FailureKind::StorageError);

        let logs = store.list_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].failure.as_ref().unwrap().kind, FailureKind::StorageError);
    }

    #[tokio::test]
    async fn cursor_follows_the_run() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );
        let cursor = StageCursor::default();
        h.orchestrator
            .run("req-3", &payload(contract_pdf()), &cursor, |_| true)
            .await
            .unwrap();
        assert_eq!(cursor.get(), Stage::Persist);
    }

    #[tokio::test]
    async fn losing_the_commit_leaves_no_log_entry() {
        let h = harness(
            ScriptedExtractor::returning(clean_fields_json(70_000.0)),
            ScriptedValidator::returning(report_json(0.95, false, &[])),
        );

        let mut seen = None;
        let outcome = h
            .orchestrator
            .run("req-4", &payload(contract_pdf()), &StageCursor::default(), |result| {
                seen = Some(result.is_ok());
                false
            })
            .await
            .unwrap();
        assert_eq!(seen, Some(true));
        assert_eq!(outcome.decision, Decision::Approved);
        assert!(h.store.list_logs(10, 0).await.unwrap().is_empty());

        run(&h, b"not a pdf".to_vec()).await.unwrap_err();
        assert_eq!(h.store.list_logs(10, 0).await.unwrap().len(), 1);
    }
}
