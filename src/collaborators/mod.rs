//! The external collaborators the pipeline calls into, one per stage.
//!
//! The orchestrator only ever sees these traits. Concrete implementations
//! live in the submodules: model-backed and offline extractors, a rule and a
//! model validator, a keyword policy retriever and in-memory/file stores.

pub mod extractor;
pub mod retriever;
pub mod store;
pub mod validator;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::contract::{ContractId, ExtractedFields, Outcome, PolicyChunk};
use crate::document;
use crate::error::FailureKind;
use crate::state_machine::{ProcessingLogEntry, StageError};

pub use extractor::{AnthropicExtractor, PatternExtractor};
pub use retriever::KeywordPolicyRetriever;
pub use store::{ContractRecord, ContractStatus, FileStore, InMemoryStore, ReviewItem, StoreError};
pub use validator::{AnthropicValidator, RuleValidator};

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Plain text of a PDF document.
    ///
    /// The default parses the PDF on the blocking pool; an empty or
    /// unreadable document is an `InvalidDocument` failure.
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, StageError> {
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || document::read_pdf_text(&owned))
            .await
            .map_err(|e| StageError::new(FailureKind::WorkerFault, format!("text reader stopped: {e}")))?
            .map_err(|e| StageError::new(FailureKind::InvalidDocument, e.to_string()))
    }

    /// Raw, uncleaned field mapping for `text`. Implementations must not
    /// send more than `max_input_chars` characters of it to a model.
    async fn extract_fields(&self, text: &str, max_input_chars: usize) -> Result<Value, StageError>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Raw validation report: `{confidence, requires_human_review, violations}`.
    async fn validate(
        &self,
        fields: &ExtractedFields,
        chunks: &[PolicyChunk],
    ) -> Result<Value, StageError>;
}

#[async_trait]
pub trait PolicyRetriever: Send + Sync {
    /// Top-K policy chunks for `fields`, most relevant first.
    async fn retrieve(&self, fields: &ExtractedFields) -> Result<Vec<PolicyChunk>, StageError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Write the contract record and return its id.
    ///
    /// `StoreError::Unavailable` means no write was attempted at all.
    async fn save_contract(
        &self,
        request_id: &str,
        fields: &ExtractedFields,
        outcome: &Outcome,
    ) -> Result<ContractId, StoreError>;

    async fn enqueue_review(&self, contract_id: &str, outcome: &Outcome) -> Result<(), StoreError>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError>;

    async fn list_approved(&self, limit: usize, offset: usize) -> Result<Vec<ContractRecord>, StoreError>;

    async fn list_review_queue(&self, limit: usize, offset: usize) -> Result<Vec<ReviewItem>, StoreError>;

    /// Approve a contract that is pending review.
    async fn approve(&self, contract_id: &str) -> Result<ContractRecord, StoreError>;

    /// Reject a contract that is pending review.
    async fn decide_reject(&self, contract_id: &str) -> Result<ContractRecord, StoreError>;

    async fn get_contract(&self, contract_id: &str) -> Result<Option<ContractRecord>, StoreError>;

    /// Contract written by the submission with `request_id`, the id a
    /// deferred response hands out.
    async fn find_by_request(&self, request_id: &str) -> Result<Option<ContractRecord>, StoreError>;

    async fn list_logs(&self, limit: usize, offset: usize) -> Result<Vec<ProcessingLogEntry>, StoreError>;
}

/// The full set of collaborators one orchestrator runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub validator: Arc<dyn Validator>,
    pub retriever: Arc<dyn PolicyRetriever>,
    pub store: Arc<dyn Store>,
}

/// Scripted collaborators for pipeline and executor tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;

    /// Replies from a script; the last reply repeats once the script runs out.
    struct Script {
        replies: Mutex<VecDeque<Result<Value, StageError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        gate: Option<Arc<Semaphore>>,
        panics: bool,
    }

    impl Script {
        fn new(replies: Vec<Result<Value, StageError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                delay: None,
                gate: None,
                panics: false,
            }
        }

        async fn next(&self) -> Result<Value, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                // Blocks until the test adds permits; the permit is returned on drop.
                let _permit = gate.acquire().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.panics {
                panic!("scripted collaborator crashed");
            }
            let mut replies = self.replies.lock();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    pub(crate) fn clean_fields_json(total_value: f64) -> Value {
        json!({
            "vendor_name": "Acme Holdings",
            "contract_start_date": "2026-01-01",
            "contract_end_date": "2026-12-31",
            "total_value": total_value,
            "payment_terms_days": 30,
        })
    }

    pub(crate) fn report_json(confidence: f64, requires_review: bool, violations: &[&str]) -> Value {
        json!({
            "confidence": confidence,
            "requires_human_review": requires_review,
            "violations": violations,
        })
    }

    pub(crate) fn malformed() -> Result<Value, StageError> {
        Err(StageError::new(FailureKind::SchemaViolation, "model reply was not JSON"))
    }

    pub(crate) struct ScriptedExtractor(Script);

    impl ScriptedExtractor {
        pub(crate) fn returning(fields: Value) -> Self {
            Self(Script::new(vec![Ok(fields)]))
        }

        pub(crate) fn sequence(replies: Vec<Result<Value, StageError>>) -> Self {
            Self(Script::new(replies))
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.0.delay = Some(delay);
            self
        }

        pub(crate) fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
            self.0.gate = Some(gate);
            self
        }

        pub(crate) fn panicking(mut self) -> Self {
            self.0.panics = true;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.0.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract_fields(&self, _text: &str, _max: usize) -> Result<Value, StageError> {
            self.0.next().await
        }
    }

    pub(crate) struct ScriptedValidator(Script);

    impl ScriptedValidator {
        pub(crate) fn returning(report: Value) -> Self {
            Self(Script::new(vec![Ok(report)]))
        }

        pub(crate) fn sequence(replies: Vec<Result<Value, StageError>>) -> Self {
            Self(Script::new(replies))
        }

        pub(crate) fn calls(&self) -> usize {
            self.0.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Validator for ScriptedValidator {
        async fn validate(&self, _f: &ExtractedFields, _c: &[PolicyChunk]) -> Result<Value, StageError> {
            self.0.next().await
        }
    }

    pub(crate) struct StaticRetriever(pub(crate) Vec<PolicyChunk>);

    #[async_trait]
    impl PolicyRetriever for StaticRetriever {
        async fn retrieve(&self, _fields: &ExtractedFields) -> Result<Vec<PolicyChunk>, StageError> {
            Ok(self.0.clone())
        }
    }

    /// Store whose contract writes always fail with the given error; every
    /// other call goes to an in-memory store.
    pub(crate) struct FaultyStore {
        pub(crate) inner: InMemoryStore,
        pub(crate) unavailable: bool,
    }

    #[async_trait]
    impl Store for FaultyStore {
        async fn save_contract(
            &self,
            _request_id: &str,
            _fields: &ExtractedFields,
            _outcome: &Outcome,
        ) -> Result<ContractId, StoreError> {
            if self.unavailable {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Err(StoreError::WriteFailed("disk full".into()))
            }
        }

        async fn enqueue_review(&self, contract_id: &str, outcome: &Outcome) -> Result<(), StoreError> {
            self.inner.enqueue_review(contract_id, outcome).await
        }

        async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
            self.inner.append_log(entry).await
        }

        async fn list_approved(&self, limit: usize, offset: usize) -> Result<Vec<ContractRecord>, StoreError> {
            self.inner.list_approved(limit, offset).await
        }

        async fn list_review_queue(&self, limit: usize, offset: usize) -> Result<Vec<ReviewItem>, StoreError> {
            self.inner.list_review_queue(limit, offset).await
        }

        async fn approve(&self, contract_id: &str) -> Result<ContractRecord, StoreError> {
            self.inner.approve(contract_id).await
        }

        async fn decide_reject(&self, contract_id: &str) -> Result<ContractRecord, StoreError> {
            self.inner.decide_reject(contract_id).await
        }

        async fn get_contract(&self, contract_id: &str) -> Result<Option<ContractRecord>, StoreError> {
            self.inner.get_contract(contract_id).await
        }

        async fn find_by_request(&self, request_id: &str) -> Result<Option<ContractRecord>, StoreError> {
            self.inner.find_by_request(request_id).await
        }

        async fn list_logs(&self, limit: usize, offset: usize) -> Result<Vec<ProcessingLogEntry>, StoreError> {
            self.inner.list_logs(limit, offset).await
        }
    }

    /// A well-formed PDF carrying a short contract.
    pub(crate) fn contract_pdf() -> Vec<u8> {
        document::minimal_pdf(&[
            "Master Services Agreement",
            "Vendor: Acme Holdings",
            "Effective Date: January 1, 2026",
            "Expiration Date: December 31, 2026",
            "Total Value: $70,000 USD",
        ])
        .expect("contract fixture renders")
    }
}
