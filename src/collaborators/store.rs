//! Contract, review-queue and processing-log persistence.
//!
//! Both stores keep the same in-memory [`Records`] plus a log vector;
//! [`FileStore`] additionally puts every mutation on disk before committing
//! it in memory.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Store;
use crate::contract::{
    ContractId, Decision, ExtractedFields, Outcome, PolicyViolation, RiskLevel,
};
use crate::state_machine::ProcessingLogEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached; no write was attempted.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store write failed: {0}")]
    WriteFailed(String),

    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("contract {id} is not pending review (status: {status})")]
    NotPending { id: String, status: ContractStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Approved,
    PendingReview,
    Rejected,
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractStatus::Approved => write!(f, "approved"),
            ContractStatus::PendingReview => write!(f, "pending_review"),
            ContractStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: ContractId,
    pub request_id: String,
    pub status: ContractStatus,
    /// The pipeline's routing decision, kept even after a human decides.
    pub decision: Decision,
    pub risk_level: RiskLevel,
    pub fields: ExtractedFields,
    pub violations: Vec<PolicyViolation>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub contract_id: ContractId,
    pub vendor_name: Option<String>,
    pub total_value: Option<f64>,
    pub risk_level: RiskLevel,
    pub violations: Vec<PolicyViolation>,
    pub reasons: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Contracts and the review queue; the part of the store that is
/// snapshotted as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Records {
    contracts: Vec<ContractRecord>,
    reviews: Vec<ReviewItem>,
}

impl Records {
    fn save_contract(&mut self, request_id: &str, fields: &ExtractedFields, outcome: &Outcome) -> ContractId {
        let id = format!("ctr-{}", Uuid::new_v4());
        let status = match outcome.decision {
            Decision::Approved => ContractStatus::Approved,
            Decision::Review => ContractStatus::PendingReview,
        };
        self.contracts.push(ContractRecord {
            id: id.clone(),
            request_id: request_id.to_string(),
            status,
            decision: outcome.decision,
            risk_level: outcome.risk_level,
            fields: fields.clone(),
            violations: outcome.violations.clone(),
            created_at: Utc::now(),
            decided_at: None,
        });
        id
    }

    fn enqueue_review(&mut self, contract_id: &str, outcome: &Outcome) -> Result<(), StoreError> {
        if self.contract(contract_id).is_none() {
            return Err(StoreError::NotFound(contract_id.to_string()));
        }
        if self.reviews.iter().any(|r| r.contract_id == contract_id) {
            return Ok(());
        }
        self.reviews.push(ReviewItem {
            contract_id: contract_id.to_string(),
            vendor_name: outcome.extracted_fields.vendor_name.clone(),
            total_value: outcome.extracted_fields.total_value,
            risk_level: outcome.risk_level,
            violations: outcome.violations.clone(),
            reasons: outcome.reasons.clone(),
            enqueued_at: Utc::now(),
        });
        Ok(())
    }

    fn contract(&self, id: &str) -> Option<&ContractRecord> {
        self.contracts.iter().find(|c| c.id == id)
    }

    /// Latest record written for a submission.
    fn contract_for_request(&self, request_id: &str) -> Option<&ContractRecord> {
        self.contracts.iter().rev().find(|c| c.request_id == request_id)
    }

    fn decide(&mut self, id: &str, status: ContractStatus) -> Result<ContractRecord, StoreError> {
        let record = self
            .contracts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status != ContractStatus::PendingReview {
            return Err(StoreError::NotPending {
                id: id.to_string(),
                status: record.status,
            });
        }
        record.status = status;
        record.decided_at = Some(Utc::now());
        let record = record.clone();
        self.reviews.retain(|r| r.contract_id != id);
        Ok(record)
    }

    fn list_approved(&self, limit: usize, offset: usize) -> Vec<ContractRecord> {
        self.contracts
            .iter()
            .filter(|c| c.status == ContractStatus::Approved)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    fn list_review_queue(&self, limit: usize, offset: usize) -> Vec<ReviewItem> {
        self.reviews.iter().skip(offset).take(limit).cloned().collect()
    }
}

fn page<T: Clone>(items: &[T], limit: usize, offset: usize) -> Vec<T> {
    items.iter().skip(offset).take(limit).cloned().collect()
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<Records>,
    logs: Mutex<Vec<ProcessingLogEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_contract(
        &self,
        request_id: &str,
        fields: &ExtractedFields,
        outcome: &Outcome,
    ) -> Result<ContractId, StoreError> {
        Ok(self.records.lock().save_contract(request_id, fields, outcome))
    }

    async fn enqueue_review(&self, contract_id: &str, outcome: &Outcome) -> Result<(), StoreError> {
        self.records.lock().enqueue_review(contract_id, outcome)
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn list_approved(&self, limit: usize, offset: usize) -> Result<Vec<ContractRecord>, StoreError> {
        Ok(self.records.lock().list_approved(limit, offset))
    }

    async fn list_review_queue(&self, limit: usize, offset: usize) -> Result<Vec<ReviewItem>, StoreError> {
        Ok(self.records.lock().list_review_queue(limit, offset))
    }

    async fn approve(&self, contract_id: &str) -> Result<ContractRecord, StoreError> {
        self.records.lock().decide(contract_id, ContractStatus::Approved)
    }

    async fn decide_reject(&self, contract_id: &str) -> Result<ContractRecord, StoreError> {
        self.records.lock().decide(contract_id, ContractStatus::Rejected)
    }

    async fn get_contract(&self, contract_id: &str) -> Result<Option<ContractRecord>, StoreError> {
        Ok(self.records.lock().contract(contract_id).cloned())
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<ContractRecord>, StoreError> {
        Ok(self.records.lock().contract_for_request(request_id).cloned())
    }

    async fn list_logs(&self, limit: usize, offset: usize) -> Result<Vec<ProcessingLogEntry>, StoreError> {
        Ok(page(&self.logs.lock(), limit, offset))
    }
}

/// JSON-file store for the CLI, so review decisions survive between runs.
///
/// Contracts and the review queue are a compact snapshot at `path`, replaced
/// on every mutation. The processing log is appended, one JSON line per
/// entry, to a sibling `.log.jsonl` file. Disk writes run on the blocking
/// pool one at a time, and memory only changes once the write has landed.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    log_path: PathBuf,
    records: Mutex<Records>,
    logs: Mutex<Vec<ProcessingLogEntry>>,
    writes: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`, loading the existing snapshot and log if
    /// there are any.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let log_path = path.with_extension("log.jsonl");

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Records>(&bytes)
                .map_err(|e| StoreError::Unavailable(format!("{} is corrupted: {e}", path.display())))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Records::default(),
            Err(e) => return Err(StoreError::Unavailable(format!("{}: {e}", path.display()))),
        };
        let logs = load_log(&log_path).await?;

        info!(
            path = %path.display(),
            contracts = records.contracts.len(),
            log_entries = logs.len(),
            "file store opened"
        );
        Ok(Self {
            path,
            log_path,
            records: Mutex::new(records),
            logs: Mutex::new(logs),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    /// Apply `change` to a copy of the records, write the copy out, then
    /// commit it.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Records) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let _serial = self.writes.lock().await;
        let mut next = self.records.lock().clone();
        let result = change(&mut next)?;
        let bytes = serde_json::to_vec(&next).map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        let path = self.path.clone();
        on_blocking_pool(&self.path, move || replace_file(&path, &bytes)).await?;
        *self.records.lock() = next;
        debug!(path = %self.path.display(), "store snapshot written");
        Ok(result)
    }
}

/// Read the JSON-lines processing log. Lines that do not parse (a torn
/// write from a crash) are skipped, and a missing final newline is restored
/// so the next append starts on a line of its own.
async fn load_log(path: &Path) -> Result<Vec<ProcessingLogEntry>, StoreError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Unavailable(format!("{}: {e}", path.display()))),
    };

    let mut entries = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProcessingLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable log line"),
        }
    }

    if !contents.is_empty() && !contents.ends_with('\n') {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
    }
    Ok(entries)
}

fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)
}

async fn on_blocking_pool(
    path: &Path,
    work: impl FnOnce() -> io::Result<()> + Send + 'static,
) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", path.display())))?
        .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", path.display())))
}

#[async_trait]
impl Store for FileStore {
    async fn save_contract(
        &self,
        request_id: &str,
        fields: &ExtractedFields,
        outcome: &Outcome,
    ) -> Result<ContractId, StoreError> {
        self.mutate(|r| Ok(r.save_contract(request_id, fields, outcome))).await
    }

    async fn enqueue_review(&self, contract_id: &str, outcome: &Outcome) -> Result<(), StoreError> {
        self.mutate(|r| r.enqueue_review(contract_id, outcome)).await
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        line.push(b'\n');

        let _serial = self.writes.lock().await;
        let path = self.log_path.clone();
        on_blocking_pool(&self.log_path, move || append_line(&path, &line)).await?;
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn list_approved(&self, limit: usize, offset: usize) -> Result<Vec<ContractRecord>, StoreError> {
        Ok(self.records.lock().list_approved(limit, offset))
    }

    async fn list_review_queue(&self, limit: usize, offset: usize) -> Result<Vec<ReviewItem>, StoreError> {
        Ok(self.records.lock().list_review_queue(limit, offset))
    }

    async fn approve(&self, contract_id: &str) -> Result<ContractRecord, StoreError> {
        self.mutate(|r| r.decide(contract_id, ContractStatus::Approved)).await
    }

    async fn decide_reject(&self, contract_id: &str) -> Result<ContractRecord, StoreError> {
        self.mutate(|r| r.decide(contract_id, ContractStatus::Rejected)).await
    }

    async fn get_contract(&self, contract_id: &str) -> Result<Option<ContractRecord>, StoreError> {
        Ok(self.records.lock().contract(contract_id).cloned())
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<ContractRecord>, StoreError> {
        Ok(self.records.lock().contract_for_request(request_id).cloned())
    }

    async fn list_logs(&self, limit: usize, offset: usize) -> Result<Vec<ProcessingLogEntry>, StoreError> {
        Ok(page(&self.logs.lock(), limit, offset))
    }
}
