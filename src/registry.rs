//! Idempotency registry: one job per key, one terminal result per job.
//!
//! Each entry owns a `watch` channel carrying its latest [`JobSnapshot`].
//! Status changes go through `send_if_modified`, which runs under the
//! channel's lock, so Pending → Running → terminal is a compare-and-set and
//! the first terminal write wins. Awaiters subscribe to the channel and never
//! mutate the entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::contract::Outcome;
use crate::error::FailureKind;
use crate::state_machine::{FailureDetail, JobStatus, StageCursor};

/// Terminal value of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Completed(Outcome),
    Failed(FailureDetail),
}

/// Point-in-time view of a job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub completed_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
}

impl JobSnapshot {
    fn pending() -> Self {
        Self {
            status: JobStatus::Pending,
            result: None,
            completed_at: None,
            finished: None,
        }
    }
}

/// What an awaiter observed.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitResult {
    Outcome(Outcome),
    Failed(FailureDetail),
    TimedOut,
}

#[derive(Debug)]
struct JobEntry {
    key: String,
    request_id: String,
    created: Instant,
    created_at: DateTime<Utc>,
    cursor: StageCursor,
    state: watch::Sender<JobSnapshot>,
}

/// Shared reference to one registry entry.
#[derive(Debug, Clone)]
pub struct JobHandle {
    entry: Arc<JobEntry>,
}

impl JobHandle {
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    /// Request id of the submission that created the job.
    pub fn request_id(&self) -> &str {
        &self.entry.request_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.entry.created_at
    }

    /// Stage the job's run last entered; `Ingest` until a worker picks it up.
    pub fn cursor(&self) -> &StageCursor {
        &self.entry.cursor
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.entry.state.borrow().clone()
    }

    /// Wait until the job is terminal or `timeout` elapses. Never cancels
    /// or mutates the job.
    pub async fn wait(&self, timeout: Duration) -> AwaitResult {
        let mut rx = self.entry.state.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.status.is_terminal())).await;
        match waited {
            Ok(Ok(snapshot)) => match snapshot.result.clone() {
                Some(JobResult::Completed(outcome)) => AwaitResult::Outcome(outcome),
                Some(JobResult::Failed(detail)) => AwaitResult::Failed(detail),
                None => AwaitResult::TimedOut,
            },
            // The sender lives as long as the entry we hold, so a closed
            // channel cannot happen; treat it like a timeout.
            Ok(Err(_)) | Err(_) => AwaitResult::TimedOut,
        }
    }

    fn transition(&self, to: JobStatus, result: Option<JobResult>) -> bool {
        self.entry.state.send_if_modified(|snap| {
            let allowed = match to {
                JobStatus::Running => snap.status == JobStatus::Pending,
                JobStatus::Completed | JobStatus::Failed => !snap.status.is_terminal(),
                JobStatus::Pending => false,
            };
            if allowed {
                snap.status = to;
                if to.is_terminal() {
                    snap.result = result;
                    snap.completed_at = Some(Utc::now());
                    snap.finished = Some(Instant::now());
                }
            }
            allowed
        })
    }
}

/// Result of one reaper sweep.
#[derive(Debug, Default)]
pub struct ReapStats {
    /// Jobs this sweep failed as `Abandoned`, with the failure it recorded.
    /// The sweep won their terminal write, so their audit entry is owed by
    /// whoever called it.
    pub abandoned: Vec<(JobHandle, FailureDetail)>,
    pub evicted: usize,
}

/// Process-wide map from idempotency key to job.
#[derive(Debug)]
pub struct IdempotencyRegistry {
    entries: DashMap<String, Arc<JobEntry>>,
    by_request: DashMap<String, String>,
    enabled: bool,
}

impl IdempotencyRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            by_request: DashMap::new(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Return the job for `key`, creating a Pending one if the key is unseen.
    ///
    /// The flag is true only for the caller that created the job; everyone
    /// else must join it instead of running the pipeline. With idempotency
    /// disabled, or without a key, the job is keyed by `request_id` and is
    /// therefore always new.
    pub fn submit_or_join(&self, key: Option<&str>, request_id: &str) -> (JobHandle, bool) {
        let key = match key.map(str::trim) {
            Some(k) if self.enabled && !k.is_empty() => k.to_string(),
            _ => request_id.to_string(),
        };

        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                debug!(key = %key, request_id = %occupied.get().request_id, "joined existing job");
                (
                    JobHandle {
                        entry: occupied.get().clone(),
                    },
                    false,
                )
            }
            Entry::Vacant(vacant) => {
                let (state, _) = watch::channel(JobSnapshot::pending());
                let entry = Arc::new(JobEntry {
                    key: key.clone(),
                    request_id: request_id.to_string(),
                    created: Instant::now(),
                    created_at: Utc::now(),
                    cursor: StageCursor::default(),
                    state,
                });
                vacant.insert(entry.clone());
                self.by_request.insert(request_id.to_string(), key);
                (JobHandle { entry }, true)
            }
        }
    }

    /// Pending → Running. False if the job was already claimed or finished.
    pub fn mark_running(&self, handle: &JobHandle) -> bool {
        handle.transition(JobStatus::Running, None)
    }

    /// Record the outcome. Only the first terminal write takes effect.
    pub fn complete(&self, handle: &JobHandle, outcome: Outcome) -> bool {
        let won = handle.transition(JobStatus::Completed, Some(JobResult::Completed(outcome)));
        if !won {
            debug!(key = %handle.key(), "late completion ignored");
        }
        won
    }

    /// Record a failure. Only the first terminal write takes effect.
    pub fn fail(&self, handle: &JobHandle, detail: FailureDetail) -> bool {
        let won = handle.transition(JobStatus::Failed, Some(JobResult::Failed(detail)));
        if !won {
            debug!(key = %handle.key(), "late failure ignored");
        }
        won
    }

    pub fn get(&self, key: &str) -> Option<JobHandle> {
        self.entries.get(key).map(|e| JobHandle { entry: e.clone() })
    }

    /// Find a job by the request id of the submission that created it.
    pub fn lookup(&self, request_id: &str) -> Option<JobHandle> {
        let key = self.by_request.get(request_id)?.clone();
        self.get(&key).filter(|h| h.request_id() == request_id)
    }

    /// Drop `handle`'s entry so later submissions with its key start fresh.
    ///
    /// A newer job that has since taken the same key is left alone. Returns
    /// whether anything was removed.
    pub fn forget(&self, handle: &JobHandle) -> bool {
        let removed = self
            .entries
            .remove_if(handle.key(), |_, entry| Arc::ptr_eq(entry, &handle.entry));
        if removed.is_some() {
            self.by_request.remove(handle.request_id());
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep stale and expired entries.
    ///
    /// Jobs still Pending or Running after `stale_ttl` are failed as
    /// `Abandoned` at the stage their run last entered, which wakes their
    /// awaiters, and evicted. Terminal jobs are evicted `retention` after
    /// they finished. A zero duration turns that half of the sweep off.
    pub fn reap(&self, stale_ttl: Duration, retention: Duration) -> ReapStats {
        let mut stats = ReapStats::default();
        let mut expired = Vec::new();

        for item in self.entries.iter() {
            let handle = JobHandle {
                entry: item.value().clone(),
            };
            let snapshot = handle.snapshot();
            if snapshot.status.is_terminal() {
                let done_for = snapshot.finished.map(|f| f.elapsed()).unwrap_or_default();
                if !retention.is_zero() && done_for >= retention {
                    expired.push(handle);
                }
            } else if !stale_ttl.is_zero() && handle.entry.created.elapsed() >= stale_ttl {
                let stage = handle.cursor().get();
                let detail = FailureDetail::new(
                    stage,
                    FailureKind::Abandoned,
                    format!(
                        "job unfinished after {}s while {:?}, evicted",
                        stale_ttl.as_secs_f64(),
                        snapshot.status
                    ),
                    true,
                );
                if self.fail(&handle, detail.clone()) {
                    warn!(
                        key = %handle.key(),
                        request_id = %handle.request_id(),
                        stage = %stage,
                        "stale job abandoned"
                    );
                    stats.abandoned.push((handle.clone(), detail));
                }
                expired.push(handle);
            }
        }

        for handle in expired {
            if self.forget(&handle) {
                stats.evicted += 1;
            }
        }
        if stats.evicted > 0 {
            info!(abandoned = stats.abandoned.len(), evicted = stats.evicted, "registry swept");
        }
        stats
    }
}
