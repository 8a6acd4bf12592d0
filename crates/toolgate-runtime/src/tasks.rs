//! In-memory store of asynchronous invocation records.
//!
//! Records follow a one-way state machine:
//!
//! ```text
//! pending ──► running ──► succeeded | failed | cancelled
//!    └──────────────────► cancelled
//! ```
//!
//! Terminal states admit no further transitions. The terminal payload and
//! status code are written in the same critical section as the terminal
//! status, so readers never observe one without the other.
//!
//! State is process-lifetime only. The map is guarded by a
//! [`std::sync::RwLock`] that is never held across an `.await`.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::RwLock,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use toolgate_core::{CANCELLED_STATUS_CODE, StructuredError};
use tracing::debug;
use uuid::Uuid;

/// Opaque identifier of an asynchronous invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InvocationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of an invocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl InvocationStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an invocation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancel request.
    Caller,
    /// The invocation exceeded its timeout.
    Timeout,
}

impl CancelReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Timeout => "timeout",
        }
    }

    /// Result payload recorded for a cancellation.
    pub fn payload(self) -> JsonValue {
        json!({"cancelled": true, "reason": self.as_str()})
    }
}

/// Read-only view of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationSnapshot {
    pub invocation_id: InvocationId,
    pub tool_name: String,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub attempts: u32,
    pub write_action: bool,
    pub created_at: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<SystemTime>,
}

/// Acknowledgement of a cancel request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelAck {
    pub invocation_id: InvocationId,
    /// Status after the request was applied.
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// `false` when the record was already terminal.
    pub cancelled: bool,
}

/// Errors raised by [`TaskStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TaskStoreError {
    #[error("invocation not found: {0}")]
    NotFound(InvocationId),

    #[error("task store is full ({capacity} live invocations)")]
    Full { capacity: usize },

    #[error("task store lock poisoned")]
    LockPoisoned,
}

impl From<TaskStoreError> for StructuredError {
    fn from(value: TaskStoreError) -> Self {
        match value {
            TaskStoreError::NotFound(id) => {
                StructuredError::not_found("invocation_not_found", value.to_string())
                    .with_detail("invocation_id", id.to_string())
            }
            TaskStoreError::Full { capacity } => {
                StructuredError::rate_limited("task_store_full", value.to_string())
                    .with_detail("capacity", capacity)
                    .with_hint("wait for running invocations to finish, then retry")
            }
            TaskStoreError::LockPoisoned => {
                StructuredError::internal("task_store_poisoned", value.to_string())
            }
        }
    }
}

#[derive(Debug)]
struct InvocationRecord {
    tool_name: String,
    status: InvocationStatus,
    result: Option<JsonValue>,
    status_code: Option<u16>,
    attempts: u32,
    write_action: bool,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
}

#[derive(Debug)]
struct Entry {
    record: InvocationRecord,
    token: CancellationToken,
}

impl Entry {
    fn snapshot(&self, id: InvocationId) -> InvocationSnapshot {
        let record = &self.record;
        InvocationSnapshot {
            invocation_id: id,
            tool_name: record.tool_name.clone(),
            status: record.status,
            result: record.result.clone(),
            status_code: record.status_code,
            attempts: record.attempts,
            write_action: record.write_action,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }

    fn finish(&mut self, status: InvocationStatus, result: JsonValue, status_code: u16) {
        self.record.status = status;
        self.record.result = Some(result);
        self.record.status_code = Some(status_code);
        self.record.completed_at = Some(SystemTime::now());
    }
}

/// Keyed collection of invocation records with bounded size and
/// time-based retention of terminal records.
#[derive(Debug)]
pub struct TaskStore {
    entries: RwLock<HashMap<InvocationId, Entry>>,
    max_records: usize,
    retention: Duration,
}

impl TaskStore {
    pub fn new(max_records: usize, retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_records: max_records.max(1),
            retention,
        }
    }

    /// Creates a `pending` record and its cancellation token.
    ///
    /// Expired terminal records are evicted first. If the store is still at
    /// capacity the oldest terminal records make room; live records are
    /// never evicted.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::Full`] when every slot holds a live record.
    pub fn insert(
        &self,
        tool_name: &str,
        write_action: bool,
    ) -> Result<(InvocationId, CancellationToken), TaskStoreError> {
        let mut entries = self.entries.write().map_err(|_| TaskStoreError::LockPoisoned)?;

        evict_expired(&mut entries, self.retention, SystemTime::now());

        if entries.len() >= self.max_records {
            let mut terminal: Vec<(InvocationId, SystemTime)> = entries
                .iter()
                .filter(|(_, e)| e.record.status.is_terminal())
                .map(|(id, e)| (*id, e.record.completed_at.unwrap_or(e.record.created_at)))
                .collect();
            terminal.sort_by_key(|(_, at)| *at);

            let excess = entries.len() + 1 - self.max_records;
            for (id, _) in terminal.into_iter().take(excess) {
                entries.remove(&id);
            }
        }

        if entries.len() >= self.max_records {
            return Err(TaskStoreError::Full {
                capacity: self.max_records,
            });
        }

        let id = InvocationId::new();
        let token = CancellationToken::new();
        entries.insert(
            id,
            Entry {
                record: InvocationRecord {
                    tool_name: tool_name.to_string(),
                    status: InvocationStatus::Pending,
                    result: None,
                    status_code: None,
                    attempts: 0,
                    write_action,
                    created_at: SystemTime::now(),
                    started_at: None,
                    completed_at: None,
                },
                token: token.clone(),
            },
        );
        Ok((id, token))
    }

    /// Moves a `pending` record to `running`.
    ///
    /// Returns `false` if the record is no longer pending (it was cancelled
    /// while waiting), in which case the handler must not run.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::NotFound`] for an unknown id.
    pub fn mark_running(&self, id: InvocationId) -> Result<bool, TaskStoreError> {
        let mut entries = self.entries.write().map_err(|_| TaskStoreError::LockPoisoned)?;
        let entry = entries.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;

        if entry.record.status != InvocationStatus::Pending {
            return Ok(false);
        }
        entry.record.status = InvocationStatus::Running;
        entry.record.started_at = Some(SystemTime::now());
        Ok(true)
    }

    /// Records the number of the attempt now in progress.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::NotFound`] for an unknown id.
    pub fn record_attempt(&self, id: InvocationId, attempt: u32) -> Result<(), TaskStoreError> {
        let mut entries = self.entries.write().map_err(|_| TaskStoreError::LockPoisoned)?;
        let entry = entries.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;
        if !entry.record.status.is_terminal() {
            entry.record.attempts = entry.record.attempts.max(attempt);
        }
        Ok(())
    }

    /// Writes the terminal outcome of a run.
    ///
    /// A record that is already terminal is left untouched and `false` is
    /// returned; this is how a late completion loses to a cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::NotFound`] for an unknown id.
    pub fn complete(
        &self,
        id: InvocationId,
        result: Result<JsonValue, StructuredError>,
        attempts: u32,
    ) -> Result<bool, TaskStoreError> {
        let mut entries = self.entries.write().map_err(|_| TaskStoreError::LockPoisoned)?;
        let entry = entries.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;

        if entry.record.status.is_terminal() {
            debug!(invocation_id = %id, status = %entry.record.status, "Ignoring completion of terminal invocation");
            return Ok(false);
        }

        entry.record.attempts = attempts;
        match result {
            Ok(value) => entry.finish(
                InvocationStatus::Succeeded,
                value,
                toolgate_core::SUCCESS_STATUS_CODE,
            ),
            Err(error) if error.is_cancellation() => {
                entry.finish(
                    InvocationStatus::Cancelled,
                    CancelReason::Caller.payload(),
                    CANCELLED_STATUS_CODE,
                );
                entry.token.cancel();
            }
            Err(error) => {
                let status_code = error.status_code();
                entry.finish(InvocationStatus::Failed, error.to_json(), status_code);
            }
        }
        Ok(true)
    }

    /// Cancels a live record and fires its token.
    ///
    /// Cancelling a terminal record is a no-op that reports its current
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::NotFound`] for an unknown id.
    pub fn cancel(&self, id: InvocationId, reason: CancelReason) -> Result<CancelAck, TaskStoreError> {
        let mut entries = self.entries.write().map_err(|_| TaskStoreError::LockPoisoned)?;
        let entry = entries.get_mut(&id).ok_or(TaskStoreError::NotFound(id))?;

        let cancelled = !entry.record.status.is_terminal();
        if cancelled {
            entry.finish(
                InvocationStatus::Cancelled,
                reason.payload(),
                CANCELLED_STATUS_CODE,
            );
            entry.token.cancel();
        }

        Ok(CancelAck {
            invocation_id: id,
            status: entry.record.status,
            status_code: entry.record.status_code,
            cancelled,
        })
    }

    /// Returns a copy of a record. Never mutates.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::NotFound`] for an unknown id.
    pub fn snapshot(&self, id: InvocationId) -> Result<InvocationSnapshot, TaskStoreError> {
        let entries = self.entries.read().map_err(|_| TaskStoreError::LockPoisoned)?;
        entries
            .get(&id)
            .map(|entry| entry.snapshot(id))
            .ok_or(TaskStoreError::NotFound(id))
    }

    /// Evicts terminal records older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::LockPoisoned`] if the lock is poisoned.
    pub fn evict_expired(&self) -> Result<usize, TaskStoreError> {
        let mut entries = self.entries.write().map_err(|_| TaskStoreError::LockPoisoned)?;
        Ok(evict_expired(&mut entries, self.retention, SystemTime::now()))
    }

    /// Number of records, live and terminal.
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `pending` or `running` records.
    pub fn live_count(&self) -> usize {
        self.entries.read().map_or(0, |entries| {
            entries
                .values()
                .filter(|e| !e.record.status.is_terminal())
                .count()
        })
    }
}

fn evict_expired(
    entries: &mut HashMap<InvocationId, Entry>,
    retention: Duration,
    now: SystemTime,
) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| {
        let Some(completed_at) = entry.record.completed_at else {
            return true;
        };
        match now.duration_since(completed_at) {
            Ok(age) => age < retention,
            Err(_) => true,
        }
    });
    let evicted = before - entries.len();
    if evicted > 0 {
        debug!(evicted, "Evicted expired invocation records");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use toolgate_core::ErrorCategory;

    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(8, Duration::from_secs(60))
    }

    #[test]
    fn test_insert_creates_pending_record() {
        let store = store();
        let (id, token) = store.insert("echo", false).unwrap();
        let snapshot = store.snapshot(id).unwrap();

        assert_eq!(snapshot.status, InvocationStatus::Pending);
        assert_eq!(snapshot.tool_name, "echo");
        assert_eq!(snapshot.result, None);
        assert_eq!(snapshot.status_code, None);
        assert!(!token.is_cancelled());
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn test_complete_success_sets_result_and_code_together() {
        let store = store();
        let (id, _) = store.insert("echo", false).unwrap();
        assert!(store.mark_running(id).unwrap());
        assert!(store.complete(id, Ok(json!({"ok": true})), 2).unwrap());

        let snapshot = store.snapshot(id).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Succeeded);
        assert_eq!(snapshot.result, Some(json!({"ok": true})));
        assert_eq!(snapshot.status_code, Some(200));
        assert_eq!(snapshot.attempts, 2);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.completed_at.is_some());
    }

    #[test]
    fn test_complete_failure_maps_status_code() {
        let store = store();
        let (id, _) = store.insert("echo", false).unwrap();
        store.mark_running(id).unwrap();
        store
            .complete(id, Err(StructuredError::auth("denied", "no token")), 1)
            .unwrap();

        let snapshot = store.snapshot(id).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Failed);
        assert_eq!(snapshot.status_code, Some(401));
        assert_eq!(snapshot.result.unwrap()["code"], "denied");
    }

    #[test]
    fn test_complete_with_cancellation_envelope_marks_cancelled() {
        let store = store();
        let (id, token) = store.insert("slow", false).unwrap();
        store.mark_running(id).unwrap();
        assert!(
            store
                .complete(id, Err(StructuredError::cancelled("stopped at checkpoint")), 1)
                .unwrap()
        );

        let snapshot = store.snapshot(id).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Cancelled);
        assert_eq!(snapshot.status_code, Some(CANCELLED_STATUS_CODE));
        assert_eq!(snapshot.result, Some(json!({"cancelled": true, "reason": "caller"})));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_running_record() {
        let store = store();
        let (id, token) = store.insert("slow", false).unwrap();
        store.mark_running(id).unwrap();

        let ack = store.cancel(id, CancelReason::Caller).unwrap();
        assert!(ack.cancelled);
        assert_eq!(ack.status, InvocationStatus::Cancelled);
        assert_eq!(ack.status_code, Some(CANCELLED_STATUS_CODE));
        assert!(token.is_cancelled());

        let snapshot = store.snapshot(id).unwrap();
        assert_eq!(snapshot.result, Some(json!({"cancelled": true, "reason": "caller"})));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let store = store();
        let (id, _) = store.insert("slow", false).unwrap();
        store.mark_running(id).unwrap();
        store.cancel(id, CancelReason::Timeout).unwrap();

        assert!(!store.complete(id, Ok(json!("late")), 1).unwrap());
        let ack = store.cancel(id, CancelReason::Caller).unwrap();
        assert!(!ack.cancelled);

        let snapshot = store.snapshot(id).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Cancelled);
        assert_eq!(snapshot.result, Some(json!({"cancelled": true, "reason": "timeout"})));
    }

    #[test]
    fn test_cancelled_pending_record_never_runs() {
        let store = store();
        let (id, _) = store.insert("queued", false).unwrap();
        store.cancel(id, CancelReason::Caller).unwrap();
        assert!(!store.mark_running(id).unwrap());
    }

    #[test]
    fn test_cancel_does_not_touch_other_records() {
        let store = store();
        let (first, first_token) = store.insert("a", false).unwrap();
        let (second, second_token) = store.insert("b", false).unwrap();
        store.mark_running(first).unwrap();
        store.mark_running(second).unwrap();

        store.cancel(first, CancelReason::Caller).unwrap();
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(store.snapshot(second).unwrap().status, InvocationStatus::Running);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let store = store();
        let id = InvocationId::new();
        assert_eq!(store.snapshot(id), Err(TaskStoreError::NotFound(id)));

        let structured: StructuredError = store.cancel(id, CancelReason::Caller).unwrap_err().into();
        assert_eq!(structured.category, ErrorCategory::NotFound);
        assert_eq!(structured.status_code(), 404);
    }

    #[test]
    fn test_full_store_evicts_oldest_terminal_record() {
        let store = TaskStore::new(2, Duration::from_secs(60));
        let (done, _) = store.insert("a", false).unwrap();
        store.mark_running(done).unwrap();
        store.complete(done, Ok(json!(1)), 1).unwrap();
        let (live, _) = store.insert("b", false).unwrap();

        let (fresh, _) = store.insert("c", false).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.snapshot(done).is_err());
        assert!(store.snapshot(live).is_ok());
        assert!(store.snapshot(fresh).is_ok());
    }

    #[test]
    fn test_full_store_of_live_records_rejects_insert() {
        let store = TaskStore::new(1, Duration::from_secs(60));
        store.insert("a", false).unwrap();

        let err = store.insert("b", false).unwrap_err();
        assert_eq!(err, TaskStoreError::Full { capacity: 1 });

        let structured: StructuredError = err.into();
        assert_eq!(structured.category, ErrorCategory::RateLimited);
        assert!(structured.retryable);
    }

    #[test]
    fn test_retention_evicts_only_terminal_records() {
        let store = TaskStore::new(8, Duration::ZERO);
        let (done, _) = store.insert("a", false).unwrap();
        store.mark_running(done).unwrap();
        store.complete(done, Ok(json!(1)), 1).unwrap();
        let (live, _) = store.insert("b", false).unwrap();

        assert_eq!(store.evict_expired().unwrap(), 0);
        assert!(store.snapshot(live).is_ok());
        assert!(store.snapshot(done).is_err());
    }

    #[test]
    fn test_record_attempt_tracks_progress() {
        let store = store();
        let (id, _) = store.insert("a", false).unwrap();
        store.mark_running(id).unwrap();
        store.record_attempt(id, 2).unwrap();
        assert_eq!(store.snapshot(id).unwrap().attempts, 2);
    }

    #[test]
    fn test_invocation_id_round_trips_through_display() {
        let id = InvocationId::new();
        assert_eq!(id.to_string().parse::<InvocationId>().unwrap(), id);
        assert!("not-a-uuid".parse::<InvocationId>().is_err());
    }
}
