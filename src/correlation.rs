//! Correlation records for in-flight fan-outs.
//!
//! The orchestrator opens one record per turn, keyed by request id, naming
//! the branch topics it expects back. Branch results and degradations are
//! recorded as they arrive; the record is removed exactly once, either when
//! every expected entry is present or when the deadline watchdog expires it.
//! Late arrivals after removal are reported as unknown and discarded.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::messages::{Payload, RequestId, SessionId, Topic};

/// Lifecycle of a correlation record. Transitions are forward-only:
/// pending → partial → complete | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    Pending,
    Partial,
    Complete,
    Failed,
}

impl CorrelationStatus {
    /// Apply a forward transition; backward moves are ignored.
    fn advance(&mut self, to: CorrelationStatus) {
        let allowed = matches!(
            (*self, to),
            (Self::Pending, Self::Partial)
                | (Self::Pending, Self::Complete)
                | (Self::Pending, Self::Failed)
                | (Self::Partial, Self::Complete)
                | (Self::Partial, Self::Failed)
        );
        if allowed {
            *self = to;
        }
    }
}

/// One branch's contribution to a join.
#[derive(Debug, Clone)]
pub enum BranchEntry {
    Ready(Payload),
    Degraded { reason: String },
}

impl BranchEntry {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Tracks one in-flight fan-out.
#[derive(Debug, Clone)]
pub struct CorrelationRecord {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub expected: Vec<Topic>,
    pub received: HashMap<Topic, BranchEntry>,
    pub deadline: DateTime<Utc>,
    pub status: CorrelationStatus,
    pub created_at: DateTime<Utc>,
}

impl CorrelationRecord {
    fn is_complete(&self) -> bool {
        self.expected.iter().all(|t| self.received.contains_key(t))
    }

    /// Expected topics with no entry yet.
    pub fn missing(&self) -> Vec<Topic> {
        self.expected
            .iter()
            .copied()
            .filter(|t| !self.received.contains_key(t))
            .collect()
    }

    /// Names of branches that ended degraded, for the final response.
    pub fn degraded_branches(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .received
            .iter()
            .filter(|(_, entry)| entry.is_degraded())
            .map(|(topic, _)| topic.as_str().to_string())
            .collect();
        names.sort();
        names
    }
}

/// Outcome of recording a branch entry.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Entry stored; the join is still waiting on other branches.
    Progressed(CorrelationStatus),
    /// This entry completed the join; the record has been removed and
    /// belongs to the caller. Returned exactly once per request.
    Completed(Box<CorrelationRecord>),
    /// The topic was not part of this join's expected set.
    Ignored,
}

/// The correlation map: the only shared state behind the fan-in.
pub struct CorrelationMap {
    records: Mutex<HashMap<RequestId, CorrelationRecord>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Open a record for a new fan-out. A request id already in flight is
    /// rejected, never re-executed.
    pub fn open(
        &self,
        request_id: RequestId,
        session_id: SessionId,
        expected: Vec<Topic>,
        deadline: DateTime<Utc>,
    ) -> Result<(), BusError> {
        let mut records = self.records.lock();
        if records.contains_key(&request_id) {
            return Err(BusError::DuplicateRequest(request_id.to_string()));
        }
        records.insert(
            request_id,
            CorrelationRecord {
                request_id,
                session_id,
                expected,
                received: HashMap::new(),
                deadline,
                status: CorrelationStatus::Pending,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Record one branch entry (result or degradation) for a join.
    pub fn record(
        &self,
        request_id: RequestId,
        topic: Topic,
        entry: BranchEntry,
    ) -> Result<RecordOutcome, BusError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&request_id)
            .ok_or_else(|| BusError::UnknownRequest(request_id.to_string()))?;

        if !record.expected.contains(&topic) {
            return Ok(RecordOutcome::Ignored);
        }
        record.received.insert(topic, entry);

        if record.is_complete() {
            record.status.advance(CorrelationStatus::Complete);
            let record = records.remove(&request_id).map(Box::new);
            // Presence was checked above under the same lock.
            match record {
                Some(r) => Ok(RecordOutcome::Completed(r)),
                None => Err(BusError::UnknownRequest(request_id.to_string())),
            }
        } else {
            record.status.advance(CorrelationStatus::Partial);
            Ok(RecordOutcome::Progressed(record.status))
        }
    }

    /// Expire a record at its deadline: every missing branch is filled with
    /// an explicit degraded marker and the record is handed to the caller.
    /// Returns `None` when the join already completed.
    pub fn expire(&self, request_id: RequestId, reason: &str) -> Option<CorrelationRecord> {
        let mut records = self.records.lock();
        let mut record = records.remove(&request_id)?;
        for topic in record.missing() {
            record.received.insert(
                topic,
                BranchEntry::Degraded {
                    reason: reason.to_string(),
                },
            );
        }
        record.status.advance(CorrelationStatus::Failed);
        Some(record)
    }

    pub fn status(&self, request_id: RequestId) -> Option<CorrelationStatus> {
        self.records.lock().get(&request_id).map(|r| r.status)
    }

    pub fn in_flight(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for CorrelationMap {
    fn default() -> Self {
        Self::new()
    }
}
