//! Recent failures
//!
//! Bounded, in-memory record of failed jobs and permanently failed uploads
//! surfaced in the node status. The durable truth stays in the store.

use chrono::Utc;
use infrax_core::domain::node::{FailureKind, FailureReport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 32;

/// Ring of the most recent failures, oldest dropped first
#[derive(Debug, Clone)]
pub struct FailureLog {
    entries: Arc<Mutex<VecDeque<FailureReport>>>,
    capacity: usize,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, job_id: Uuid, kind: FailureKind, message: impl Into<String>) {
        let report = FailureReport {
            job_id,
            kind,
            message: message.into(),
            at: Utc::now(),
        };

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(report);
    }

    /// Newest first
    pub fn snapshot(&self) -> Vec<FailureReport> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().rev().cloned().collect()
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let log = FailureLog::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            log.record(*id, FailureKind::Job, "boom");
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].job_id, ids[2]);
        assert_eq!(snapshot[1].job_id, ids[1]);
    }
}
