//! Bounded diagnostic log of approval activity. Oldest entries are evicted
//! once capacity is reached, independent of record lifetimes.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_AUDIT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    RateLimited,
    Requested,
    Resolved,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at_ms: i64,
    pub kind: AuditKind,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub detail: String,
}

pub struct AuditRing {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, entry: AuditEntry) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries oldest-first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditRing {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: i64) -> AuditEntry {
        AuditEntry {
            at_ms: n,
            kind: AuditKind::Requested,
            session_key: "s".into(),
            request_id: Some(format!("req-{}", n)),
            detail: String::new(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = AuditRing::new(3);
        for n in 0..5 {
            ring.push(entry(n));
        }
        let kept: Vec<i64> = ring.snapshot().iter().map(|e| e.at_ms).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let ring = AuditRing::new(0);
        ring.push(entry(1));
        ring.push(entry(2));
        assert_eq!(ring.snapshot().len(), 1);
        assert_eq!(ring.snapshot()[0].at_ms, 2);
    }
}
