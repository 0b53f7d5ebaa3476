//! In-memory ring-buffer audit storage for development and testing.
//!
//! Bounded capacity with oldest-first eviction. Append and the
//! trim-on-overflow step happen under one lock acquisition, so concurrent
//! writers cannot observe the buffer above capacity or corrupt ordering.

use super::{AuditLogEntry, AuditQuery, AuditStorage};
use crate::errors::SandboxError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct MemoryAuditStorage {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    capacity: usize,
}

impl MemoryAuditStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditLogEntry>> {
        // A poisoned lock only means a writer panicked mid-push; the
        // buffer itself is still a valid deque.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn save(&self, entry: AuditLogEntry) -> Result<(), SandboxError> {
        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, SandboxError> {
        let entries = self.lock();
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(entries
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, query: &AuditQuery) -> Result<usize, SandboxError> {
        let entries = self.lock();
        Ok(entries.iter().filter(|e| query.matches(e)).count())
    }

    async fn delete(&self, query: &AuditQuery) -> Result<usize, SandboxError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !query.matches(e));
        Ok(before - entries.len())
    }
}
