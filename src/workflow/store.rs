//! TTL-bounded store of paused executions.
//!
//! An entry is visible for `ttl` after its `created_at`. Expiry is checked on
//! every read, so an approval arriving late is indistinguishable from one
//! for an unknown id.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::models::workflow::PendingWorkflow;

/// Default time a paused execution waits for approval.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// In-memory map of workflow id to [`PendingWorkflow`].
#[derive(Debug)]
pub struct PendingWorkflowStore {
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, PendingWorkflow>>,
}

impl Default for PendingWorkflowStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PendingWorkflowStore {
    /// Store whose entries expire `ttl` after creation.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store `workflow` under a fresh id and return the id.
    pub fn create(&self, workflow: PendingWorkflow) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.set_with_id(&id, workflow);
        id
    }

    /// Store `workflow` under a caller-chosen id, replacing any entry.
    pub fn set_with_id(&self, id: &str, workflow: PendingWorkflow) {
        let mut entries = self.lock();
        self.sweep(&mut entries);
        entries.insert(id.to_owned(), workflow);
    }

    /// Entry for `id`, or `None` if absent or expired.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PendingWorkflow> {
        let mut entries = self.lock();
        let expired = self.is_expired(entries.get(id)?);
        if expired {
            entries.remove(id);
            debug!(workflow_id = id, "pending workflow expired");
            return None;
        }
        entries.get(id).cloned()
    }

    /// Remove `id`. Removing a missing id is a no-op.
    pub fn delete(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.lock();
        self.sweep(&mut entries)
    }

    /// Number of stored entries, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn sweep(&self, entries: &mut HashMap<String, PendingWorkflow>) -> usize {
        let before = entries.len();
        entries.retain(|_, workflow| !self.is_expired(workflow));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired pending workflows swept");
        }
        removed
    }

    fn is_expired(&self, workflow: &PendingWorkflow) -> bool {
        Utc::now() - workflow.created_at >= self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingWorkflow>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
