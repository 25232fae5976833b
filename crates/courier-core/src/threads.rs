//! Thread table: one live execution per conversation thread
//!
//! The only shared mutable state in the core. Every transition happens under
//! the write lock and checks the current state first, so two callers can
//! never both resume, or both start, the same thread.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ResumeError, ThreadError};
use crate::types::{ExecutionHandle, PendingAction};

/// Maximum thread ID length
const MAX_THREAD_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq)]
enum ThreadState {
    Running,
    Suspended { pending: Vec<PendingAction> },
}

struct ThreadEntry {
    handle: Option<ExecutionHandle>,
    state: ThreadState,
    updated_at: DateTime<Utc>,
}

/// Read-only view of one thread
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub suspended: bool,
    pub pending: Vec<PendingAction>,
    pub updated_at: DateTime<Utc>,
}

/// Trim and validate a thread ID
pub fn normalize_thread_id(id: &str) -> Result<String, ThreadError> {
    let trimmed = id.trim();

    if trimmed.is_empty() {
        return Err(ThreadError::InvalidId("thread ID cannot be empty"));
    }
    if trimmed.len() > MAX_THREAD_ID_LEN {
        return Err(ThreadError::InvalidId("thread ID too long"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ThreadError::InvalidId("thread ID contains control characters"));
    }

    Ok(trimmed.to_string())
}

pub struct ThreadStore {
    threads: Arc<RwLock<HashMap<String, ThreadEntry>>>,
    max_threads: usize,
}

impl ThreadStore {
    pub fn new(max_threads: usize) -> Self {
        Self {
            threads: Arc::new(RwLock::new(HashMap::new())),
            max_threads,
        }
    }

    /// Mark a thread as running. Fails if it already has a live execution.
    pub async fn begin(&self, thread_id: &str) -> Result<String, ThreadError> {
        let thread_id = normalize_thread_id(thread_id)?;
        let mut threads = self.threads.write().await;

        match threads.get(&thread_id).map(|e| &e.state) {
            Some(ThreadState::Running) => return Err(ThreadError::Busy { thread_id }),
            Some(ThreadState::Suspended { .. }) => {
                return Err(ThreadError::Suspended { thread_id });
            }
            None => {}
        }
        if threads.len() >= self.max_threads {
            return Err(ThreadError::Capacity);
        }

        threads.insert(
            thread_id.clone(),
            ThreadEntry {
                handle: None,
                state: ThreadState::Running,
                updated_at: Utc::now(),
            },
        );
        debug!("Thread '{}' running", thread_id);
        Ok(thread_id)
    }

    /// Record the handle the engine issued for a running thread
    pub async fn attach(&self, thread_id: &str, handle: ExecutionHandle) {
        let mut threads = self.threads.write().await;
        if let Some(entry) = threads.get_mut(thread_id) {
            entry.handle = Some(handle);
            entry.updated_at = Utc::now();
        }
    }

    /// Settle a running thread after its segment ended.
    ///
    /// With pending actions the thread becomes suspended and keeps its
    /// handle. Otherwise the entry is removed and its handle returned so the
    /// caller can release it.
    pub async fn settle(
        &self,
        thread_id: &str,
        handle: Option<ExecutionHandle>,
        pending: Vec<PendingAction>,
    ) -> Option<ExecutionHandle> {
        let mut threads = self.threads.write().await;

        if pending.is_empty() {
            let removed = threads.remove(thread_id);
            debug!("Thread '{}' reached a terminal state", thread_id);
            return handle.or_else(|| removed.and_then(|e| e.handle));
        }

        match threads.get_mut(thread_id) {
            Some(entry) if entry.state == ThreadState::Running => {
                info!(
                    "Thread '{}' suspended with {} pending action(s)",
                    thread_id,
                    pending.len()
                );
                if handle.is_some() {
                    entry.handle = handle;
                }
                entry.state = ThreadState::Suspended { pending };
                entry.updated_at = Utc::now();
                None
            }
            _ => {
                warn!("Thread '{}' vanished before it could suspend", thread_id);
                handle
            }
        }
    }

    /// Validate decisions against the suspended batch and, only if they pass,
    /// move the thread back to running. Returns the handle and the batch.
    pub async fn claim_for_resume<F>(
        &self,
        thread_id: &str,
        validate: F,
    ) -> Result<(String, ExecutionHandle, Vec<PendingAction>), ResumeError>
    where
        F: FnOnce(&[PendingAction]) -> Result<(), ResumeError>,
    {
        let thread_id = normalize_thread_id(thread_id)?;
        let mut threads = self.threads.write().await;

        let entry = match threads.get_mut(&thread_id) {
            Some(entry) => entry,
            None => return Err(ThreadError::NotSuspended { thread_id }.into()),
        };
        let (pending, handle) = match (&entry.state, &entry.handle) {
            (ThreadState::Suspended { pending }, Some(handle)) => (pending, handle.clone()),
            _ => return Err(ThreadError::NotSuspended { thread_id }.into()),
        };

        validate(pending)?;

        let pending = match std::mem::replace(&mut entry.state, ThreadState::Running) {
            ThreadState::Suspended { pending } => pending,
            ThreadState::Running => Vec::new(),
        };
        entry.updated_at = Utc::now();
        Ok((thread_id, handle, pending))
    }

    /// Drop a suspended thread, returning its handle for release
    pub async fn abandon(&self, thread_id: &str) -> Result<Option<ExecutionHandle>, ThreadError> {
        let thread_id = normalize_thread_id(thread_id)?;
        let mut threads = self.threads.write().await;

        match threads.get(&thread_id).map(|e| &e.state) {
            Some(ThreadState::Suspended { .. }) => {
                let handle = threads.remove(&thread_id).and_then(|e| e.handle);
                info!("Thread '{}' abandoned", thread_id);
                Ok(handle)
            }
            Some(ThreadState::Running) => Err(ThreadError::Busy { thread_id }),
            None => Err(ThreadError::NotSuspended { thread_id }),
        }
    }

    /// Remove a thread whatever its state (its consumer went away)
    pub async fn cancel(&self, thread_id: &str) -> Option<ExecutionHandle> {
        let removed = self.threads.write().await.remove(thread_id);
        if removed.is_some() {
            info!("Thread '{}' cancelled", thread_id);
        }
        removed.and_then(|e| e.handle)
    }

    pub async fn pending(&self, thread_id: &str) -> Option<Vec<PendingAction>> {
        let thread_id = normalize_thread_id(thread_id).ok()?;
        let threads = self.threads.read().await;
        match &threads.get(&thread_id)?.state {
            ThreadState::Suspended { pending } => Some(pending.clone()),
            ThreadState::Running => None,
        }
    }

    pub async fn snapshot(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        let thread_id = normalize_thread_id(thread_id).ok()?;
        let threads = self.threads.read().await;
        threads.get(&thread_id).map(|e| snapshot_of(&thread_id, e))
    }

    /// Suspended threads idle for longer than `max_age`
    pub async fn expired(&self, max_age: Duration) -> Vec<String> {
        let cutoff = match chrono::Duration::from_std(max_age) {
            Ok(age) => Utc::now() - age,
            Err(_) => return Vec::new(),
        };
        let threads = self.threads.read().await;
        threads
            .iter()
            .filter(|(_, e)| matches!(e.state, ThreadState::Suspended { .. }) && e.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.threads.read().await.len()
    }
}

fn snapshot_of(thread_id: &str, entry: &ThreadEntry) -> ThreadSnapshot {
    let (suspended, pending) = match &entry.state {
        ThreadState::Suspended { pending } => (true, pending.clone()),
        ThreadState::Running => (false, Vec::new()),
    };
    ThreadSnapshot {
        thread_id: thread_id.to_string(),
        suspended,
        pending,
        updated_at: entry.updated_at,
    }
}
