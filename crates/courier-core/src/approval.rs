//! Approval/resume loop
//!
//! Owns the per-thread state machine (running, suspended, terminal) on top of
//! the stream adapter. Suspension is just a final event with
//! `requires_input`; the thread keeps its handle until a complete set of
//! decisions arrives or it is abandoned.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use async_stream::stream;

use crate::adapter::{EventStream, Segment, SegmentItem, TaskStreamAdapter};
use crate::config::{AdapterConfig, ApprovalConfig};
use crate::engine::ExecutionEngine;
use crate::error::{ResumeError, ThreadError};
use crate::threads::{ThreadSnapshot, ThreadStore};
use crate::types::{Decision, PendingAction, ResumeRequest, SubmitRequest};

pub struct ApprovalResumeLoop<E: ExecutionEngine + ?Sized + 'static> {
    engine: Arc<E>,
    adapter: TaskStreamAdapter<E>,
    threads: Arc<ThreadStore>,
    suspension_ttl: Duration,
}

impl<E: ExecutionEngine + ?Sized + 'static> ApprovalResumeLoop<E> {
    pub fn new(engine: Arc<E>, adapter: &AdapterConfig, approval: &ApprovalConfig) -> Self {
        Self {
            adapter: TaskStreamAdapter::new(Arc::clone(&engine), adapter),
            engine,
            threads: Arc::new(ThreadStore::new(approval.max_threads)),
            suspension_ttl: approval.suspension_ttl(),
        }
    }

    /// Start a new execution on a thread that has none
    pub async fn submit(&self, request: SubmitRequest) -> Result<EventStream, ThreadError> {
        let thread_id = self.threads.begin(&request.thread_id).await?;
        info!(thread_id = %thread_id, "Task submitted");

        let items = self.adapter.drive(Segment::Start {
            thread_id: thread_id.clone(),
            query: request.query,
        });
        Ok(self.supervise(thread_id, items))
    }

    /// Continue a suspended thread. Decisions must cover the pending batch
    /// exactly; otherwise nothing happens and the thread stays suspended.
    pub async fn resume(&self, request: ResumeRequest) -> Result<EventStream, ResumeError> {
        let decisions = request.decisions;
        let (thread_id, handle, pending) = self
            .threads
            .claim_for_resume(&request.thread_id, |pending| {
                validate_decisions(pending, &decisions)
            })
            .await
            .inspect_err(|e| warn!(thread_id = %request.thread_id, "Resume rejected: {}", e))?;

        info!(
            thread_id = %thread_id,
            decisions = decisions.len(),
            "Thread resumed"
        );
        let items = self.adapter.drive(Segment::Resume {
            handle,
            decisions: in_batch_order(&pending, decisions),
        });
        Ok(self.supervise(thread_id, items))
    }

    /// Pending batch of a suspended thread
    pub async fn pending(&self, thread_id: &str) -> Option<Vec<PendingAction>> {
        self.threads.pending(thread_id).await
    }

    /// Drop a suspended thread and release its checkpoint. Remote agents are
    /// not notified.
    pub async fn abandon(&self, thread_id: &str) -> Result<(), ThreadError> {
        if let Some(handle) = self.threads.abandon(thread_id).await? {
            self.engine.release(&handle).await;
        }
        Ok(())
    }

    /// Abandon every thread suspended for longer than the configured TTL
    pub async fn abandon_expired(&self) -> usize {
        let mut abandoned = 0;
        for thread_id in self.threads.expired(self.suspension_ttl).await {
            match self.abandon(&thread_id).await {
                Ok(()) => abandoned += 1,
                Err(e) => debug!("Skipped expiring thread '{}': {}", thread_id, e),
            }
        }
        if abandoned > 0 {
            info!("Abandoned {} expired suspended thread(s)", abandoned);
        }
        abandoned
    }

    pub async fn snapshot(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        self.threads.snapshot(thread_id).await
    }

    pub fn threads(&self) -> &Arc<ThreadStore> {
        &self.threads
    }

    /// Mirror segment lifecycle into the thread store; pass events through.
    fn supervise(&self, thread_id: String, items: BoxStream<'static, SegmentItem>) -> EventStream {
        let guard = RunGuard {
            thread_id,
            threads: Arc::clone(&self.threads),
            engine: Arc::clone(&self.engine),
            armed: true,
        };

        Box::pin(stream! {
            let mut guard = guard;
            let mut items = items;
            while let Some(item) = items.next().await {
                match item {
                    SegmentItem::Opened(handle) => {
                        guard.threads.attach(&guard.thread_id, handle).await;
                    }
                    SegmentItem::Settled(settlement) => {
                        guard.armed = false;
                        let released = guard
                            .threads
                            .settle(&guard.thread_id, settlement.handle, settlement.pending)
                            .await;
                        if let Some(handle) = released {
                            guard.engine.release(&handle).await;
                        }
                    }
                    SegmentItem::Event(event) => yield event,
                }
            }
        })
    }
}

/// Cancels a thread whose event stream is dropped before it settled
struct RunGuard<E: ExecutionEngine + ?Sized + 'static> {
    thread_id: String,
    threads: Arc<ThreadStore>,
    engine: Arc<E>,
    armed: bool,
}

impl<E: ExecutionEngine + ?Sized + 'static> Drop for RunGuard<E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Thread '{}' dropped outside a runtime; not cleaned up", self.thread_id);
            return;
        };
        let thread_id = std::mem::take(&mut self.thread_id);
        let threads = Arc::clone(&self.threads);
        let engine = Arc::clone(&self.engine);
        runtime.spawn(async move {
            if let Some(handle) = threads.cancel(&thread_id).await {
                engine.release(&handle).await;
            }
        });
    }
}

/// Check that `decisions` name every pending action exactly once
pub fn validate_decisions(
    pending: &[PendingAction],
    decisions: &[Decision],
) -> Result<(), ResumeError> {
    let known: HashSet<&str> = pending.iter().map(|p| p.action_id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(decisions.len());

    for decision in decisions {
        let id = decision.action_id.as_str();
        if !known.contains(id) {
            return Err(ResumeError::UnknownAction(id.to_string()));
        }
        if !seen.insert(id) {
            return Err(ResumeError::DuplicateDecision(id.to_string()));
        }
    }

    let missing: Vec<String> = pending
        .iter()
        .filter(|p| !seen.contains(p.action_id.as_str()))
        .map(|p| p.action_id.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ResumeError::MissingDecisions(missing));
    }
    Ok(())
}

fn in_batch_order(pending: &[PendingAction], mut decisions: Vec<Decision>) -> Vec<Decision> {
    decisions.sort_by_key(|d| {
        pending
            .iter()
            .position(|p| p.action_id == d.action_id)
            .unwrap_or(usize::MAX)
    });
    decisions
}
