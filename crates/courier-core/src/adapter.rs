//! Task stream adapter.
//!
//! Turns an engine's step trace into task status events. Every segment (a
//! fresh start or a resume) yields zero or more non-final progress events
//! followed by exactly one final event, whatever the engine does.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use async_stream::stream;

use crate::config::AdapterConfig;
use crate::engine::{ExecutionEngine, TerminalState};
use crate::error::EngineFault;
use crate::types::{
    Decision, ExecutionHandle, ExecutionStep, PendingAction, StepKind, StructuredResponse,
    TaskStatusEvent,
};

pub const INVOKING_PLACEHOLDER: &str = "Invoking a capability...";
pub const PROCESSING_PLACEHOLDER: &str = "Processing tool result...";
pub const NO_ANSWER_DIAGNOSTIC: &str = "Error: agent produced no final text.";

pub type EventStream = BoxStream<'static, TaskStatusEvent>;

/// What to drive
#[derive(Debug, Clone)]
pub enum Segment {
    Start { thread_id: String, query: String },
    Resume {
        handle: ExecutionHandle,
        decisions: Vec<Decision>,
    },
}

/// Where the execution stands once a segment's step trace is exhausted
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    /// `None` when the engine faulted before handing out a handle
    pub handle: Option<ExecutionHandle>,
    pub pending: Vec<PendingAction>,
}

impl Settlement {
    pub fn is_suspended(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Item of a driven segment.
///
/// `Opened` comes first when the engine accepted the segment. `Settled` is
/// always yielded immediately before the final event.
#[derive(Debug, Clone)]
pub enum SegmentItem {
    Opened(ExecutionHandle),
    Event(TaskStatusEvent),
    Settled(Settlement),
}

pub struct TaskStreamAdapter<E: ?Sized> {
    engine: Arc<E>,
    step_timeout: Option<Duration>,
}

impl<E: ?Sized> Clone for TaskStreamAdapter<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            step_timeout: self.step_timeout,
        }
    }
}

impl<E: ExecutionEngine + ?Sized + 'static> TaskStreamAdapter<E> {
    pub fn new(engine: Arc<E>, config: &AdapterConfig) -> Self {
        Self {
            engine,
            step_timeout: config.step_timeout(),
        }
    }

    /// Events for a new execution of `query` on `thread_id`
    pub fn stream(&self, query: &str, thread_id: &str) -> EventStream {
        events_only(self.drive(Segment::Start {
            thread_id: thread_id.to_string(),
            query: query.to_string(),
        }))
    }

    /// Events for a suspended execution continued with `decisions`
    pub fn resume_stream(&self, handle: ExecutionHandle, decisions: Vec<Decision>) -> EventStream {
        events_only(self.drive(Segment::Resume { handle, decisions }))
    }

    /// Drive one segment, exposing the handle and settlement alongside events
    pub fn drive(&self, segment: Segment) -> BoxStream<'static, SegmentItem> {
        let engine = Arc::clone(&self.engine);
        let step_timeout = self.step_timeout;

        Box::pin(stream! {
            let opened = match segment {
                Segment::Start { thread_id, query } => {
                    info!(thread_id = %thread_id, "Starting execution");
                    match engine.start(&thread_id, &query).await {
                        Ok(execution) => Ok((execution.handle, execution.steps)),
                        Err(fault) => Err((None, fault)),
                    }
                }
                Segment::Resume { handle, decisions } => {
                    info!(
                        thread_id = %handle.thread_id(),
                        decisions = decisions.len(),
                        "Resuming execution"
                    );
                    match engine.resume(&handle, decisions).await {
                        Ok(steps) => Ok((handle, steps)),
                        Err(fault) => Err((Some(handle), fault)),
                    }
                }
            };

            let (handle, mut steps) = match opened {
                Ok(opened) => opened,
                Err((handle, fault)) => {
                    for item in fault_items(handle, &fault) {
                        yield item;
                    }
                    return;
                }
            };
            yield SegmentItem::Opened(handle.clone());

            let mut last_index: Option<u64> = None;
            loop {
                let next = match step_timeout {
                    Some(limit) => match tokio::time::timeout(limit, steps.next()).await {
                        Ok(next) => next,
                        Err(_) => Some(Err(EngineFault::StepTimeout { secs: limit.as_secs() })),
                    },
                    None => steps.next().await,
                };

                match next {
                    None => break,
                    Some(Ok(step)) => {
                        if last_index.is_some_and(|prev| step.sequence_index <= prev) {
                            warn!(
                                thread_id = %handle.thread_id(),
                                index = step.sequence_index,
                                "Execution step out of order"
                            );
                        }
                        last_index = Some(step.sequence_index);
                        if let Some(event) = progress_event(&step) {
                            yield SegmentItem::Event(event);
                        }
                    }
                    Some(Err(fault)) => {
                        for item in fault_items(Some(handle), &fault) {
                            yield item;
                        }
                        return;
                    }
                }
            }
            drop(steps);

            match engine.state(&handle).await {
                Ok(state) => {
                    let event = finalize(&state);
                    debug!(
                        thread_id = %handle.thread_id(),
                        requires_input = event.requires_input,
                        "Execution segment finished"
                    );
                    yield SegmentItem::Settled(Settlement {
                        handle: Some(handle),
                        pending: state.pending,
                    });
                    yield SegmentItem::Event(event);
                }
                Err(fault) => {
                    for item in fault_items(Some(handle), &fault) {
                        yield item;
                    }
                }
            }
        })
    }
}

fn events_only(items: BoxStream<'static, SegmentItem>) -> EventStream {
    Box::pin(items.filter_map(|item| async move {
        match item {
            SegmentItem::Event(event) => Some(event),
            _ => None,
        }
    }))
}

/// Progress event for one step, if the step is surfaced at all.
/// Tool arguments and results are never echoed.
pub fn progress_event(step: &ExecutionStep) -> Option<TaskStatusEvent> {
    match step.kind {
        StepKind::ToolCallRequested { .. } => Some(TaskStatusEvent::working(INVOKING_PLACEHOLDER)),
        StepKind::ToolResult { .. } => Some(TaskStatusEvent::working(PROCESSING_PLACEHOLDER)),
        StepKind::AssistantText { .. } => None,
    }
}

/// Final event for an exhausted step trace
pub fn finalize(state: &TerminalState) -> TaskStatusEvent {
    if state.is_suspended() {
        return TaskStatusEvent::input_required(describe_pending(&state.pending));
    }

    if let Some(structured) = state
        .structured_response
        .as_ref()
        .and_then(StructuredResponse::from_value)
    {
        return structured.into_event();
    }

    match state.last_assistant_text() {
        Some(text) => TaskStatusEvent::completed(text),
        None => TaskStatusEvent::completed(NO_ANSWER_DIAGNOSTIC),
    }
}

fn describe_pending(pending: &[PendingAction]) -> String {
    let tools = pending
        .iter()
        .map(|p| p.tool_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Approval required for {} pending action(s): {}",
        pending.len(),
        tools
    )
}

fn fault_items(handle: Option<ExecutionHandle>, fault: &EngineFault) -> [SegmentItem; 2] {
    warn!("Execution fault: {}", fault);
    [
        SegmentItem::Settled(Settlement {
            handle,
            pending: Vec::new(),
        }),
        SegmentItem::Event(TaskStatusEvent::failed(format!("Execution failed: {}", fault))),
    ]
}
