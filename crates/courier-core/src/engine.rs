//! Execution engine seam.
//!
//! An engine produces an ordered step trace for one execution, exposes its
//! terminal state once the trace is exhausted, and accepts decisions to
//! resume a suspended execution. The adapter and the approval loop only ever
//! talk to this trait.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::EngineFault;
use crate::llm::{ChatMessage, ChatRole};
use crate::types::{Decision, ExecutionHandle, ExecutionStep, PendingAction};

pub type StepStream = BoxStream<'static, Result<ExecutionStep, EngineFault>>;

/// A freshly started execution
pub struct Execution {
    pub handle: ExecutionHandle,
    pub steps: StepStream,
}

/// What the engine looks like after its step stream ended
#[derive(Debug, Clone, Default)]
pub struct TerminalState {
    /// Conversation history for the thread, oldest first
    pub messages: Vec<ChatMessage>,
    /// Raw structured response, if the engine produced one
    pub structured_response: Option<Value>,
    /// Non-empty when the execution is suspended on approvals
    pub pending: Vec<PendingAction>,
}

impl TerminalState {
    pub fn is_suspended(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Most recent non-empty assistant text, scanning backward
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == ChatRole::Assistant)
            .map(|m| m.text())
            .find(|text| !text.trim().is_empty())
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Start a new execution on a thread
    async fn start(&self, thread_id: &str, query: &str) -> Result<Execution, EngineFault>;

    /// Continue a suspended execution with one decision per pending action
    async fn resume(
        &self,
        handle: &ExecutionHandle,
        decisions: Vec<Decision>,
    ) -> Result<StepStream, EngineFault>;

    /// Terminal state after the latest step stream was exhausted
    async fn state(&self, handle: &ExecutionHandle) -> Result<TerminalState, EngineFault>;

    /// Drop everything tied to the handle. Unknown handles are ignored.
    async fn release(&self, handle: &ExecutionHandle);
}
