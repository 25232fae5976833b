//! Error types for executions, threads and resume input

use thiserror::Error;

/// The execution engine could not proceed. Always terminal for the execution.
#[derive(Debug, Clone, Error)]
pub enum EngineFault {
    #[error("no execution found for thread '{thread_id}'")]
    UnknownExecution { thread_id: String },

    #[error("execution handle for thread '{thread_id}' is stale")]
    StaleHandle { thread_id: String },

    #[error("thread '{thread_id}' is suspended awaiting decisions")]
    AlreadySuspended { thread_id: String },

    #[error("thread '{thread_id}' is not suspended")]
    NotSuspended { thread_id: String },

    #[error("model call failed: {0}")]
    Model(String),

    #[error("step limit of {limit} reached without a final answer")]
    StepLimit { limit: usize },

    #[error("timed out waiting for the next execution step after {secs}s")]
    StepTimeout { secs: u64 },

    #[error("{0}")]
    Other(String),
}

/// Problems with the thread table itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    #[error("invalid thread id: {0}")]
    InvalidId(&'static str),

    #[error("thread '{thread_id}' already has a running execution")]
    Busy { thread_id: String },

    #[error("thread '{thread_id}' is suspended; resume or abandon it first")]
    Suspended { thread_id: String },

    #[error("thread '{thread_id}' has no suspended execution")]
    NotSuspended { thread_id: String },

    #[error("maximum number of active threads reached")]
    Capacity,
}

/// Resume input rejected before any side effect. The thread stays suspended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("missing decisions for actions: {}", .0.join(", "))]
    MissingDecisions(Vec<String>),

    #[error("duplicate decision for action '{0}'")]
    DuplicateDecision(String),

    #[error("decision references unknown action '{0}'")]
    UnknownAction(String),

    #[error(transparent)]
    Thread(#[from] ThreadError),
}

impl ResumeError {
    /// Whether the caller sent decisions that do not match the batch
    pub fn is_malformed_input(&self) -> bool {
        !matches!(self, Self::Thread(_))
    }
}
