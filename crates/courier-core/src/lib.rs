//! Courier core: turns agent execution traces into task status events, gates
//! tool invocations, and suspends/resumes executions around human approval.

pub mod adapter;
pub mod agent_loop;
pub mod approval;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod llm;
pub mod threads;
pub mod tools;
pub mod types;

pub use adapter::{EventStream, TaskStreamAdapter};
pub use agent_loop::ToolLoopEngine;
pub use approval::ApprovalResumeLoop;
pub use config::CourierConfig;
pub use engine::{ExecutionEngine, TerminalState};
pub use error::{EngineFault, ResumeError, ThreadError};
pub use gate::{GateVerdict, ToolInvocationGate};
pub use tools::{ToolHandler, ToolRegistry};
pub use types::{
    Decision, ExecutionHandle, ExecutionStep, PendingAction, ResumeRequest, StepKind,
    SubmitRequest, TaskStatusEvent, Verdict,
};
