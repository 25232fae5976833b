//! A2A (Agent-to-Agent) delegation for Courier
//!
//! Client for remote agents speaking A2A JSON-RPC, a registry of known
//! agents, and the tools that let the reasoning loop discover and message
//! them.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod tool;

pub use client::{RemoteAgentClient, RemoteAgentError, RemoteReply};
pub use protocol::{AgentCard, TaskResult, TaskState};
pub use registry::{AgentRegistry, validate_target_url};
pub use tool::{DiscoverAgentTool, ListAgentsTool, SendMessageTool};
