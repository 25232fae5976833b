//! A2A (Agent-to-Agent) protocol types
//!
//! JSON-RPC 2.0 envelopes, agent cards, messages and task payloads, plus the
//! mapping of remote task updates onto `TaskStatusEvent`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::TaskStatusEvent;

/// Where agents publish their card
pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";
/// Card location used by older agents
pub const LEGACY_AGENT_CARD_PATH: &str = "/.well-known/agent.json";

pub const METHOD_SEND: &str = "message/send";
pub const METHOD_STREAM: &str = "message/stream";

/// Agent Card: advertises identity, skills and capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub push_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One piece of message or artifact content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    Data { data: Value },
    File { file: Value },
}

impl Part {
    /// Text rendering; data parts become compact JSON, files are skipped
    fn as_text(&self) -> Option<String> {
        match self {
            Self::Text { text } => Some(text.clone()),
            Self::Data { data } => Some(data.to_string()),
            Self::File { .. } => None,
        }
    }
}

fn parts_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(Part::as_text)
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Message {
    pub fn user_text(
        text: impl Into<String>,
        message_id: impl Into<String>,
        context_id: Option<String>,
    ) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
            message_id: message_id.into(),
            context_id,
            task_id: None,
        }
    }

    pub fn text(&self) -> String {
        parts_text(&self.parts)
    }
}

/// Outbound message wrapper; the wire format tags messages with `kind`
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage<'a> {
    kind: &'static str,
    #[serde(flatten)]
    message: &'a Message,
}

impl<'a> OutboundMessage<'a> {
    pub fn new(message: &'a Message) -> Self {
        Self {
            kind: "message",
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageSendParams<'a> {
    pub message: OutboundMessage<'a>,
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    AuthRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Failed | Self::Rejected
        )
    }

    /// The remote agent is waiting on its caller
    pub fn requires_input(&self) -> bool {
        matches!(self, Self::InputRequired | Self::AuthRequired)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Rejected)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::AuthRequired => "auth-required",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TaskStatus {
    fn text(&self) -> String {
        self.message.as_ref().map(Message::text).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(default)]
    pub artifact_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub context_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    pub task_id: String,
    #[serde(default)]
    pub context_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    pub task_id: String,
    #[serde(default)]
    pub context_id: Option<String>,
    pub artifact: Artifact,
    #[serde(default)]
    pub last_chunk: Option<bool>,
}

/// Result of `message/send`, or one item of a `message/stream`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskResult {
    Task(Task),
    Message(Message),
    StatusUpdate(TaskStatusUpdateEvent),
    ArtifactUpdate(TaskArtifactUpdateEvent),
}

impl TaskResult {
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::Task(t) => t.context_id.as_deref(),
            Self::Message(m) => m.context_id.as_deref(),
            Self::StatusUpdate(u) => u.context_id.as_deref(),
            Self::ArtifactUpdate(u) => u.context_id.as_deref(),
        }
    }

    /// Remote task state carried by this payload, if any
    pub fn state(&self) -> Option<TaskState> {
        match self {
            Self::Task(t) => Some(t.status.state),
            Self::StatusUpdate(u) => Some(u.status.state),
            Self::Message(_) => Some(TaskState::Completed),
            Self::ArtifactUpdate(_) => None,
        }
    }

    /// Map onto the local event shape.
    ///
    /// Input-required and terminal states are final; a direct message reply
    /// is a completed answer.
    pub fn to_event(&self) -> TaskStatusEvent {
        match self {
            Self::Message(message) => TaskStatusEvent::completed(message.text()),
            Self::Task(task) => {
                let mut text = task.status.text();
                if text.is_empty() {
                    text = task
                        .artifacts
                        .iter()
                        .map(|a| parts_text(&a.parts))
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n");
                }
                state_event(task.status.state, false, text)
            }
            Self::StatusUpdate(update) => {
                state_event(update.status.state, update.is_final, update.status.text())
            }
            Self::ArtifactUpdate(update) => TaskStatusEvent::working(parts_text(&update.artifact.parts)),
        }
    }
}

fn state_event(state: TaskState, is_final: bool, content: String) -> TaskStatusEvent {
    if state.requires_input() {
        TaskStatusEvent::input_required(content)
    } else if state.is_terminal() || is_final {
        TaskStatusEvent::completed(content)
    } else {
        TaskStatusEvent::working(content)
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<P> {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: P,
}

impl<P> JsonRpcRequest<P> {
    pub fn new(id: impl Into<String>, method: &'static str, params: P) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method,
            params,
        }
    }
}

/// JSON-RPC 2.0 response; exactly one of `result`/`error` is expected
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_card_minimal() {
        let card: AgentCard = serde_json::from_value(json!({
            "name": "Currency Agent",
            "url": "http://127.0.0.1:9000/",
            "capabilities": {"streaming": true},
            "skills": [{"id": "fx", "name": "Exchange rates"}]
        }))
        .unwrap();
        assert_eq!(card.name, "Currency Agent");
        assert!(card.capabilities.streaming);
        assert_eq!(card.skills[0].id, "fx");
        assert!(card.description.is_empty());
    }

    #[test]
    fn test_send_request_wire_format() {
        let message = Message::user_text("USD to GBP?", "m-1", Some("ctx-1".to_string()));
        let request = JsonRpcRequest::new(
            "r-1",
            METHOD_SEND,
            MessageSendParams {
                message: OutboundMessage::new(&message),
            },
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "message/send");
        let msg = &json["params"]["message"];
        assert_eq!(msg["kind"], "message");
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["messageId"], "m-1");
        assert_eq!(msg["contextId"], "ctx-1");
        assert_eq!(msg["parts"][0], json!({"kind": "text", "text": "USD to GBP?"}));
        assert!(msg.get("taskId").is_none());
    }

    #[test]
    fn test_completed_task_maps_to_final_event() {
        let result: TaskResult = serde_json::from_value(json!({
            "kind": "task",
            "id": "t-1",
            "contextId": "ctx-1",
            "status": {"state": "completed"},
            "artifacts": [{"artifactId": "a", "parts": [{"kind": "text", "text": "1 USD = 147円"}]}]
        }))
        .unwrap();
        assert_eq!(result.context_id(), Some("ctx-1"));
        assert_eq!(result.to_event(), TaskStatusEvent::completed("1 USD = 147円"));
    }

    #[test]
    fn test_input_required_update_requires_input() {
        let result: TaskResult = serde_json::from_value(json!({
            "kind": "status-update",
            "taskId": "t-1",
            "status": {
                "state": "input-required",
                "message": {"role": "agent", "messageId": "m", "parts": [{"kind": "text", "text": "Which currency?"}]}
            },
            "final": true
        }))
        .unwrap();
        assert_eq!(result.to_event(), TaskStatusEvent::input_required("Which currency?"));
    }

    #[test]
    fn test_working_update_and_artifact_are_progress() {
        let working: TaskResult = serde_json::from_value(json!({
            "kind": "status-update",
            "taskId": "t-1",
            "status": {"state": "working"}
        }))
        .unwrap();
        assert!(!working.to_event().is_final);

        let artifact: TaskResult = serde_json::from_value(json!({
            "kind": "artifact-update",
            "taskId": "t-1",
            "artifact": {"artifactId": "a", "parts": [{"kind": "data", "data": {"rate": 0.79}}]}
        }))
        .unwrap();
        let event = artifact.to_event();
        assert!(!event.is_final);
        assert!(event.content.contains("0.79"));
        assert!(artifact.state().is_none());
    }

    #[test]
    fn test_unknown_state_is_tolerated() {
        let status: TaskStatus = serde_json::from_value(json!({"state": "paused"})).unwrap();
        assert_eq!(status.state, TaskState::Unknown);
        assert!(!status.state.is_terminal());
        assert_eq!(TaskState::InputRequired.to_string(), "input-required");
    }
}
