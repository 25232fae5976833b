//! Data model shared by the stream adapter, the tool gate and the approval loop

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Ordered mapping of parameter name to value
pub type Arguments = serde_json::Map<String, Value>;

/// What one execution step carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    AssistantText {
        text: String,
    },
    ToolCallRequested {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// One internal unit of agent progress, produced by an execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub sequence_index: u64,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl ExecutionStep {
    pub fn new(sequence_index: u64, kind: StepKind) -> Self {
        Self {
            sequence_index,
            kind,
        }
    }
}

/// Externally visible progress or outcome of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    pub is_final: bool,
    pub requires_input: bool,
    pub content: String,
}

impl TaskStatusEvent {
    /// Non-final progress event
    pub fn working(content: impl Into<String>) -> Self {
        Self {
            is_final: false,
            requires_input: false,
            content: content.into(),
        }
    }

    /// Final event for a finished execution
    pub fn completed(content: impl Into<String>) -> Self {
        Self {
            is_final: true,
            requires_input: false,
            content: content.into(),
        }
    }

    /// Final event for an execution waiting on the caller
    pub fn input_required(content: impl Into<String>) -> Self {
        Self {
            is_final: true,
            requires_input: true,
            content: content.into(),
        }
    }

    /// Final event for an execution that could not proceed.
    ///
    /// Shape-wise identical to `completed`; kept separate so call sites read
    /// as what they mean.
    pub fn failed(content: impl Into<String>) -> Self {
        Self::completed(content)
    }
}

/// Status an engine may attach to its final answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    #[serde(alias = "input-required")]
    InputRequired,
    Completed,
    Error,
}

/// Structured final answer: `{"status": "...", "message": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredResponse {
    pub status: ResponseStatus,
    pub message: String,
}

impl StructuredResponse {
    /// Parse a raw value, returning `None` unless it is well-formed with a
    /// non-empty message.
    pub fn from_value(value: &Value) -> Option<Self> {
        let parsed: Self = serde_json::from_value(value.clone()).ok()?;
        if parsed.message.trim().is_empty() {
            return None;
        }
        Some(parsed)
    }

    pub fn into_event(self) -> TaskStatusEvent {
        match self.status {
            ResponseStatus::InputRequired => TaskStatusEvent::input_required(self.message),
            ResponseStatus::Completed => TaskStatusEvent::completed(self.message),
            ResponseStatus::Error => TaskStatusEvent::failed(self.message),
        }
    }
}

/// A tool invocation held back until a decision arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub action_id: String,
    pub tool_name: String,
    pub arguments: Arguments,
}

/// Verdict on a pending action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Reject,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" | "yes" | "y" => Ok(Self::Approve),
            "reject" | "rejected" | "no" | "n" => Ok(Self::Reject),
            other => Err(format!("expected 'approve' or 'reject', got '{}'", other)),
        }
    }
}

/// Human or policy decision on one pending action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action_id: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Decision {
    pub fn approve(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            verdict: Verdict::Approve,
            note: None,
        }
    }

    pub fn reject(action_id: impl Into<String>, note: Option<String>) -> Self {
        Self {
            action_id: action_id.into(),
            verdict: Verdict::Reject,
            note,
        }
    }
}

/// Continuation token for one execution.
///
/// Only the engine interprets the contents; everyone else passes it back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle {
    thread_id: String,
    execution_id: Uuid,
    checkpoint: u64,
}

impl ExecutionHandle {
    pub fn new(thread_id: impl Into<String>, checkpoint: u64) -> Self {
        Self {
            thread_id: thread_id.into(),
            execution_id: Uuid::new_v4(),
            checkpoint,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }
}

/// Inbound task submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub query: String,
    pub thread_id: String,
}

/// Inbound resume call for a suspended thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub thread_id: String,
    pub decisions: Vec<Decision>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_serializes_flat() {
        let step = ExecutionStep::new(
            3,
            StepKind::AssistantText {
                text: "hi".to_string(),
            },
        );
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["sequence_index"], 3);
        assert_eq!(json["kind"], "assistant_text");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn test_event_constructors() {
        assert!(!TaskStatusEvent::working("x").is_final);
        let done = TaskStatusEvent::completed("x");
        assert!(done.is_final && !done.requires_input);
        let ask = TaskStatusEvent::input_required("x");
        assert!(ask.is_final && ask.requires_input);
        assert_eq!(TaskStatusEvent::failed("x"), TaskStatusEvent::completed("x"));
    }

    #[test]
    fn test_structured_response_well_formed() {
        let value = serde_json::json!({"status": "input_required", "message": "Which city?"});
        let parsed = StructuredResponse::from_value(&value).unwrap();
        assert_eq!(parsed.status, ResponseStatus::InputRequired);
        assert!(parsed.into_event().requires_input);
    }

    #[test]
    fn test_structured_response_malformed() {
        assert!(StructuredResponse::from_value(&serde_json::json!({"status": "later"})).is_none());
        assert!(StructuredResponse::from_value(&serde_json::json!("completed")).is_none());
        assert!(
            StructuredResponse::from_value(&serde_json::json!({"status": "completed", "message": "  "}))
                .is_none()
        );
    }

    #[test]
    fn test_verdict_parse() {
        assert_eq!("Approve".parse::<Verdict>().unwrap(), Verdict::Approve);
        assert_eq!("reject".parse::<Verdict>().unwrap(), Verdict::Reject);
        assert!("maybe".parse::<Verdict>().is_err());
    }

    #[test]
    fn test_decision_wire_format() {
        let json = r#"{"action_id":"a1","verdict":"reject","note":"not now"}"#;
        let decision: Decision = serde_json::from_str(json).unwrap();
        assert_eq!(decision, Decision::reject("a1", Some("not now".to_string())));

        let approve: Decision = serde_json::from_str(r#"{"action_id":"a2","verdict":"approve"}"#).unwrap();
        assert!(approve.note.is_none());
    }

    #[test]
    fn test_handle_round_trips_unchanged() {
        let handle = ExecutionHandle::new("t1", 4);
        let json = serde_json::to_string(&handle).unwrap();
        let back: ExecutionHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
        assert_eq!(back.thread_id(), "t1");
        assert_eq!(back.checkpoint(), 4);
    }
}
