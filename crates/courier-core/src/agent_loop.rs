//! Built-in reasoning engine: model → tools → model until the model answers.
//!
//! Conversations are checkpointed in memory per thread. A model turn whose
//! calls include at least one approval-gated call is held back whole and
//! replayed, in the order the model proposed it, once decisions arrive.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{Execution, ExecutionEngine, StepStream, TerminalState};
use crate::error::EngineFault;
use crate::gate::{GateVerdict, PolicyViolation, ToolInvocationGate};
use crate::llm::{ChatBlock, ChatMessage, ChatResponseBlock, LlmProvider};
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::types::{
    Decision, ExecutionHandle, ExecutionStep, PendingAction, StepKind, Verdict,
};

pub const DEFAULT_SUPERVISOR_PROMPT: &str = "\
You are a supervisor that answers requests by delegating to remote agents.
Use a2a_list_discovered_agents and a2a_discover_agent to learn what each agent \
can do, then call a2a_send_message with the agent's full URL, including scheme \
and port (for example http://127.0.0.1:9000). Never pass an agent's name as the URL.
Some calls need human approval. If a call is rejected, do not propose the same \
call again; tell the user what happened instead.
When you have the answer, reply with it in plain text.";

pub struct ToolLoopEngine {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    gate: ToolInvocationGate,
    system_prompt: String,
    max_steps: usize,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

#[derive(Default)]
struct Checkpoint {
    conversation: Conversation,
    active: Option<ActiveExecution>,
}

#[derive(Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
    /// Fingerprints of calls that were rejected or vetoed
    rejected_calls: HashSet<String>,
}

struct ActiveExecution {
    execution_id: Uuid,
    next_sequence: u64,
    turns: usize,
    structured_response: Option<Value>,
    /// History length before an assistant turn whose results are not in yet
    open_turn: Option<usize>,
    suspended: Option<Vec<PlannedCall>>,
}

impl ActiveExecution {
    fn step(&mut self, kind: StepKind) -> ExecutionStep {
        let step = ExecutionStep::new(self.next_sequence, kind);
        self.next_sequence += 1;
        step
    }
}

#[derive(Debug, Clone)]
struct PlannedCall {
    call_id: String,
    tool_name: String,
    input: Value,
    disposition: Disposition,
}

#[derive(Debug, Clone)]
enum Disposition {
    Run,
    Blocked(PolicyViolation),
    /// Identical to a call already rejected in this conversation
    Repeat,
    Pending { action_id: String },
}

struct Resumption {
    calls: Vec<PlannedCall>,
    decisions: HashMap<String, Decision>,
}

struct TurnOutcome {
    steps: Vec<ExecutionStep>,
    calls: Vec<PlannedCall>,
    suspended: bool,
}

impl ToolLoopEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        gate: ToolInvocationGate,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                provider,
                tools,
                gate,
                system_prompt: config
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SUPERVISOR_PROMPT.to_string()),
                max_steps: config.max_steps,
                checkpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Conversation history recorded for a thread
    pub async fn conversation(&self, thread_id: &str) -> Vec<ChatMessage> {
        let checkpoints = self.inner.checkpoints.lock().await;
        checkpoints
            .get(thread_id)
            .map(|c| c.conversation.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionEngine for ToolLoopEngine {
    async fn start(&self, thread_id: &str, query: &str) -> Result<Execution, EngineFault> {
        let handle = {
            let mut checkpoints = self.inner.checkpoints.lock().await;
            let checkpoint = checkpoints.entry(thread_id.to_string()).or_default();

            if let Some(active) = &checkpoint.active {
                if active.suspended.is_some() {
                    return Err(EngineFault::AlreadySuspended {
                        thread_id: thread_id.to_string(),
                    });
                }
                if let Some(turn_start) = active.open_turn {
                    checkpoint.conversation.messages.truncate(turn_start);
                }
            }

            let handle =
                ExecutionHandle::new(thread_id, checkpoint.conversation.messages.len() as u64);
            checkpoint.conversation.messages.push(ChatMessage::user(query));
            checkpoint.active = Some(ActiveExecution {
                execution_id: handle.execution_id(),
                next_sequence: 0,
                turns: 0,
                structured_response: None,
                open_turn: None,
                suspended: None,
            });
            handle
        };

        debug!(thread_id = %thread_id, "Execution started");
        let steps: StepStream = Box::pin(run(
            Arc::clone(&self.inner),
            thread_id.to_string(),
            handle.execution_id(),
            None,
        ));
        Ok(Execution { handle, steps })
    }

    async fn resume(
        &self,
        handle: &ExecutionHandle,
        decisions: Vec<Decision>,
    ) -> Result<StepStream, EngineFault> {
        let thread_id = handle.thread_id();
        let calls = {
            let mut checkpoints = self.inner.checkpoints.lock().await;
            let active = active_mut(&mut checkpoints, handle)?;

            let Some(calls) = &active.suspended else {
                return Err(EngineFault::NotSuspended {
                    thread_id: thread_id.to_string(),
                });
            };
            let expected: HashSet<&str> = calls
                .iter()
                .filter_map(|c| match &c.disposition {
                    Disposition::Pending { action_id } => Some(action_id.as_str()),
                    _ => None,
                })
                .collect();
            let given: HashSet<&str> = decisions.iter().map(|d| d.action_id.as_str()).collect();
            if given != expected || decisions.len() != expected.len() {
                return Err(EngineFault::Other(format!(
                    "decisions for thread '{}' do not match its pending actions",
                    thread_id
                )));
            }

            active.suspended.take().unwrap_or_default()
        };

        let decisions = decisions
            .into_iter()
            .map(|d| (d.action_id.clone(), d))
            .collect();
        debug!(thread_id = %thread_id, "Execution resumed");
        Ok(Box::pin(run(
            Arc::clone(&self.inner),
            thread_id.to_string(),
            handle.execution_id(),
            Some(Resumption { calls, decisions }),
        )))
    }

    async fn state(&self, handle: &ExecutionHandle) -> Result<TerminalState, EngineFault> {
        let mut checkpoints = self.inner.checkpoints.lock().await;
        let active = active_mut(&mut checkpoints, handle)?;
        let structured_response = active.structured_response.clone();
        let pending = active
            .suspended
            .as_deref()
            .map(pending_actions)
            .unwrap_or_default();

        let messages = checkpoints
            .get(handle.thread_id())
            .map(|c| c.conversation.messages.clone())
            .unwrap_or_default();
        Ok(TerminalState {
            messages,
            structured_response,
            pending,
        })
    }

    async fn release(&self, handle: &ExecutionHandle) {
        let mut checkpoints = self.inner.checkpoints.lock().await;
        let Some(checkpoint) = checkpoints.get_mut(handle.thread_id()) else {
            return;
        };
        let matches = checkpoint
            .active
            .as_ref()
            .is_some_and(|a| a.execution_id == handle.execution_id());
        if !matches {
            return;
        }
        if let Some(turn_start) = checkpoint.active.take().and_then(|a| a.open_turn) {
            // Unanswered tool calls would poison the next model request.
            checkpoint.conversation.messages.truncate(turn_start);
        }
        debug!(thread_id = %handle.thread_id(), "Execution released");
    }
}

fn active_mut<'a>(
    checkpoints: &'a mut HashMap<String, Checkpoint>,
    handle: &ExecutionHandle,
) -> Result<&'a mut ActiveExecution, EngineFault> {
    let thread_id = handle.thread_id();
    let checkpoint = checkpoints
        .get_mut(thread_id)
        .ok_or_else(|| EngineFault::UnknownExecution {
            thread_id: thread_id.to_string(),
        })?;
    match checkpoint.active.as_mut() {
        Some(active) if active.execution_id == handle.execution_id() => Ok(active),
        _ => Err(EngineFault::StaleHandle {
            thread_id: thread_id.to_string(),
        }),
    }
}

fn run(
    inner: Arc<LoopInner>,
    thread_id: String,
    execution_id: Uuid,
    resumed: Option<Resumption>,
) -> impl Stream<Item = Result<ExecutionStep, EngineFault>> + Send + 'static {
    try_stream! {
        if let Some(Resumption { calls, decisions }) = resumed {
            let steps = inner.resolve_all(&thread_id, execution_id, &calls, &decisions).await?;
            for step in steps {
                yield step;
            }
        }

        let tools = inner.tools.list_tools();
        loop {
            let messages = inner.begin_turn(&thread_id, execution_id).await?;
            let response = inner
                .provider
                .chat(&messages, &tools, &inner.system_prompt)
                .await
                .map_err(|e| EngineFault::Model(e.to_string()))?;
            debug!(
                thread_id = %thread_id,
                blocks = response.blocks.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "Model turn complete"
            );

            let outcome = inner.record_turn(&thread_id, execution_id, response.blocks).await?;
            for step in outcome.steps {
                yield step;
            }
            if outcome.calls.is_empty() || outcome.suspended {
                break;
            }

            let steps = inner
                .resolve_all(&thread_id, execution_id, &outcome.calls, &HashMap::new())
                .await?;
            for step in steps {
                yield step;
            }
        }
    }
}

impl LoopInner {
    async fn with_active<T>(
        &self,
        thread_id: &str,
        execution_id: Uuid,
        f: impl FnOnce(&mut Conversation, &mut ActiveExecution) -> T,
    ) -> Result<T, EngineFault> {
        let mut checkpoints = self.checkpoints.lock().await;
        match checkpoints.get_mut(thread_id) {
            Some(Checkpoint {
                conversation,
                active: Some(active),
            }) if active.execution_id == execution_id => Ok(f(conversation, active)),
            _ => Err(EngineFault::StaleHandle {
                thread_id: thread_id.to_string(),
            }),
        }
    }

    /// Count a model turn against the limit and snapshot the history for it
    async fn begin_turn(
        &self,
        thread_id: &str,
        execution_id: Uuid,
    ) -> Result<Vec<ChatMessage>, EngineFault> {
        let limit = self.max_steps;
        self.with_active(thread_id, execution_id, |conversation, active| {
            if active.turns >= limit {
                return Err(EngineFault::StepLimit { limit });
            }
            active.turns += 1;
            Ok(conversation.messages.clone())
        })
        .await?
    }

    /// Append the assistant turn and classify its calls
    async fn record_turn(
        &self,
        thread_id: &str,
        execution_id: Uuid,
        blocks: Vec<ChatResponseBlock>,
    ) -> Result<TurnOutcome, EngineFault> {
        let mut texts = Vec::new();
        let mut proposed = Vec::new();
        for block in &blocks {
            match block {
                ChatResponseBlock::Text { text } => texts.push(text.as_str()),
                ChatResponseBlock::ToolCall { id, name, input } => {
                    proposed.push((id.clone(), name.clone(), input.clone()))
                }
            }
        }
        let text = texts.join("\n");
        let message = ChatMessage::assistant(blocks.into_iter().map(ChatBlock::from).collect());

        self.with_active(thread_id, execution_id, |conversation, active| {
            let turn_start = conversation.messages.len();
            conversation.messages.push(message);

            let mut steps = Vec::new();
            if !text.trim().is_empty() {
                steps.push(active.step(StepKind::AssistantText { text: text.clone() }));
            }

            if proposed.is_empty() {
                active.structured_response = structured_from_text(&text);
                return TurnOutcome {
                    steps,
                    calls: Vec::new(),
                    suspended: false,
                };
            }

            active.open_turn = Some(turn_start);
            let mut action_ids = HashSet::new();
            let calls: Vec<PlannedCall> = proposed
                .into_iter()
                .map(|(call_id, tool_name, input)| {
                    let disposition =
                        self.plan(conversation, &tool_name, &input, &call_id, &mut action_ids);
                    PlannedCall {
                        call_id,
                        tool_name,
                        input,
                        disposition,
                    }
                })
                .collect();

            for call in &calls {
                steps.push(active.step(StepKind::ToolCallRequested {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.input.clone(),
                }));
            }

            let pending = calls
                .iter()
                .filter(|c| matches!(c.disposition, Disposition::Pending { .. }))
                .count();
            let suspended = pending > 0;
            if suspended {
                info!(
                    thread_id = %thread_id,
                    "Model turn held for approval: {} of {} call(s) pending",
                    pending,
                    calls.len()
                );
                active.suspended = Some(calls.clone());
            }
            TurnOutcome {
                steps,
                calls,
                suspended,
            }
        })
        .await
    }

    fn plan(
        &self,
        conversation: &mut Conversation,
        tool_name: &str,
        input: &Value,
        call_id: &str,
        action_ids: &mut HashSet<String>,
    ) -> Disposition {
        let fingerprint = fingerprint(tool_name, input);
        if conversation.rejected_calls.contains(&fingerprint) {
            warn!("Blocked re-proposal of rejected call to '{}'", tool_name);
            return Disposition::Repeat;
        }

        match self.gate.classify(tool_name, input) {
            GateVerdict::AutoApprove => Disposition::Run,
            GateVerdict::Rejected(violation) => {
                conversation.rejected_calls.insert(fingerprint);
                Disposition::Blocked(violation)
            }
            GateVerdict::RequireApproval => {
                let action_id = if call_id.is_empty() || action_ids.contains(call_id) {
                    Uuid::new_v4().to_string()
                } else {
                    call_id.to_string()
                };
                action_ids.insert(action_id.clone());
                Disposition::Pending { action_id }
            }
        }
    }

    /// Resolve every call of a turn in proposal order and close the turn
    async fn resolve_all(
        &self,
        thread_id: &str,
        execution_id: Uuid,
        calls: &[PlannedCall],
        decisions: &HashMap<String, Decision>,
    ) -> Result<Vec<ExecutionStep>, EngineFault> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            let mut rejected = false;
            let (content, is_error) = match &call.disposition {
                Disposition::Run => self.invoke(call).await,
                Disposition::Blocked(violation) => (violation.tool_result(), true),
                Disposition::Repeat => (repeat_result(&call.tool_name), true),
                Disposition::Pending { action_id } => match decisions.get(action_id) {
                    Some(decision) if decision.verdict == Verdict::Approve => {
                        info!(thread_id = %thread_id, "Approved call to '{}'", call.tool_name);
                        self.invoke(call).await
                    }
                    decision => {
                        info!(thread_id = %thread_id, "Rejected call to '{}'", call.tool_name);
                        rejected = true;
                        let note = decision.and_then(|d| d.note.as_deref());
                        (rejection_result(&call.tool_name, note), true)
                    }
                },
            };
            outcomes.push((call, content, is_error, rejected));
        }

        self.with_active(thread_id, execution_id, |conversation, active| {
            let mut steps = Vec::with_capacity(outcomes.len());
            let mut blocks = Vec::with_capacity(outcomes.len());
            for (call, content, is_error, rejected) in outcomes {
                if rejected {
                    conversation
                        .rejected_calls
                        .insert(fingerprint(&call.tool_name, &call.input));
                }
                steps.push(active.step(StepKind::ToolResult {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    content: content.clone(),
                    is_error,
                }));
                blocks.push(ChatBlock::ToolResult {
                    tool_call_id: call.call_id.clone(),
                    content,
                });
            }
            conversation.messages.push(ChatMessage::tool_results(blocks));
            active.open_turn = None;
            steps
        })
        .await
    }

    async fn invoke(&self, call: &PlannedCall) -> (String, bool) {
        match self.tools.execute(&call.tool_name, call.input.clone()).await {
            Ok(output) => (output, false),
            Err(e) => (format!("Error: {}", e), true),
        }
    }
}

fn pending_actions(calls: &[PlannedCall]) -> Vec<PendingAction> {
    calls
        .iter()
        .filter_map(|call| match &call.disposition {
            Disposition::Pending { action_id } => Some(PendingAction {
                action_id: action_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.input.as_object().cloned().unwrap_or_default(),
            }),
            _ => None,
        })
        .collect()
}

fn rejection_result(tool_name: &str, note: Option<&str>) -> String {
    let mut text = format!("The call to '{}' was rejected by the reviewer", tool_name);
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        text.push_str(": ");
        text.push_str(note);
    }
    text.push_str(". It was not executed. Do not propose this call again.");
    text
}

fn repeat_result(tool_name: &str) -> String {
    format!(
        "This call to '{}' was already rejected in this conversation and was not executed. \
         Do not propose it again.",
        tool_name
    )
}

/// `{"status", "message"}` object in the model's final text, if any
fn structured_from_text(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    value.get("status")?;
    value.is_object().then_some(value)
}

/// Tool name plus arguments with object keys sorted
fn fingerprint(tool_name: &str, input: &Value) -> String {
    format!("{}:{}", tool_name, canonical(input))
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateConfig;
    use crate::llm::{ChatResponse, ChatUsage, StopReason};
    use crate::tools::{ToolDefinition, ToolHandler, json_schema};
    use anyhow::Result;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        script: std::sync::Mutex<VecDeque<ChatResponse>>,
        seen: std::sync::Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _system: &str,
        ) -> Result<ChatResponse> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    fn say(text: &str) -> ChatResponse {
        ChatResponse {
            blocks: vec![ChatResponseBlock::Text {
                text: text.to_string(),
            }],
            stop_reason: StopReason::EndTurn,
            usage: ChatUsage::default(),
        }
    }

    fn call(id: &str, name: &str, input: Value) -> ChatResponse {
        ChatResponse {
            blocks: vec![ChatResponseBlock::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            usage: ChatUsage::default(),
        }
    }

    struct CountingTool {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolHandler for CountingTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Counts invocations"
        }

        fn input_schema(&self) -> Value {
            json_schema(json!({"message": {"type": "string"}}), vec!["message"])
        }

        async fn execute(&self, input: Value) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} handled {}", self.name, input["message"]))
        }
    }

    struct Fixture {
        engine: ToolLoopEngine,
        provider: Arc<ScriptedProvider>,
        lookup: Arc<CountingTool>,
        delegate: Arc<CountingTool>,
    }

    fn fixture(script: Vec<ChatResponse>, max_steps: usize) -> Fixture {
        let provider = ScriptedProvider::new(script);
        let lookup = Arc::new(CountingTool {
            name: "lookup",
            calls: AtomicUsize::new(0),
        });
        let delegate = Arc::new(CountingTool {
            name: "a2a_send_message",
            calls: AtomicUsize::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(lookup.clone());
        registry.register(delegate.clone());

        let gate = ToolInvocationGate::new(&GateConfig {
            approval_required: vec!["a2a_send_message".to_string()],
            banned_keywords: vec!["hack".to_string()],
            ..Default::default()
        });
        let engine = ToolLoopEngine::new(
            provider.clone(),
            Arc::new(registry),
            gate,
            &EngineConfig {
                max_steps,
                system_prompt: None,
            },
        );
        Fixture {
            engine,
            provider,
            lookup,
            delegate,
        }
    }

    async fn drain(steps: StepStream) -> Vec<Result<ExecutionStep, EngineFault>> {
        steps.collect().await
    }

    fn kinds(steps: &[Result<ExecutionStep, EngineFault>]) -> Vec<&'static str> {
        steps
            .iter()
            .map(|s| match s {
                Ok(ExecutionStep {
                    kind: StepKind::AssistantText { .. },
                    ..
                }) => "text",
                Ok(ExecutionStep {
                    kind: StepKind::ToolCallRequested { .. },
                    ..
                }) => "call",
                Ok(ExecutionStep {
                    kind: StepKind::ToolResult { .. },
                    ..
                }) => "result",
                Err(_) => "fault",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_auto_approved_tool_loop() {
        let f = fixture(
            vec![call("c1", "lookup", json!({"message": "USD"})), say("1 USD = 147円")],
            10,
        );
        let execution = f.engine.start("t1", "rate?").await.unwrap();
        let steps = drain(execution.steps).await;

        assert_eq!(kinds(&steps), vec!["call", "result", "text"]);
        let indices: Vec<u64> = steps.iter().map(|s| s.as_ref().unwrap().sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(f.lookup.calls.load(Ordering::SeqCst), 1);

        let state = f.engine.state(&execution.handle).await.unwrap();
        assert!(!state.is_suspended());
        assert_eq!(state.last_assistant_text().as_deref(), Some("1 USD = 147円"));
    }

    #[tokio::test]
    async fn test_gated_call_suspends_then_runs_on_approval() {
        let f = fixture(
            vec![
                call("c1", "a2a_send_message", json!({"message": "weather?"})),
                say("Sunny"),
            ],
            10,
        );
        let execution = f.engine.start("t1", "weather?").await.unwrap();
        assert_eq!(kinds(&drain(execution.steps).await), vec!["call"]);
        assert_eq!(f.delegate.calls.load(Ordering::SeqCst), 0);

        let state = f.engine.state(&execution.handle).await.unwrap();
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[0].action_id, "c1");
        assert_eq!(state.pending[0].arguments["message"], "weather?");

        let steps = f
            .engine
            .resume(&execution.handle, vec![Decision::approve("c1")])
            .await
            .unwrap();
        let steps = drain(steps).await;
        assert_eq!(kinds(&steps), vec!["result", "text"]);
        assert_eq!(steps[0].as_ref().unwrap().sequence_index, 1);
        assert_eq!(f.delegate.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            f.engine.resume(&execution.handle, vec![]).await,
            Err(EngineFault::NotSuspended { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_call_is_never_invoked_or_retried() {
        let proposal = json!({"message": "weather?", "target_agent_url": "http://127.0.0.1:9001"});
        let reordered = json!({"target_agent_url": "http://127.0.0.1:9001", "message": "weather?"});
        let f = fixture(
            vec![
                call("c1", "a2a_send_message", proposal),
                call("c2", "a2a_send_message", reordered),
                say("I could not check the weather."),
            ],
            10,
        );
        let execution = f.engine.start("t1", "weather?").await.unwrap();
        drain(execution.steps).await;

        let steps = f
            .engine
            .resume(
                &execution.handle,
                vec![Decision::reject("c1", Some("not today".to_string()))],
            )
            .await
            .unwrap();
        let steps = drain(steps).await;

        assert_eq!(kinds(&steps), vec!["result", "call", "result", "text"]);
        assert_eq!(f.delegate.calls.load(Ordering::SeqCst), 0);
        match &steps[0].as_ref().unwrap().kind {
            StepKind::ToolResult { content, is_error, .. } => {
                assert!(is_error);
                assert!(content.contains("not today"));
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &steps[2].as_ref().unwrap().kind {
            StepKind::ToolResult { content, .. } => assert!(content.contains("already rejected")),
            other => panic!("unexpected step {:?}", other),
        }
        let state = f.engine.state(&execution.handle).await.unwrap();
        assert!(state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_banned_keyword_blocks_without_suspension() {
        let f = fixture(
            vec![
                call("c1", "a2a_send_message", json!({"message": "hack the bank"})),
                say("I can't help with that."),
            ],
            10,
        );
        let execution = f.engine.start("t1", "q").await.unwrap();
        let steps = drain(execution.steps).await;

        assert_eq!(kinds(&steps), vec!["call", "result", "text"]);
        let state = f.engine.state(&execution.handle).await.unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(f.delegate.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_limit_faults() {
        let f = fixture(
            vec![
                call("c1", "lookup", json!({"message": "a"})),
                call("c2", "lookup", json!({"message": "b"})),
            ],
            2,
        );
        let execution = f.engine.start("t1", "q").await.unwrap();
        let steps = drain(execution.steps).await;
        assert!(matches!(
            steps.last(),
            Some(Err(EngineFault::StepLimit { limit: 2 }))
        ));
    }

    #[tokio::test]
    async fn test_structured_final_text_is_recorded() {
        let f = fixture(
            vec![say(r#"{"status": "input_required", "message": "Which city?"}"#)],
            10,
        );
        let execution = f.engine.start("t1", "weather?").await.unwrap();
        drain(execution.steps).await;
        let state = f.engine.state(&execution.handle).await.unwrap();
        assert_eq!(state.structured_response.unwrap()["message"], "Which city?");
    }

    #[tokio::test]
    async fn test_release_of_suspended_turn_keeps_history_valid() {
        let f = fixture(
            vec![
                call("c1", "a2a_send_message", json!({"message": "weather?"})),
                say("Hello again"),
            ],
            10,
        );
        let execution = f.engine.start("t1", "weather?").await.unwrap();
        drain(execution.steps).await;
        f.engine.release(&execution.handle).await;

        assert!(matches!(
            f.engine.state(&execution.handle).await,
            Err(EngineFault::StaleHandle { .. })
        ));
        assert_eq!(f.engine.conversation("t1").await.len(), 1);

        let second = f.engine.start("t1", "hi").await.unwrap();
        drain(second.steps).await;
        let seen = f.provider.seen.lock().unwrap();
        let last_request = seen.last().unwrap();
        assert_eq!(last_request.len(), 2);
        assert!(last_request.iter().all(|m| m.role == crate::llm::ChatRole::User));
    }

    #[tokio::test]
    async fn test_start_on_suspended_thread_is_refused() {
        let f = fixture(vec![call("c1", "a2a_send_message", json!({"message": "x"}))], 10);
        let execution = f.engine.start("t1", "q").await.unwrap();
        drain(execution.steps).await;
        assert!(matches!(
            f.engine.start("t1", "again").await,
            Err(EngineFault::AlreadySuspended { .. })
        ));
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        assert_eq!(
            fingerprint("t", &json!({"a": 1, "b": {"y": 2, "x": 1}})),
            fingerprint("t", &json!({"b": {"x": 1, "y": 2}, "a": 1}))
        );
        assert_ne!(fingerprint("t", &json!({"a": 1})), fingerprint("u", &json!({"a": 1})));
    }

    #[test]
    fn test_structured_from_text() {
        assert!(structured_from_text(r#"{"status":"completed","message":"ok"}"#).is_some());
        assert!(structured_from_text("plain answer").is_none());
        assert!(structured_from_text(r#"{"message":"no status"}"#).is_none());
    }
}
