//! End-to-end approval flows through the tool-loop engine

use anyhow::{Result, bail};
use async_trait::async_trait;
use courier_core::adapter::{INVOKING_PLACEHOLDER, PROCESSING_PLACEHOLDER};
use courier_core::config::{AdapterConfig, ApprovalConfig, EngineConfig, GateConfig};
use courier_core::llm::{
    ChatBlock, ChatMessage, ChatMessageContent, ChatResponse, ChatResponseBlock, ChatUsage,
    LlmProvider, StopReason,
};
use courier_core::tools::{ToolDefinition, json_schema};
use courier_core::{
    ApprovalResumeLoop, Decision, ResumeError, ResumeRequest, SubmitRequest, TaskStatusEvent,
    ThreadError, ToolHandler, ToolInvocationGate, ToolLoopEngine, ToolRegistry,
};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Replays a script per conversation, keyed by the first user message
struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<ChatResponse>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<(&str, Vec<ChatResponse>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(query, script)| (query.to_string(), script.into()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn last_request(&self) -> Vec<ChatMessage> {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
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
        self.requests.lock().unwrap().push(messages.to_vec());
        let key = messages.first().map(|m| m.text()).unwrap_or_default();
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&key).and_then(|s| s.pop_front()) {
            Some(response) => Ok(response),
            None => bail!("no scripted response left for '{}'", key),
        }
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

fn delegate(calls: &[(&str, &str, &str)]) -> ChatResponse {
    ChatResponse {
        blocks: calls
            .iter()
            .map(|(id, url, message)| ChatResponseBlock::ToolCall {
                id: id.to_string(),
                name: "a2a_send_message".to_string(),
                input: json!({"target_agent_url": url, "message": message}),
            })
            .collect(),
        stop_reason: StopReason::ToolUse,
        usage: ChatUsage::default(),
    }
}

/// Stands in for the remote delegation tool
struct FakeDelegate {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolHandler for FakeDelegate {
    fn name(&self) -> &str {
        "a2a_send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a remote agent"
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "target_agent_url": {"type": "string"},
                "message": {"type": "string"}
            }),
            vec!["target_agent_url", "message"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let url = input["target_agent_url"].as_str().unwrap_or_default();
        if !url.contains("://") {
            bail!("'{}' is not a URL; use the agent's full URL such as http://127.0.0.1:9000", url);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} answered: {}", url, input["message"].as_str().unwrap_or_default()))
    }
}

struct Harness {
    approval: ApprovalResumeLoop<ToolLoopEngine>,
    provider: Arc<ScriptedProvider>,
    remote: Arc<FakeDelegate>,
}

fn harness(scripts: Vec<(&str, Vec<ChatResponse>)>, gated: bool) -> Harness {
    let provider = ScriptedProvider::new(scripts);
    let remote = Arc::new(FakeDelegate {
        calls: AtomicUsize::new(0),
    });
    let mut registry = ToolRegistry::new();
    registry.register(remote.clone());

    let gate = ToolInvocationGate::new(&GateConfig {
        approval_required: if gated {
            vec!["a2a_send_message".to_string()]
        } else {
            vec![]
        },
        banned_keywords: ["hack", "exploit", "malware", "東京"]
            .iter()
            .map(|k| k.to_string())
            .collect(),
        ..Default::default()
    });
    let engine = Arc::new(ToolLoopEngine::new(
        provider.clone(),
        Arc::new(registry),
        gate,
        &EngineConfig::default(),
    ));
    Harness {
        approval: ApprovalResumeLoop::new(engine, &AdapterConfig::default(), &ApprovalConfig::default()),
        provider,
        remote,
    }
}

fn submit(thread_id: &str, query: &str) -> SubmitRequest {
    SubmitRequest {
        query: query.to_string(),
        thread_id: thread_id.to_string(),
    }
}

fn resume(thread_id: &str, decisions: Vec<Decision>) -> ResumeRequest {
    ResumeRequest {
        thread_id: thread_id.to_string(),
        decisions,
    }
}

fn tool_results(message: &ChatMessage) -> Vec<(String, String)> {
    match &message.content {
        ChatMessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ChatBlock::ToolResult {
                    tool_call_id,
                    content,
                } => Some((tool_call_id.clone(), content.clone())),
                _ => None,
            })
            .collect(),
        ChatMessageContent::Text(_) => Vec::new(),
    }
}

const TWO_AGENTS: &str = "Convert 10 USD to GBP and tell me the weather in London";

#[tokio::test]
async fn test_batch_with_one_approval_and_one_rejection() {
    let h = harness(
        vec![(
            TWO_AGENTS,
            vec![
                delegate(&[
                    ("c1", "http://127.0.0.1:9000", "10 USD to GBP"),
                    ("c2", "http://127.0.0.1:9001", "weather in London"),
                ]),
                say("10 USD is 7.9 GBP. I was not allowed to check the weather."),
            ],
        )],
        true,
    );

    let events: Vec<_> = h.approval.submit(submit("t1", TWO_AGENTS)).await.unwrap().collect().await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], TaskStatusEvent::working(INVOKING_PLACEHOLDER));
    assert_eq!(events[1], TaskStatusEvent::working(INVOKING_PLACEHOLDER));
    assert!(events[2].is_final && events[2].requires_input);
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);

    let pending = h.approval.pending("t1").await.unwrap();
    let ids: Vec<_> = pending.iter().map(|p| p.action_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);

    // Decisions in reverse order; results still follow the batch order.
    let events: Vec<_> = h
        .approval
        .resume(resume(
            "t1",
            vec![
                Decision::reject("c2", Some("weather is out of scope".to_string())),
                Decision::approve("c1"),
            ],
        ))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            TaskStatusEvent::working(PROCESSING_PLACEHOLDER),
            TaskStatusEvent::working(PROCESSING_PLACEHOLDER),
            TaskStatusEvent::completed("10 USD is 7.9 GBP. I was not allowed to check the weather."),
        ]
    );
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 1);

    let request = h.provider.last_request();
    let results = tool_results(request.last().unwrap());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "c1");
    assert!(results[0].1.contains("10 USD to GBP"));
    assert_eq!(results[1].0, "c2");
    assert!(results[1].1.contains("rejected"));
    assert!(results[1].1.contains("weather is out of scope"));

    assert!(h.approval.pending("t1").await.is_none());
    assert_eq!(h.approval.threads().count().await, 0);
}

#[tokio::test]
async fn test_banned_keyword_never_suspends() {
    let query = "東京の天気は？";
    let h = harness(
        vec![(
            query,
            vec![
                delegate(&[("c1", "http://127.0.0.1:9001", "東京の天気")]),
                say("That request is blocked by policy."),
            ],
        )],
        true,
    );

    let events: Vec<_> = h.approval.submit(submit("t1", query)).await.unwrap().collect().await;
    let last = events.last().unwrap();
    assert!(last.is_final);
    assert!(!last.requires_input);
    assert_eq!(last.content, "That request is blocked by policy.");
    assert!(h.approval.pending("t1").await.is_none());
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);

    let results = tool_results(h.provider.last_request().last().unwrap());
    assert!(results[0].1.starts_with("Policy violation"));
}

#[tokio::test]
async fn test_malformed_resumes_leave_thread_suspended() {
    let h = harness(
        vec![(
            TWO_AGENTS,
            vec![
                delegate(&[
                    ("c1", "http://127.0.0.1:9000", "rate"),
                    ("c2", "http://127.0.0.1:9001", "weather"),
                ]),
                say("done"),
            ],
        )],
        true,
    );
    let _: Vec<_> = h.approval.submit(submit("t1", TWO_AGENTS)).await.unwrap().collect().await;

    let bad_batches = vec![
        vec![Decision::approve("c1")],
        vec![Decision::approve("c1"), Decision::approve("c2"), Decision::approve("c3")],
        vec![Decision::approve("c1"), Decision::approve("c1")],
        vec![Decision::approve("c1"), Decision::approve("zz")],
    ];
    for decisions in bad_batches {
        let err = h.approval.resume(resume("t1", decisions)).await.err().unwrap();
        assert!(err.is_malformed_input(), "unexpected error {}", err);
        assert_eq!(h.approval.pending("t1").await.unwrap().len(), 2);
    }
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);

    let events: Vec<_> = h
        .approval
        .resume(resume("t1", vec![Decision::approve("c1"), Decision::approve("c2")]))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.last().unwrap().content, "done");
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 2);

    let err = h
        .approval
        .resume(resume("t1", vec![Decision::approve("c1")]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ResumeError::Thread(ThreadError::NotSuspended { .. })));
}

#[tokio::test]
async fn test_bare_agent_name_is_a_tool_error_and_conversation_continues() {
    let query = "What is the exchange rate between USD and GBP?";
    let h = harness(
        vec![(
            query,
            vec![
                delegate(&[("c1", "currency agent", query)]),
                delegate(&[("c2", "http://127.0.0.1:9000", query)]),
                say("1 USD = 147円"),
            ],
        )],
        false,
    );

    let events: Vec<_> = h.approval.submit(submit("t1", query)).await.unwrap().collect().await;
    assert_eq!(
        events,
        vec![
            TaskStatusEvent::working(INVOKING_PLACEHOLDER),
            TaskStatusEvent::working(PROCESSING_PLACEHOLDER),
            TaskStatusEvent::working(INVOKING_PLACEHOLDER),
            TaskStatusEvent::working(PROCESSING_PLACEHOLDER),
            TaskStatusEvent::completed("1 USD = 147円"),
        ]
    );
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_suspended_thread_blocks_submit_until_abandoned() {
    let query = "weather?";
    let h = harness(
        vec![(
            query,
            vec![
                delegate(&[("c1", "http://127.0.0.1:9001", "weather")]),
                say("Hello"),
            ],
        )],
        true,
    );
    let _: Vec<_> = h.approval.submit(submit("t1", query)).await.unwrap().collect().await;

    assert!(matches!(
        h.approval.submit(submit("t1", "hi")).await,
        Err(ThreadError::Suspended { .. })
    ));
    h.approval.abandon("t1").await.unwrap();
    assert!(h.approval.pending("t1").await.is_none());
    assert!(h.approval.submit(submit("t1", query)).await.is_ok());
}

#[tokio::test]
async fn test_independent_threads_resume_concurrently() {
    let h = harness(
        vec![
            (
                "rate?",
                vec![delegate(&[("r1", "http://127.0.0.1:9000", "rate")]), say("rate done")],
            ),
            (
                "weather?",
                vec![delegate(&[("w1", "http://127.0.0.1:9001", "weather")]), say("weather done")],
            ),
        ],
        true,
    );

    let (a, b) = tokio::join!(
        h.approval.submit(submit("ta", "rate?")),
        h.approval.submit(submit("tb", "weather?"))
    );
    let (a, b) = tokio::join!(a.unwrap().collect::<Vec<_>>(), b.unwrap().collect::<Vec<_>>());
    assert!(a.last().unwrap().requires_input);
    assert!(b.last().unwrap().requires_input);

    let (a, b) = tokio::join!(
        h.approval.resume(resume("ta", vec![Decision::approve("r1")])),
        h.approval.resume(resume("tb", vec![Decision::approve("w1")]))
    );
    let (a, b) = tokio::join!(a.unwrap().collect::<Vec<_>>(), b.unwrap().collect::<Vec<_>>());
    assert_eq!(a.last().unwrap().content, "rate done");
    assert_eq!(b.last().unwrap().content, "weather done");
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 2);
}
