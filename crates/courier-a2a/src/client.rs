//! A2A client: sends messages to remote agents

use async_stream::try_stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::TaskStatusEvent;
use courier_core::config::ClientConfig;

use crate::protocol::*;

#[derive(Debug, Error)]
pub enum RemoteAgentError {
    #[error("'{url}' is not a usable agent URL: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} answered HTTP {status}: {body}")]
    Http { url: String, status: u16, body: String },

    #[error("remote agent error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response from remote agent: {0}")]
    Protocol(String),

    #[error("stream interrupted after {received} event(s): {reason}")]
    Interrupted { received: usize, reason: String },
}

impl RemoteAgentError {
    fn transport(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source,
            }
        }
    }

    /// Whether a fresh attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_connect() || source.is_request(),
            Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Everything a remote agent said in answer to one message
#[derive(Debug, Clone)]
pub struct RemoteReply {
    /// Progress events in arrival order, ending with the final one
    pub events: Vec<TaskStatusEvent>,
    pub state: Option<TaskState>,
    pub context_id: Option<String>,
}

impl RemoteReply {
    /// Content of the last final event, or of the last event at all
    pub fn final_text(&self) -> &str {
        self.events
            .iter()
            .rev()
            .find(|e| e.is_final)
            .or_else(|| self.events.last())
            .map(|e| e.content.as_str())
            .unwrap_or_default()
    }

    pub fn requires_input(&self) -> bool {
        self.events.iter().rev().find(|e| e.is_final).is_some_and(|e| e.requires_input)
    }
}

/// Stream of results from `message/stream`
pub type ResultStream = BoxStream<'static, Result<TaskResult, RemoteAgentError>>;

/// A2A client for communicating with remote agents
#[derive(Clone)]
pub struct RemoteAgentClient {
    http: Client,
    config: ClientConfig,
}

impl RemoteAgentClient {
    pub fn new(config: &ClientConfig) -> Result<Self, RemoteAgentError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RemoteAgentError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Fetch an agent's card, falling back to the legacy location
    pub async fn fetch_agent_card(&self, base_url: &str) -> Result<AgentCard, RemoteAgentError> {
        let base = base_url.trim_end_matches('/');
        let mut last_err = None;

        for path in [AGENT_CARD_PATH, LEGACY_AGENT_CARD_PATH] {
            let url = format!("{}{}", base, path);
            debug!("Fetching agent card from {}", url);

            let resp = match self.http.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => return Err(RemoteAgentError::transport(&url, e)),
            };
            if !resp.status().is_success() {
                let status = resp.status();
                last_err = Some(RemoteAgentError::Http {
                    url,
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
                continue;
            }

            let card: AgentCard = resp
                .json()
                .await
                .map_err(|e| RemoteAgentError::Protocol(format!("invalid agent card at {}: {}", url, e)))?;
            info!(
                "Fetched agent card: {} ({} skills, streaming: {})",
                card.name,
                card.skills.len(),
                card.capabilities.streaming
            );
            return Ok(card);
        }

        Err(last_err.unwrap_or_else(|| RemoteAgentError::Protocol("no agent card found".to_string())))
    }

    /// One-shot `message/send`
    pub async fn send(
        &self,
        base_url: &str,
        message: &Message,
    ) -> Result<TaskResult, RemoteAgentError> {
        let request = JsonRpcRequest::new(
            Uuid::new_v4().to_string(),
            METHOD_SEND,
            MessageSendParams {
                message: OutboundMessage::new(message),
            },
        );
        debug!("Sending message {} to {}", message.message_id, base_url);

        let resp = self
            .http
            .post(base_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RemoteAgentError::transport(base_url, e))?;
        let resp = check_status(base_url, resp).await?;

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| RemoteAgentError::transport(base_url, e))?;
        parse_result(body)
    }

    /// Streaming `message/stream`; ends after the first final update
    pub fn stream(&self, base_url: &str, message: &Message) -> ResultStream {
        let request = JsonRpcRequest::new(
            Uuid::new_v4().to_string(),
            METHOD_STREAM,
            MessageSendParams {
                message: OutboundMessage::new(message),
            },
        );
        let payload = serde_json::to_value(&request)
            .map_err(|e| RemoteAgentError::Protocol(e.to_string()));
        Box::pin(read_stream(self.http.clone(), base_url.to_string(), payload))
    }

    /// Deliver `text` to the agent at `base_url` and collect its reply.
    ///
    /// Transport failures are retried with the same message id until the
    /// first piece of output arrives; after that they surface as
    /// `Interrupted`.
    pub async fn call(
        &self,
        base_url: &str,
        text: &str,
        context_id: Option<&str>,
        streaming: bool,
    ) -> Result<RemoteReply, RemoteAgentError> {
        let message = Message::user_text(
            text,
            Uuid::new_v4().to_string(),
            context_id.map(str::to_string),
        );
        let attempts = self.config.max_retries + 1;

        let mut attempt = 1;
        loop {
            let outcome = if streaming {
                self.collect_stream(base_url, &message).await
            } else {
                self.send(base_url, &message)
                    .await
                    .map(|result| reply_from(vec![result]))
                    .map_err(|e| (0, e))
            };

            match outcome {
                Ok(reply) => {
                    info!(
                        "Remote task at {} finished ({} event(s), state: {})",
                        base_url,
                        reply.events.len(),
                        reply.state.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
                    );
                    return Ok(reply);
                }
                Err((0, e)) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Attempt {}/{} to {} failed: {} (retrying)",
                        attempt, attempts, base_url, e
                    );
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                Err((0, e)) => return Err(e),
                Err((received, e)) => {
                    warn!("Stream from {} broke after partial output: {}", base_url, e);
                    return Err(RemoteAgentError::Interrupted {
                        received,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Drain a stream; on failure report how many results had arrived
    async fn collect_stream(
        &self,
        base_url: &str,
        message: &Message,
    ) -> Result<RemoteReply, (usize, RemoteAgentError)> {
        let mut results = Vec::new();
        let mut stream = self.stream(base_url, message);
        while let Some(item) = stream.next().await {
            match item {
                Ok(result) => results.push(result),
                Err(e) => return Err((results.len(), e)),
            }
        }
        Ok(reply_from(results))
    }
}

fn read_stream(
    http: Client,
    url: String,
    payload: Result<Value, RemoteAgentError>,
) -> impl futures_util::Stream<Item = Result<TaskResult, RemoteAgentError>> + Send + 'static {
    try_stream! {
        let payload = payload?;
        debug!("Opening message stream to {}", url);

        let resp = http
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| RemoteAgentError::transport(&url, e))?;
        let resp = check_status(&url, resp).await?;

        let mut bytes = resp.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut finished = false;
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| RemoteAgentError::transport(&url, e))?;
            for data in decoder.push(&chunk) {
                let body: JsonRpcResponse = serde_json::from_str(&data)
                    .map_err(|e| RemoteAgentError::Protocol(format!("bad stream event: {}", e)))?;
                let result = parse_result(body)?;
                let is_final = result.to_event().is_final;
                yield result;
                if is_final {
                    finished = true;
                    break;
                }
            }
            if finished {
                break;
            }
        }
        if !finished {
            Err::<(), _>(RemoteAgentError::Protocol(
                "stream ended without a final update".to_string(),
            ))?;
        }
    }
}

async fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, RemoteAgentError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = if status == StatusCode::NOT_FOUND {
        String::new()
    } else {
        resp.text().await.unwrap_or_default()
    };
    Err(RemoteAgentError::Http {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn parse_result(body: JsonRpcResponse) -> Result<TaskResult, RemoteAgentError> {
    if let Some(error) = body.error {
        return Err(RemoteAgentError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    let result = body
        .result
        .ok_or_else(|| RemoteAgentError::Protocol("response has neither result nor error".to_string()))?;
    serde_json::from_value(result).map_err(|e| RemoteAgentError::Protocol(e.to_string()))
}

fn reply_from(results: Vec<TaskResult>) -> RemoteReply {
    let mut reply = RemoteReply {
        events: Vec::with_capacity(results.len()),
        state: None,
        context_id: None,
    };
    let mut artifact_text: Vec<String> = Vec::new();
    for result in &results {
        let event = result.to_event();
        if matches!(result, TaskResult::ArtifactUpdate(_)) && !event.content.is_empty() {
            artifact_text.push(event.content.clone());
        }
        if !event.content.is_empty() || event.is_final {
            reply.events.push(event);
        }
        if let Some(state) = result.state() {
            reply.state = Some(state);
        }
        if let Some(context_id) = result.context_id() {
            reply.context_id = Some(context_id.to_string());
        }
    }

    // A final status without a message: the answer lives in the artifacts
    if let Some(last) = reply.events.iter().rposition(|e| e.is_final)
        && reply.events[last].content.is_empty()
    {
        let fallback = if artifact_text.is_empty() {
            reply.events[..last]
                .iter()
                .rev()
                .find(|e| !e.content.is_empty())
                .map(|e| e.content.clone())
                .unwrap_or_default()
        } else {
            artifact_text.join("\n")
        };
        reply.events[last].content = fallback;
    }
    reply
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Collects `data:` lines and emits the joined payload at each blank line.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        events
    }
}

/// Compact JSON of a value for logs, cut to `max` characters
pub(crate) fn preview(value: &Value, max: usize) -> String {
    let text = value.to_string();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text,
    }
}
