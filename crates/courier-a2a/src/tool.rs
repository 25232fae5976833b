//! A2A tools exposed to the reasoning loop

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use courier_core::tools::{ToolHandler, json_schema};

use crate::client::preview;
use crate::protocol::AgentCard;
use crate::registry::AgentRegistry;

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("Missing '{}' parameter", key))
}

fn card_summary(url: &str, card: &AgentCard) -> Value {
    json!({
        "url": url,
        "name": card.name,
        "description": card.description,
        "streaming": card.capabilities.streaming,
        "skills": card
            .skills
            .iter()
            .map(|s| json!({"id": s.id, "name": s.name, "description": s.description}))
            .collect::<Vec<_>>(),
    })
}

/// `a2a_list_discovered_agents`: known agents with whatever their cards say
pub struct ListAgentsTool {
    registry: Arc<AgentRegistry>,
}

impl ListAgentsTool {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolHandler for ListAgentsTool {
    fn name(&self) -> &str {
        "a2a_list_discovered_agents"
    }

    fn description(&self) -> &str {
        "List the configured remote agents with their URLs, descriptions and skills. \
         Agents that could not be reached are listed with an error."
    }

    fn input_schema(&self) -> Value {
        json_schema(json!({}), vec![])
    }

    async fn execute(&self, _input: Value) -> Result<String> {
        let mut agents = Vec::new();
        for url in self.registry.known_urls() {
            let card = match self.registry.card(url).await {
                Some(card) => Ok(card),
                None => self.registry.discover(url).await,
            };
            match card {
                Ok(card) => agents.push(card_summary(url, &card)),
                Err(e) => {
                    warn!("Agent at {} unavailable: {}", url, e);
                    agents.push(json!({"url": url, "error": e.to_string()}));
                }
            }
        }
        Ok(serde_json::to_string_pretty(&agents)?)
    }
}

/// `a2a_discover_agent`: fetch one agent's card by URL
pub struct DiscoverAgentTool {
    registry: Arc<AgentRegistry>,
}

impl DiscoverAgentTool {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolHandler for DiscoverAgentTool {
    fn name(&self) -> &str {
        "a2a_discover_agent"
    }

    fn description(&self) -> &str {
        "Fetch the agent card of a remote agent to learn its name, skills and capabilities."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "agent_url": {
                    "type": "string",
                    "description": "Full URL of the agent including scheme and port, e.g. http://127.0.0.1:9000"
                }
            }),
            vec!["agent_url"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let url = required_str(&input, "agent_url")?;
        let card = self.registry.discover(url).await?;
        Ok(serde_json::to_string_pretty(&card_summary(url.trim(), &card))?)
    }
}

/// `a2a_send_message`: delegate a message to a remote agent
pub struct SendMessageTool {
    registry: Arc<AgentRegistry>,
}

impl SendMessageTool {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolHandler for SendMessageTool {
    fn name(&self) -> &str {
        "a2a_send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a remote agent and return its answer. \
         target_agent_url must be the agent's full URL including scheme, never its name. \
         Pass the context_id from an earlier answer to continue that conversation."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "target_agent_url": {
                    "type": "string",
                    "description": "Full URL of the agent, e.g. http://127.0.0.1:9000"
                },
                "message": {
                    "type": "string",
                    "description": "What to ask the agent"
                },
                "context_id": {
                    "type": "string",
                    "description": "Optional remote conversation to continue"
                }
            }),
            vec!["target_agent_url", "message"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let target = required_str(&input, "target_agent_url")?;
        let message = required_str(&input, "message")?;
        let context_id = input.get("context_id").and_then(|v| v.as_str());

        debug!("Sending to {}: {}", target, preview(&input["message"], 100));
        let reply = self.registry.send_message(target, message, context_id).await?;

        if reply.state.is_some_and(|s| s.is_failure()) {
            bail!(
                "Remote agent at {} ended the task as {}: {}",
                target.trim(),
                reply.state.map(|s| s.to_string()).unwrap_or_default(),
                reply.final_text()
            );
        }

        let mut output = if reply.requires_input() {
            format!("The agent needs more input: {}", reply.final_text())
        } else {
            reply.final_text().to_string()
        };
        if let Some(context_id) = &reply.context_id {
            output.push_str(&format!("\n[context_id: {}]", context_id));
        }
        Ok(output)
    }
}
