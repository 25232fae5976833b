//! Known remote agents and their discovered cards

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use courier_core::config::{CourierConfig, dedup_urls};
use courier_core::tools::ToolHandler;

use crate::client::{RemoteAgentClient, RemoteAgentError, RemoteReply};
use crate::protocol::AgentCard;
use crate::tool::{DiscoverAgentTool, ListAgentsTool, SendMessageTool};

/// Check that `raw` is a fully-qualified agent URL and normalize it.
///
/// Requires an http(s) scheme, a host, and a port that is either explicit or
/// the scheme default. Trailing slashes are dropped.
pub fn validate_target_url(raw: &str) -> Result<String, RemoteAgentError> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| RemoteAgentError::InvalidUrl {
        url: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(trimmed).map_err(|_| {
        invalid("not a URL; pass the agent's full URL including scheme and port, e.g. http://127.0.0.1:9000")
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    if url.port_or_known_default().is_none() {
        return Err(invalid("missing port"));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

pub struct AgentRegistry {
    client: RemoteAgentClient,
    known_urls: Vec<String>,
    cards: RwLock<HashMap<String, AgentCard>>,
    prefer_streaming: bool,
}

impl AgentRegistry {
    pub fn new(client: RemoteAgentClient, known_urls: &[String], prefer_streaming: bool) -> Self {
        let known_urls = dedup_urls(known_urls);
        debug!("Agent registry with {} known URL(s)", known_urls.len());
        Self {
            client,
            known_urls,
            cards: RwLock::new(HashMap::new()),
            prefer_streaming,
        }
    }

    pub fn from_config(config: &CourierConfig) -> Result<Self, RemoteAgentError> {
        let client = RemoteAgentClient::new(&config.client)?;
        Ok(Self::new(
            client,
            &config.agents.known_urls,
            config.client.prefer_streaming,
        ))
    }

    pub fn known_urls(&self) -> &[String] {
        &self.known_urls
    }

    pub fn client(&self) -> &RemoteAgentClient {
        &self.client
    }

    /// Fetch and cache the card of the agent at `url`
    pub async fn discover(&self, url: &str) -> Result<AgentCard, RemoteAgentError> {
        let url = validate_target_url(url)?;
        let card = self.client.fetch_agent_card(&url).await?;
        self.cards.write().await.insert(url.clone(), card.clone());
        info!("Discovered agent '{}' at {}", card.name, url);
        Ok(card)
    }

    /// Discover every known agent concurrently, in configuration order
    pub async fn discover_all(&self) -> Vec<(String, Result<AgentCard, RemoteAgentError>)> {
        let results = join_all(self.known_urls.iter().map(|url| self.discover(url))).await;
        self.known_urls.iter().cloned().zip(results).collect()
    }

    /// Cached card for `url`, if it was discovered
    pub async fn card(&self, url: &str) -> Option<AgentCard> {
        let url = validate_target_url(url).ok()?;
        self.cards.read().await.get(&url).cloned()
    }

    /// URL of a discovered agent whose name matches, ignoring case
    pub async fn resolve_name(&self, name: &str) -> Option<String> {
        let name = name.trim();
        let cards = self.cards.read().await;
        self.known_urls
            .iter()
            .chain(cards.keys().filter(|k| !self.known_urls.contains(*k)))
            .find(|url| {
                cards
                    .get(url.as_str())
                    .is_some_and(|c| c.name.eq_ignore_ascii_case(name))
            })
            .cloned()
    }

    /// Deliver `message` to the agent at `target` and collect its reply
    pub async fn send_message(
        &self,
        target: &str,
        message: &str,
        context_id: Option<&str>,
    ) -> Result<RemoteReply, RemoteAgentError> {
        let url = match validate_target_url(target) {
            Ok(url) => url,
            Err(e) => {
                if let Some(url) = self.resolve_name(target).await {
                    return Err(RemoteAgentError::InvalidUrl {
                        url: target.trim().to_string(),
                        reason: format!("agent names are not URLs; did you mean {}?", url),
                    });
                }
                return Err(e);
            }
        };

        let streaming = self.prefer_streaming && self.supports_streaming(&url).await;
        info!("Delegating to {} (streaming: {})", url, streaming);
        self.client.call(&url, message, context_id, streaming).await
    }

    async fn supports_streaming(&self, url: &str) -> bool {
        if let Some(card) = self.cards.read().await.get(url) {
            return card.capabilities.streaming;
        }
        match self.discover(url).await {
            Ok(card) => card.capabilities.streaming,
            Err(e) => {
                debug!("No agent card for {} ({}); using message/send", url, e);
                false
            }
        }
    }

    /// Tool handlers backed by this registry
    pub fn tools(self: &Arc<Self>) -> Vec<Arc<dyn ToolHandler>> {
        vec![
            Arc::new(ListAgentsTool::new(Arc::clone(self))),
            Arc::new(DiscoverAgentTool::new(Arc::clone(self))),
            Arc::new(SendMessageTool::new(Arc::clone(self))),
        ]
    }
}
