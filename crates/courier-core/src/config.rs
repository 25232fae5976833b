//! Configuration structs consumed by the core.
//!
//! Loading happens elsewhere; these values are handed to constructors and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::gate::{GateConfig, KeywordMatch};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Known remote agents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub known_urls: Vec<String>,
}

impl AgentsConfig {
    /// Known URLs trimmed, without trailing slashes, deduplicated in order
    pub fn deduplicated(&self) -> Vec<String> {
        dedup_urls(&self.known_urls)
    }
}

pub fn dedup_urls(urls: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(urls.len());
    for url in urls {
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() || out.iter().any(|u| u == url) {
            continue;
        }
        out.push(url.to_string());
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model turns allowed per execution before it is faulted
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Overrides the built-in supervisor prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_max_steps() -> usize {
    25
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Longest wait for the next execution step; 0 disables the limit
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl AdapterConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_secs > 0).then(|| Duration::from_secs(self.step_timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Suspended threads older than this are abandoned by `abandon_expired`
    #[serde(default = "default_suspension_ttl_secs")]
    pub suspension_ttl_secs: u64,
}

fn default_max_threads() -> usize {
    1000
}

fn default_suspension_ttl_secs() -> u64 {
    3600
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            suspension_ttl_secs: default_suspension_ttl_secs(),
        }
    }
}

impl ApprovalConfig {
    pub fn suspension_ttl(&self) -> Duration {
        Duration::from_secs(self.suspension_ttl_secs)
    }
}

/// Remote agent client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt, only before any output arrived
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Use `message/stream` when the agent card advertises streaming
    #[serde(default = "default_prefer_streaming")]
    pub prefer_streaming: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_prefer_streaming() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            prefer_streaming: default_prefer_streaming(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
