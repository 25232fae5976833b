//! Tool invocation gate: classifies each call before it runs
//!
//! A call is auto-approved, held for a human/policy decision, or rejected
//! outright when its textual arguments contain a banned keyword. The gate
//! never executes anything itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// How banned keywords are compared against argument text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatch {
    #[default]
    CaseSensitive,
    /// Unicode lowercase folding on both sides
    CaseInsensitive,
}

/// Gate configuration, passed in immutable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Tool names that must be approved before they run
    #[serde(default)]
    pub approval_required: Vec<String>,
    #[serde(default)]
    pub banned_keywords: Vec<String>,
    #[serde(default)]
    pub keyword_match: KeywordMatch,
}

/// Outcome of classifying one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    AutoApprove,
    RequireApproval,
    Rejected(PolicyViolation),
}

/// A banned keyword found in a call's arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub tool_name: String,
    pub keyword: String,
}

impl PolicyViolation {
    /// Tool result handed back to the reasoning loop in place of execution
    pub fn tool_result(&self) -> String {
        format!(
            "Policy violation: the call to '{}' was blocked because its arguments contain \
             the banned keyword '{}'. Do not retry this call.",
            self.tool_name, self.keyword
        )
    }
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "banned keyword '{}' in call to '{}'", self.keyword, self.tool_name)
    }
}

pub struct ToolInvocationGate {
    approval_required: HashSet<String>,
    /// (original, comparable form)
    banned: Vec<(String, String)>,
    matching: KeywordMatch,
}

impl ToolInvocationGate {
    pub fn new(config: &GateConfig) -> Self {
        let matching = config.keyword_match;
        let banned = config
            .banned_keywords
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| (k.clone(), fold(k, matching)))
            .collect();
        Self {
            approval_required: config.approval_required.iter().cloned().collect(),
            banned,
            matching,
        }
    }

    /// A gate that approves everything
    pub fn permissive() -> Self {
        Self::new(&GateConfig::default())
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.approval_required.contains(tool_name)
    }

    /// Classify one invocation. Keyword vetoes win over approval rules.
    pub fn classify(&self, tool_name: &str, arguments: &Value) -> GateVerdict {
        if let Some(keyword) = self.find_banned(arguments) {
            warn!(
                "Gate: rejected call to '{}' (banned keyword '{}')",
                tool_name, keyword
            );
            return GateVerdict::Rejected(PolicyViolation {
                tool_name: tool_name.to_string(),
                keyword: keyword.to_string(),
            });
        }

        if self.requires_approval(tool_name) {
            debug!("Gate: '{}' requires approval", tool_name);
            GateVerdict::RequireApproval
        } else {
            GateVerdict::AutoApprove
        }
    }

    fn find_banned(&self, arguments: &Value) -> Option<&str> {
        if self.banned.is_empty() {
            return None;
        }
        let mut texts = Vec::new();
        collect_text(arguments, &mut texts);
        for text in texts {
            let text = fold(text, self.matching);
            if let Some((original, _)) = self.banned.iter().find(|(_, k)| text.contains(k.as_str())) {
                return Some(original.as_str());
            }
        }
        None
    }
}

fn fold(s: &str, matching: KeywordMatch) -> String {
    match matching {
        KeywordMatch::CaseSensitive => s.to_string(),
        KeywordMatch::CaseInsensitive => s.to_lowercase(),
    }
}

/// Every string value in the arguments, depth-first. Object keys are not text.
fn collect_text<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}
