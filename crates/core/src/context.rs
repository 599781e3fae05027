//! Request descriptors handed to the two middleware pipelines.
//!
//! Contexts are plain owned values. Middleware receives the context by value
//! and may rewrite any field before delegating onward; whatever it passes to
//! `next` is what inner layers observe.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::{Message, ToolUse};
use crate::provider::ToolDefinition;
use crate::tool::ToolSet;

/// Per-call generation options.
///
/// The recognized options are typed; anything provider-specific goes through
/// `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Opaque provider-specific passthrough
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Everything one generation round needs.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    /// `"provider/model-name"`
    pub model: String,

    /// The history as seen by this round
    pub messages: Vec<Message>,

    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,

    pub params: Params,

    /// 1-based round number within the current loop
    pub round: u32,
}

impl GenerationContext {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            params: Params::default(),
            round: 1,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Everything one execution invocation needs.
#[derive(Clone)]
pub struct ToolContext {
    /// Requested calls, in the order the model emitted them
    pub tool_uses: Vec<ToolUse>,

    /// Callable tools by name
    pub tools: ToolSet,

    /// Snapshot of the history up to and including the requesting message
    pub messages: Vec<Message>,

    pub params: Params,

    /// Round that produced the tool uses (0 for manual execution)
    pub round: u32,

    /// Cancelled when the consumer of the agent stream goes away
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Each tool's static metadata is merged into the calls addressed to it,
    /// so middleware sees the combined map on entry.
    pub fn new(mut tool_uses: Vec<ToolUse>, tools: ToolSet) -> Self {
        merge_tool_metadata(&mut tool_uses, &tools);
        Self {
            tool_uses,
            tools,
            messages: Vec::new(),
            params: Params::default(),
            round: 0,
            cancel: CancellationToken::new(),
        }
    }
}

/// Layer the tool's metadata under the call's own; call keys win.
fn merge_tool_metadata(tool_uses: &mut [ToolUse], tools: &ToolSet) {
    for tool_use in tool_uses {
        let Some(tool) = tools.get(&tool_use.name) else {
            continue;
        };
        let mut merged = tool.metadata();
        if merged.is_empty() {
            continue;
        }
        merged.extend(std::mem::take(&mut tool_use.metadata));
        tool_use.metadata = merged;
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("tool_uses", &self.tool_uses)
            .field("tools", &self.tools.names())
            .field("messages", &self.messages.len())
            .field("round", &self.round)
            .finish()
    }
}
