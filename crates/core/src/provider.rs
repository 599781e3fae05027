//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and stream the
//! response back as [`Fragment`](crate::fragment::Fragment)s. Concrete vendor
//! adapters live outside this workspace; they only have to implement
//! [`Provider::stream`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Params;
use crate::error::ProviderError;
use crate::fragment::FragmentStream;
use crate::message::Message;

/// A request as seen by a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model name with the provider prefix stripped (e.g., "claude-haiku-4-5")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub params: Params,
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// The core Provider trait.
///
/// The generation pipeline resolves a `"provider/model"` id to one of these
/// and calls [`stream`](Provider::stream) once per round. Failures that happen
/// before the first fragment are returned directly; failures mid-stream are
/// yielded as the last item of the stream.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Open a streaming completion.
    async fn stream(&self, request: ProviderRequest) -> Result<FragmentStream, ProviderError>;

    /// Estimate the prompt size in tokens.
    ///
    /// Default implementation uses the rough 4-chars-per-token heuristic.
    async fn count_tokens(&self, request: &ProviderRequest) -> Result<usize, ProviderError> {
        Ok(request
            .messages
            .iter()
            .map(|m| serde_json::to_string(&m.content).map(|s| s.len()).unwrap_or(0) / 4)
            .sum())
    }

    /// Release connections and other resources.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
