//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world. The
//! execution pipeline looks them up by name in a [`ToolSet`] and invokes
//! them concurrently.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::ToolError;
use crate::message::ToolContent;
use crate::provider::ToolDefinition;

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "get_weather").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Static metadata layered under every call's own metadata before the
    /// execution middleware runs. Keys set on the call win.
    fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// Execute the tool with the given arguments.
    async fn call(&self, arguments: serde_json::Value) -> Result<ToolContent, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A tool backed by an async closure.
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: serde_json::Value,
    metadata: serde_json::Map<String, serde_json::Value>,
    handler: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolContent, ToolError>> + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            metadata: serde_json::Map::new(),
            handler,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Build a shareable tool from a name and an async closure, with an
/// open-object parameter schema.
pub fn tool_fn<F, Fut>(name: impl Into<String>, handler: F) -> Arc<dyn Tool>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolContent, ToolError>> + Send + 'static,
{
    Arc::new(FnTool::new(
        name,
        "",
        serde_json::json!({ "type": "object", "properties": {} }),
        handler,
    ))
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolContent, ToolError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        self.metadata.clone()
    }

    async fn call(&self, arguments: serde_json::Value) -> Result<ToolContent, ToolError> {
        (self.handler)(arguments).await
    }
}

/// The tools available to one loop invocation, keyed by name.
///
/// Cheap to clone; tools are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool definitions in registration order (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.to_definition())
            .collect()
    }

    /// Registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl FromIterator<Arc<dyn Tool>> for ToolSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Tool>>>(iter: I) -> Self {
        let mut set = Self::new();
        for tool in iter {
            set.register(tool);
        }
        set
    }
}
