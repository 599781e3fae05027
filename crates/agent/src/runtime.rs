//! The `BigTalk` value: provider registry, both middleware stacks, and the
//! loop entry points, bundled so nothing lives in global state.

use std::sync::Arc;

use bigtalk_config::RuntimeConfig;
use bigtalk_core::context::Params;
use bigtalk_core::error::{Error, Result};
use bigtalk_core::message::{Message, ToolContent};
use bigtalk_core::provider::Provider;
use bigtalk_core::tool::{Tool, ToolSet};
use bigtalk_providers::ProviderRegistry;
use tracing::info;

use crate::execution::{ExecutionPipeline, ExecutionStack, ToolTimeoutMiddleware};
use crate::generation::{
    GenerationPipeline, GenerationStack, RetryMiddleware, SystemPromptMiddleware,
    TimeoutMiddleware,
};
use crate::loop_runner::{
    AgentLoop, AgentStream, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_ROUNDS, LoopRequest, RunOutput,
};

pub struct BigTalk {
    registry: Arc<ProviderRegistry>,
    generation: GenerationStack,
    execution: ExecutionStack,
    default_model: String,
    max_rounds: u32,
    channel_capacity: usize,
}

impl Default for BigTalk {
    fn default() -> Self {
        Self::new()
    }
}

impl BigTalk {
    /// An empty runtime: no providers, no middleware.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ProviderRegistry::new()),
            generation: GenerationStack::new(),
            execution: ExecutionStack::new(),
            default_model: RuntimeConfig::default().default_model,
            max_rounds: DEFAULT_MAX_ROUNDS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Build a runtime from configuration, validating it first.
    ///
    /// Installs, outermost first: retry, round timeout, system prompt on the
    /// generation stack, and the per-call timeout on the execution stack.
    /// Providers still have to be registered by the caller.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::config(e.to_string()))?;

        let mut runtime = Self::new()
            .with_max_rounds(config.max_rounds)
            .with_channel_capacity(config.channel_capacity);
        runtime.default_model = config.default_model.clone();

        if config.generation_retries > 0 {
            runtime
                .generation
                .push(RetryMiddleware::new(config.generation_retries));
        }
        if let Some(seconds) = config.round_timeout_secs {
            runtime
                .generation
                .push(TimeoutMiddleware::from_secs_f64(seconds)?);
        }
        if let Some(prompt) = &config.system_prompt {
            runtime
                .generation
                .push(SystemPromptMiddleware::new(prompt.clone()));
        }
        if let Some(seconds) = config.tool_timeout_secs {
            runtime
                .execution
                .push(ToolTimeoutMiddleware::from_secs_f64(seconds)?);
        }

        info!(
            default_model = %runtime.default_model,
            max_rounds = runtime.max_rounds,
            generation_middleware = runtime.generation.len(),
            execution_middleware = runtime.execution.len(),
            "BigTalk runtime configured"
        );
        Ok(runtime)
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// The generation middleware stack.
    pub fn generation(&mut self) -> &mut GenerationStack {
        &mut self.generation
    }

    /// Alias of [`generation`](Self::generation).
    pub fn streaming(&mut self) -> &mut GenerationStack {
        self.generation()
    }

    /// The execution middleware stack.
    pub fn tooling(&mut self) -> &mut ExecutionStack {
        &mut self.execution
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Register a provider factory; see [`ProviderRegistry::add_provider`].
    pub fn add_provider<F>(&self, name: impl Into<String>, factory: F, override_existing: bool) -> Result<()>
    where
        F: Fn() -> Arc<dyn Provider> + Send + Sync + 'static,
    {
        self.registry.add_provider(name, factory, override_existing)
    }

    /// Snapshot the current middleware into a loop.
    pub fn agent_loop(&self) -> AgentLoop {
        AgentLoop::new(
            GenerationPipeline::new(&self.generation, Arc::clone(&self.registry)),
            ExecutionPipeline::new(&self.execution),
        )
        .with_max_rounds(self.max_rounds)
        .with_channel_capacity(self.channel_capacity)
    }

    /// A loop request addressed to the default model.
    pub fn request(&self, messages: Vec<Message>) -> LoopRequest {
        LoopRequest::new(self.default_model.clone(), messages)
    }

    /// Start the agent loop and stream its fragments.
    pub fn stream(&self, model: &str, messages: Vec<Message>, tools: ToolSet, params: Params) -> AgentStream {
        self.agent_loop().stream(
            LoopRequest::new(model, messages)
                .with_tools(tools)
                .with_params(params),
        )
    }

    /// Run the loop to completion and return the terminal assistant message.
    pub async fn run(&self, model: &str, messages: Vec<Message>, tools: ToolSet, params: Params) -> Result<Message> {
        self.stream(model, messages, tools, params)
            .final_message()
            .await
    }

    /// Like [`run`](Self::run), also returning the updated history.
    pub async fn run_with_history(
        &self,
        model: &str,
        messages: Vec<Message>,
        tools: ToolSet,
        params: Params,
    ) -> Result<RunOutput> {
        self.stream(model, messages, tools, params).finish().await
    }

    /// Run one tool through the execution middleware, outside any loop.
    pub async fn execute_tool(
        &self,
        tool: Arc<dyn Tool>,
        arguments: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolContent> {
        ExecutionPipeline::new(&self.execution)
            .execute_tool(tool, arguments, metadata)
            .await
    }

    /// Close every provider instantiated so far.
    pub async fn close(&self) -> Result<()> {
        self.registry.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigtalk_core::message::Role;
    use bigtalk_providers::ScriptedProvider;

    #[test]
    fn from_config_installs_middleware() {
        let config = RuntimeConfig {
            system_prompt: Some("Be brief.".into()),
            round_timeout_secs: Some(30.0),
            tool_timeout_secs: Some(5.0),
            generation_retries: 2,
            max_rounds: 7,
            ..RuntimeConfig::default()
        };
        let mut runtime = BigTalk::from_config(&config).unwrap();
        assert_eq!(runtime.generation().len(), 3);
        assert_eq!(runtime.tooling().len(), 1);
        assert_eq!(runtime.agent_loop().max_rounds(), 7);
    }

    #[test]
    fn from_config_rejects_unrepresentable_timeouts() {
        let huge = RuntimeConfig {
            round_timeout_secs: Some(1e20),
            ..RuntimeConfig::default()
        };
        assert!(matches!(BigTalk::from_config(&huge), Err(Error::Config { .. })));

        let negative = RuntimeConfig {
            tool_timeout_secs: Some(-1.0),
            ..RuntimeConfig::default()
        };
        assert!(matches!(BigTalk::from_config(&negative), Err(Error::Config { .. })));
    }

    #[test]
    fn timeout_middleware_rejects_bad_seconds() {
        assert!(TimeoutMiddleware::from_secs_f64(1e20).is_err());
        assert!(TimeoutMiddleware::from_secs_f64(f64::NAN).is_err());
        assert!(ToolTimeoutMiddleware::from_secs_f64(-0.5).is_err());
        assert!(ToolTimeoutMiddleware::from_secs_f64(2.5).is_ok());
    }

    #[tokio::test]
    async fn request_uses_the_configured_default_model() {
        let config = RuntimeConfig {
            default_model: "mock/m".into(),
            ..RuntimeConfig::default()
        };
        let runtime = BigTalk::from_config(&config).unwrap();
        let provider = Arc::new(ScriptedProvider::new("mock", vec![Message::assistant("hi")]));
        let shared = provider.clone();
        runtime
            .add_provider("mock", move || shared.clone() as Arc<dyn Provider>, false)
            .unwrap();

        let request = runtime.request(vec![Message::user("hello")]);
        assert_eq!(request.model, "mock/m");

        let reply = runtime.agent_loop().stream(request).final_message().await.unwrap();
        assert_eq!(reply.text(), "hi");
        assert_eq!(provider.requests()[0].model, "m");
    }

    #[test]
    fn streaming_is_the_generation_stack() {
        let mut runtime = BigTalk::new();
        runtime.streaming().push(SystemPromptMiddleware::new("x"));
        assert_eq!(runtime.generation().len(), 1);
    }

    #[tokio::test]
    async fn configured_system_prompt_reaches_provider() {
        let config = RuntimeConfig {
            system_prompt: Some("You are terse.".into()),
            ..RuntimeConfig::default()
        };
        let runtime = BigTalk::from_config(&config).unwrap();
        let provider = Arc::new(ScriptedProvider::new("mock", vec![Message::assistant("ok")]));
        let shared = provider.clone();
        runtime
            .add_provider("mock", move || shared.clone() as Arc<dyn Provider>, false)
            .unwrap();

        runtime
            .run("mock/m", vec![Message::user("hi")], ToolSet::new(), Params::default())
            .await
            .unwrap();

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].text(), "You are terse.");
    }
}
