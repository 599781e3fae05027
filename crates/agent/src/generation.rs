//! Generation pipeline: one provider round trip per invocation.
//!
//! The terminal handler resolves `ctx.model` through the provider registry
//! and opens the provider's stream. Middleware registered on the
//! [`GenerationStack`] wraps that call and may rewrite the context or wrap
//! the returned stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigtalk_core::context::GenerationContext;
use bigtalk_core::error::{Error, Result};
use bigtalk_core::fragment::FragmentStream;
use bigtalk_core::message::{ContentBlock, Message, Role};
use bigtalk_core::middleware::{Chain, Handler, Middleware, MiddlewareStack, Next};
use bigtalk_core::provider::ProviderRequest;
use bigtalk_providers::ProviderRegistry;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a generation chain produces.
pub type GenerationResult = Result<FragmentStream>;

/// Registration surface for generation middleware.
pub type GenerationStack = MiddlewareStack<GenerationContext, GenerationResult>;

/// Calls the provider named by the context's model id.
pub struct ProviderHandler {
    registry: Arc<ProviderRegistry>,
}

impl ProviderHandler {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler<GenerationContext, GenerationResult> for ProviderHandler {
    async fn call(&self, ctx: GenerationContext) -> GenerationResult {
        let (provider, model) = self.registry.resolve(&ctx.model)?;

        debug!(
            provider = provider.name(),
            model = %model,
            round = ctx.round,
            messages = ctx.messages.len(),
            tools = ctx.tools.len(),
            "Opening provider stream"
        );

        let request = ProviderRequest {
            model,
            messages: ctx.messages,
            tools: ctx.tools,
            params: ctx.params,
        };
        Ok(provider.stream(request).await?)
    }
}

/// A generation chain bound to a provider registry.
#[derive(Clone)]
pub struct GenerationPipeline {
    chain: Chain<GenerationContext, GenerationResult>,
}

impl GenerationPipeline {
    /// Snapshot `stack` around a [`ProviderHandler`].
    pub fn new(stack: &GenerationStack, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            chain: stack.build(Arc::new(ProviderHandler::new(registry))),
        }
    }

    /// Run one generation round.
    pub async fn generate(&self, ctx: GenerationContext) -> GenerationResult {
        self.chain.call(ctx).await
    }
}

/// Makes sure every round starts with the configured system prompt.
///
/// An existing leading system message is replaced; otherwise one is inserted.
pub struct SystemPromptMiddleware {
    prompt: String,
}

impl SystemPromptMiddleware {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
impl Middleware<GenerationContext, GenerationResult> for SystemPromptMiddleware {
    async fn handle(
        &self,
        mut ctx: GenerationContext,
        next: Next<'_, GenerationContext, GenerationResult>,
    ) -> GenerationResult {
        match ctx.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = vec![ContentBlock::text(self.prompt.clone())];
            }
            _ => ctx.messages.insert(0, Message::system(self.prompt.clone())),
        }
        next.run(ctx).await
    }
}

/// Bounds a whole generation round, from opening the stream to its last fragment.
///
/// On expiry the provider stream is dropped and [`Error::Timeout`] is yielded
/// as the final item.
pub struct TimeoutMiddleware {
    limit: Duration,
}

impl TimeoutMiddleware {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// Fails on negative, non-finite or out-of-range values.
    pub fn from_secs_f64(seconds: f64) -> Result<Self> {
        Duration::try_from_secs_f64(seconds)
            .map(Self::new)
            .map_err(|e| Error::config(format!("invalid round timeout {seconds}s: {e}")))
    }
}

#[async_trait]
impl Middleware<GenerationContext, GenerationResult> for TimeoutMiddleware {
    async fn handle(
        &self,
        ctx: GenerationContext,
        next: Next<'_, GenerationContext, GenerationResult>,
    ) -> GenerationResult {
        let deadline = Instant::now() + self.limit;
        let seconds = self.limit.as_secs_f64();
        let round = ctx.round;

        let inner = match tokio::time::timeout_at(deadline, next.run(ctx)).await {
            Ok(opened) => opened?,
            Err(_) => {
                warn!(round, timeout_secs = seconds, "Generation round timed out before streaming");
                return Err(Error::Timeout { seconds });
            }
        };

        Ok(with_deadline(inner, deadline, seconds, round))
    }
}

fn with_deadline(inner: FragmentStream, deadline: Instant, seconds: f64, round: u32) -> FragmentStream {
    futures::stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout_at(deadline, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => {
                warn!(round, timeout_secs = seconds, "Generation round timed out mid-stream");
                drop(inner);
                Some((Err(Error::Timeout { seconds }), None))
            }
        }
    })
    .boxed()
}

/// Re-opens the stream when opening fails with a retryable error.
///
/// Only the open is retried; once fragments flow, failures pass through,
/// since they may already have reached the caller.
pub struct RetryMiddleware {
    max_retries: u32,
    backoff: Duration,
}

impl RetryMiddleware {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(250),
        }
    }

    /// Base delay; attempt `n` waits `n * backoff`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl Middleware<GenerationContext, GenerationResult> for RetryMiddleware {
    async fn handle(
        &self,
        ctx: GenerationContext,
        next: Next<'_, GenerationContext, GenerationResult>,
    ) -> GenerationResult {
        let mut attempt = 0;
        loop {
            match next.clone().run(ctx.clone()).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        round = ctx.round,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Generation failed to open, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                outcome => return outcome,
            }
        }
    }
}

/// Maps model ids onto other model ids, possibly on another provider.
#[derive(Default)]
pub struct ModelRewriteMiddleware {
    routes: HashMap<String, String>,
}

impl ModelRewriteMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.routes.insert(from.into(), to.into());
        self
    }
}

#[async_trait]
impl Middleware<GenerationContext, GenerationResult> for ModelRewriteMiddleware {
    async fn handle(
        &self,
        mut ctx: GenerationContext,
        next: Next<'_, GenerationContext, GenerationResult>,
    ) -> GenerationResult {
        if let Some(target) = self.routes.get(&ctx.model) {
            debug!(from = %ctx.model, to = %target, "Rewriting model");
            ctx.model = target.clone();
        }
        next.run(ctx).await
    }
}

/// Tries alternative models in order when the requested one fails to open.
pub struct FallbackMiddleware {
    fallbacks: Vec<String>,
}

impl FallbackMiddleware {
    pub fn new<I, S>(fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fallbacks: fallbacks.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Middleware<GenerationContext, GenerationResult> for FallbackMiddleware {
    async fn handle(
        &self,
        ctx: GenerationContext,
        next: Next<'_, GenerationContext, GenerationResult>,
    ) -> GenerationResult {
        let mut last_error = match next.clone().run(ctx.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        for (i, model) in self.fallbacks.iter().enumerate() {
            warn!(
                failed = %ctx.model,
                next_model = %model,
                attempt = i + 1,
                total = self.fallbacks.len(),
                error = %last_error,
                "Fallback: trying next model"
            );
            let mut attempt = ctx.clone();
            attempt.model = model.clone();
            match next.clone().run(attempt).await {
                Ok(stream) => {
                    info!(model = %model, "Fallback model accepted the round");
                    return Ok(stream);
                }
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::aggregate;
    use bigtalk_core::error::ProviderError;
    use bigtalk_providers::{ScriptedProvider, Turn};

    fn registry_with(name: &str, provider: Arc<ScriptedProvider>) -> Arc<ProviderRegistry> {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(name, provider).unwrap();
        registry
    }

    fn ctx(model: &str) -> GenerationContext {
        GenerationContext::new(model, vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn provider_receives_stripped_model_name() {
        let provider = Arc::new(ScriptedProvider::new("p", vec![Message::assistant("hello")]));
        let pipeline = GenerationPipeline::new(&GenerationStack::new(), registry_with("p", provider.clone()));

        let stream = pipeline.generate(ctx("p/model-x")).await.unwrap();
        assert_eq!(aggregate(stream).await.unwrap().text(), "hello");
        assert_eq!(provider.requests()[0].model, "model-x");
    }

    #[tokio::test]
    async fn unknown_provider_is_configuration_error() {
        let pipeline = GenerationPipeline::new(&GenerationStack::new(), Arc::new(ProviderRegistry::new()));
        let err = pipeline.generate(ctx("nope/m")).await.err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn system_prompt_inserted_or_replaced() {
        let provider = Arc::new(ScriptedProvider::new(
            "p",
            vec![Message::assistant("a"), Message::assistant("b")],
        ));
        let mut stack = GenerationStack::new();
        stack.push(SystemPromptMiddleware::new("Be brief."));
        let pipeline = GenerationPipeline::new(&stack, registry_with("p", provider.clone()));

        aggregate(pipeline.generate(ctx("p/m")).await.unwrap())
            .await
            .unwrap();
        let mut with_system = ctx("p/m");
        with_system.messages.insert(0, Message::system("old"));
        aggregate(pipeline.generate(with_system).await.unwrap())
            .await
            .unwrap();

        for request in provider.requests() {
            assert_eq!(request.messages.len(), 2);
            assert_eq!(request.messages[0].role, Role::System);
            assert_eq!(request.messages[0].text(), "Be brief.");
        }
    }

    #[tokio::test]
    async fn model_rewrite_routes_to_other_provider() {
        let registry = Arc::new(ProviderRegistry::new());
        let a = Arc::new(ScriptedProvider::new("a", vec![]));
        let b = Arc::new(ScriptedProvider::new("b", vec![Message::assistant("from b")]));
        registry.register("a", a.clone()).unwrap();
        registry.register("b", b.clone()).unwrap();

        let mut stack = GenerationStack::new();
        stack.push(ModelRewriteMiddleware::new().route("a/small", "b/large"));
        let pipeline = GenerationPipeline::new(&stack, registry);

        let stream = pipeline.generate(ctx("a/small")).await.unwrap();
        assert_eq!(aggregate(stream).await.unwrap().text(), "from b");
        assert_eq!(a.call_count(), 0);
        assert_eq!(b.requests()[0].model, "large");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reopens_after_transient_failure() {
        let provider = Arc::new(ScriptedProvider::with_turns(
            "p",
            vec![
                Turn::Fail(ProviderError::RateLimited { retry_after_secs: 1 }),
                Turn::Reply(Message::assistant("ok")),
            ],
        ));
        let mut stack = GenerationStack::new();
        stack.push(RetryMiddleware::new(2));
        let pipeline = GenerationPipeline::new(&stack, registry_with("p", provider.clone()));

        let stream = pipeline.generate(ctx("p/m")).await.unwrap();
        assert_eq!(aggregate(stream).await.unwrap().text(), "ok");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_on_fatal_error() {
        let provider = Arc::new(ScriptedProvider::with_turns(
            "p",
            vec![Turn::Fail(ProviderError::AuthenticationFailed("bad key".into()))],
        ));
        let mut stack = GenerationStack::new();
        stack.push(RetryMiddleware::new(3));
        let pipeline = GenerationPipeline::new(&stack, registry_with("p", provider.clone()));

        assert!(pipeline.generate(ctx("p/m")).await.is_err());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn fallback_tries_next_model() {
        let registry = Arc::new(ProviderRegistry::new());
        let down = Arc::new(ScriptedProvider::with_turns(
            "down",
            vec![Turn::Fail(ProviderError::Network("refused".into()))],
        ));
        let up = Arc::new(ScriptedProvider::new("up", vec![Message::assistant("served")]));
        registry.register("down", down).unwrap();
        registry.register("up", up.clone()).unwrap();

        let mut stack = GenerationStack::new();
        stack.push(FallbackMiddleware::new(["up/m"]));
        let pipeline = GenerationPipeline::new(&stack, registry);

        let stream = pipeline.generate(ctx("down/m")).await.unwrap();
        assert_eq!(aggregate(stream).await.unwrap().text(), "served");
        assert_eq!(up.call_count(), 1);
    }

    #[tokio::test]
    async fn timeout_ends_slow_stream_with_error() {
        let provider = Arc::new(
            ScriptedProvider::new("p", vec![Message::assistant("slow reply")])
                .with_chunk_chars(1)
                .with_latency(Duration::from_millis(50)),
        );
        let mut stack = GenerationStack::new();
        stack.push(TimeoutMiddleware::new(Duration::from_millis(120)));
        let pipeline = GenerationPipeline::new(&stack, registry_with("p", provider.clone()));

        let items: Vec<_> = pipeline.generate(ctx("p/m")).await.unwrap().collect().await;
        assert!(items.len() < 11);
        assert!(matches!(items.last(), Some(Err(Error::Timeout { .. }))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(provider.was_abandoned());
    }
}
