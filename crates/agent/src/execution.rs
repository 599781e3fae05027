//! Execution pipeline: runs the tool uses of one round.
//!
//! The terminal [`ParallelToolHandler`] dispatches every tool use at once and
//! answers each with exactly one [`ToolResult`], in input order. Failures are
//! captured as error results so one bad tool never takes down its siblings.
//!
//! Middleware may return fewer results than there were tool uses (including
//! none at all) to veto part or all of a round.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bigtalk_core::context::ToolContext;
use bigtalk_core::error::{Error, Result, ToolError};
use bigtalk_core::message::{ToolContent, ToolResult, ToolUse};
use bigtalk_core::middleware::{Chain, Handler, Middleware, MiddlewareStack, Next};
use bigtalk_core::tool::{Tool, ToolSet};
use futures::FutureExt;
use futures::future::join_all;
use tracing::{debug, info, warn};

/// What an execution chain produces.
pub type ExecutionResult = Result<Vec<ToolResult>>;

/// Registration surface for execution middleware.
pub type ExecutionStack = MiddlewareStack<ToolContext, ExecutionResult>;

/// Runs all requested tools concurrently.
pub struct ParallelToolHandler;

#[async_trait]
impl Handler<ToolContext, ExecutionResult> for ParallelToolHandler {
    async fn call(&self, ctx: ToolContext) -> ExecutionResult {
        let calls = ctx
            .tool_uses
            .iter()
            .map(|tool_use| invoke(&ctx.tools, tool_use));

        tokio::select! {
            results = join_all(calls) => Ok(results),
            _ = ctx.cancel.cancelled() => {
                debug!(round = ctx.round, "Tool execution cancelled");
                Err(Error::Cancelled)
            }
        }
    }
}

async fn invoke(tools: &ToolSet, tool_use: &ToolUse) -> ToolResult {
    let Some(tool) = tools.get(&tool_use.name) else {
        warn!(tool = %tool_use.name, id = %tool_use.id, "Model requested an unknown tool");
        return ToolResult::error(
            &tool_use.id,
            ToolError::NotFound(tool_use.name.clone()).to_string(),
        );
    };

    let start = Instant::now();
    let outcome = AssertUnwindSafe(tool.call(tool_use.arguments.clone()))
        .catch_unwind()
        .await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(content)) => {
            debug!(tool = %tool_use.name, id = %tool_use.id, duration_ms, "Tool succeeded");
            ToolResult::success(&tool_use.id, content)
        }
        Ok(Err(e)) => {
            warn!(tool = %tool_use.name, id = %tool_use.id, duration_ms, error = %e, "Tool failed");
            ToolResult::error(&tool_use.id, e.to_string())
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!(tool = %tool_use.name, id = %tool_use.id, reason = %reason, "Tool panicked");
            ToolResult::error(
                &tool_use.id,
                ToolError::ExecutionFailed {
                    tool_name: tool_use.name.clone(),
                    reason: format!("panicked: {reason}"),
                }
                .to_string(),
            )
        }
    }
}

/// An execution chain around a [`ParallelToolHandler`].
#[derive(Clone)]
pub struct ExecutionPipeline {
    chain: Chain<ToolContext, ExecutionResult>,
}

impl ExecutionPipeline {
    pub fn new(stack: &ExecutionStack) -> Self {
        Self {
            chain: stack.build(Arc::new(ParallelToolHandler)),
        }
    }

    pub async fn execute(&self, ctx: ToolContext) -> ExecutionResult {
        self.chain.call(ctx).await
    }

    /// Run a single tool outside the agent loop, through the same middleware.
    ///
    /// An error result becomes [`ToolError::ExecutionFailed`]; a call that
    /// middleware vetoed becomes [`ToolError::PermissionDenied`].
    pub async fn execute_tool(
        &self,
        tool: Arc<dyn Tool>,
        arguments: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolContent> {
        let tool_name = tool.name().to_string();
        let id = format!("manual_{}", uuid::Uuid::new_v4().simple());

        let mut tool_use = ToolUse::new(id.clone(), tool_name.clone(), arguments);
        tool_use.metadata = metadata;

        let mut tools = ToolSet::new();
        tools.register(tool);

        info!(tool = %tool_name, id = %id, "Manual tool execution");
        let results = self
            .execute(ToolContext::new(vec![tool_use], tools))
            .await?;

        match results.into_iter().find(|r| r.tool_use_id == id) {
            Some(result) if result.is_error => Err(ToolError::ExecutionFailed {
                tool_name,
                reason: result.content.as_text(),
            }
            .into()),
            Some(result) => Ok(result.content),
            None => Err(ToolError::PermissionDenied {
                tool_name,
                reason: "execution was vetoed by middleware".into(),
            }
            .into()),
        }
    }
}

/// Decides whether a tool use may run.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, tool_use: &ToolUse, ctx: &ToolContext) -> Approval;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Allow,
    Deny(String),
}

#[async_trait]
impl<F> Approver for F
where
    F: Fn(&ToolUse) -> Approval + Send + Sync,
{
    async fn approve(&self, tool_use: &ToolUse, _ctx: &ToolContext) -> Approval {
        self(tool_use)
    }
}

/// Gates every tool use behind an [`Approver`].
///
/// Denied uses are answered with an error result carrying the reason; the
/// rest go on down the chain.
pub struct ApprovalMiddleware<A> {
    approver: A,
}

impl<A: Approver> ApprovalMiddleware<A> {
    pub fn new(approver: A) -> Self {
        Self { approver }
    }
}

#[async_trait]
impl<A: Approver> Middleware<ToolContext, ExecutionResult> for ApprovalMiddleware<A> {
    async fn handle(
        &self,
        mut ctx: ToolContext,
        next: Next<'_, ToolContext, ExecutionResult>,
    ) -> ExecutionResult {
        let requested = std::mem::take(&mut ctx.tool_uses);
        let mut denied = Vec::new();

        for tool_use in &requested {
            match self.approver.approve(tool_use, &ctx).await {
                Approval::Allow => ctx.tool_uses.push(tool_use.clone()),
                Approval::Deny(reason) => {
                    info!(tool = %tool_use.name, id = %tool_use.id, reason = %reason, "Tool use denied");
                    denied.push(ToolResult::error(
                        &tool_use.id,
                        ToolError::PermissionDenied {
                            tool_name: tool_use.name.clone(),
                            reason,
                        }
                        .to_string(),
                    ));
                }
            }
        }

        let mut inner = if ctx.tool_uses.is_empty() {
            Vec::new()
        } else {
            next.run(ctx).await?
        };

        let mut results = Vec::with_capacity(requested.len());
        for tool_use in &requested {
            let pos_denied = denied.iter().position(|r| r.tool_use_id == tool_use.id);
            if let Some(pos) = pos_denied {
                results.push(denied.swap_remove(pos));
            } else if let Some(pos) = inner.iter().position(|r| r.tool_use_id == tool_use.id) {
                results.push(inner.remove(pos));
            }
        }
        // Anything the inner chain invented is left for correlation checks
        results.extend(inner);

        Ok(results)
    }
}

/// Bounds each tool call; calls that run over become error results.
pub struct ToolTimeoutMiddleware {
    limit: Duration,
}

impl ToolTimeoutMiddleware {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn from_secs_f64(seconds: f64) -> Result<Self> {
        Duration::try_from_secs_f64(seconds)
            .map(Self::new)
            .map_err(|e| Error::config(format!("invalid tool timeout {seconds}s: {e}")))
    }
}

#[async_trait]
impl Middleware<ToolContext, ExecutionResult> for ToolTimeoutMiddleware {
    async fn handle(
        &self,
        mut ctx: ToolContext,
        next: Next<'_, ToolContext, ExecutionResult>,
    ) -> ExecutionResult {
        ctx.tools = ctx
            .tools
            .names()
            .into_iter()
            .filter_map(|name| ctx.tools.get(name))
            .map(|inner| {
                Arc::new(TimeLimitedTool {
                    inner,
                    limit: self.limit,
                }) as Arc<dyn Tool>
            })
            .collect();
        next.run(ctx).await
    }
}

struct TimeLimitedTool {
    inner: Arc<dyn Tool>,
    limit: Duration,
}

#[async_trait]
impl Tool for TimeLimitedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.inner.parameters_schema()
    }

    fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        self.inner.metadata()
    }

    async fn call(&self, arguments: serde_json::Value) -> std::result::Result<ToolContent, ToolError> {
        tokio::time::timeout(self.limit, self.inner.call(arguments))
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Timeout {
                    tool_name: self.inner.name().to_string(),
                    timeout_secs: self.limit.as_secs_f64(),
                })
            })
    }
}
