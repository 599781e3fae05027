//! The agent loop: generation, tool execution, and feeding results back.
//!
//! Each round opens a generation stream, forwards every fragment to the
//! caller while folding it into a [`StreamAggregator`], and then decides:
//! no tool uses means the round is terminal; otherwise the tool uses go
//! through the execution pipeline and their results are appended as one
//! tool-role message before the next round starts.
//!
//! The loop runs in its own task and talks to the caller through a bounded
//! channel. Dropping the [`AgentStream`] cancels the task, which drops the
//! active provider stream or the in-flight tool calls.

use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll};

use bigtalk_core::context::{GenerationContext, Params, ToolContext};
use bigtalk_core::error::{CorrelationError, Error, Result};
use bigtalk_core::fragment::Fragment;
use bigtalk_core::message::{Message, ToolResult, ToolUse};
use bigtalk_core::tool::ToolSet;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::aggregator::StreamAggregator;
use crate::execution::ExecutionPipeline;
use crate::generation::GenerationPipeline;

/// Default cap on generation rounds per invocation.
pub const DEFAULT_MAX_ROUNDS: u32 = 25;

/// Default capacity of the fragment channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One invocation of the loop.
#[derive(Clone)]
pub struct LoopRequest {
    /// `"provider/model-name"`
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: ToolSet,
    pub params: Params,
}

impl LoopRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: ToolSet::new(),
            params: Params::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// The outcome of a completed loop.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// The terminal assistant message
    pub message: Message,

    /// Full history: the caller's messages plus everything the loop appended
    pub messages: Vec<Message>,

    /// Number of generation rounds that ran
    pub rounds: u32,
}

/// Sequences generation and execution rounds.
///
/// Holds snapshots of both pipelines, so middleware registered after the
/// loop was built does not affect it.
#[derive(Clone)]
pub struct AgentLoop {
    generation: GenerationPipeline,
    execution: ExecutionPipeline,
    max_rounds: u32,
    channel_capacity: usize,
}

impl AgentLoop {
    pub fn new(generation: GenerationPipeline, execution: ExecutionPipeline) -> Self {
        Self {
            generation,
            execution,
            max_rounds: DEFAULT_MAX_ROUNDS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the maximum number of generation rounds.
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Set how many fragments may be buffered ahead of the caller.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Start the loop in a background task and stream its fragments.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream(&self, request: LoopRequest) -> AgentStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();
        let seed = request.messages.clone();
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("agent_loop", run_id = %run_id, model = %request.model);

        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(
            async move {
                let outcome = tokio::select! {
                    outcome = this.drive(request, &tx, &token) => outcome,
                    _ = token.cancelled() => Err(Error::Cancelled),
                };

                match outcome {
                    Ok(_) => {}
                    Err(Error::Cancelled) => debug!("Agent loop cancelled"),
                    Err(e) => {
                        warn!(error = %e, "Agent loop failed");
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
            .instrument(span),
        );

        AgentStream {
            inner: ReceiverStream::new(rx),
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
            seed,
        }
    }

    /// Run the loop to completion on the current task.
    ///
    /// Fragments are pushed into `sink` as they are produced; the updated
    /// history is returned once a round finishes without tool uses. A closed
    /// sink or a cancelled `cancel` ends the loop with [`Error::Cancelled`].
    pub async fn drive(
        &self,
        request: LoopRequest,
        sink: &mpsc::Sender<Result<Fragment>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let LoopRequest {
            model,
            mut messages,
            tools,
            params,
        } = request;
        let definitions = tools.definitions();

        for round in 1..=self.max_rounds {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            info!(round, max_rounds = self.max_rounds, messages = messages.len(), "Generation round");

            // ── Generation ──
            let ctx = GenerationContext {
                model: model.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
                params: params.clone(),
                round,
            };
            let mut stream = self.generation.generate(ctx).await?;
            let mut aggregator = StreamAggregator::new();

            while let Some(item) = stream.next().await {
                let fragment = item?;
                aggregator.push(&fragment)?;
                emit(sink, fragment).await?;
            }
            drop(stream);

            let provided = aggregator.has_aggregate();
            let deltas = aggregator.delta_count();
            let assistant = aggregator.finish()?;
            if !provided {
                debug!(round, deltas, "Provider sent no aggregate, synthesizing one");
                emit(sink, Fragment::Aggregate(assistant.clone())).await?;
            }

            let tool_uses: Vec<ToolUse> = assistant.tool_uses().into_iter().cloned().collect();
            let assistant_id = assistant.id.clone();
            messages.push(assistant);

            if tool_uses.is_empty() {
                info!(round, "Round produced no tool uses, loop complete");
                return Ok(messages);
            }

            // ── Execution ──
            info!(
                round,
                tool_uses = tool_uses.len(),
                tools = ?tool_uses.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                "Executing tool uses"
            );
            let ctx = ToolContext {
                messages: messages.clone(),
                params: params.clone(),
                round,
                cancel: cancel.child_token(),
                ..ToolContext::new(tool_uses.clone(), tools.clone())
            };
            let results = self.execution.execute(ctx).await?;
            check_correlation(&tool_uses, &results, round)?;

            if results.is_empty() {
                debug!(round, "Execution returned no results, nothing appended");
                continue;
            }

            let errors = results.iter().filter(|r| r.is_error).count();
            debug!(round, results = results.len(), errors, "Tool results appended");

            let tool_message = Message::tool_results(assistant_id, results);
            messages.push(tool_message.clone());
            emit(sink, Fragment::ToolResults(tool_message)).await?;
        }

        warn!(max_rounds = self.max_rounds, "Round limit reached with tool uses pending");
        Err(Error::LoopLimitExceeded {
            max_rounds: self.max_rounds,
            messages,
        })
    }
}

async fn emit(sink: &mpsc::Sender<Result<Fragment>>, fragment: Fragment) -> Result<()> {
    sink.send(Ok(fragment)).await.map_err(|_| Error::Cancelled)
}

/// Every result must answer a distinct tool use of this round.
///
/// Fewer results than tool uses is fine: middleware may veto calls.
pub fn check_correlation(tool_uses: &[ToolUse], results: &[ToolResult], round: u32) -> Result<()> {
    let requested: HashSet<&str> = tool_uses.iter().map(|t| t.id.as_str()).collect();
    let mut answered = HashSet::with_capacity(results.len());

    for result in results {
        let id = result.tool_use_id.as_str();
        if !requested.contains(id) {
            return Err(CorrelationError::UnmatchedResult {
                tool_use_id: id.to_string(),
                round,
            }
            .into());
        }
        if !answered.insert(id) {
            return Err(CorrelationError::DuplicateResult {
                tool_use_id: id.to_string(),
                round,
            }
            .into());
        }
    }

    Ok(())
}

/// Caller side of a running loop.
///
/// Yields fragments in the order they were produced: for every round its
/// deltas, then its aggregate, then (when tools ran) the tool-result message.
/// A failure is the last item. Dropping the stream cancels the loop.
pub struct AgentStream {
    inner: ReceiverStream<Result<Fragment>>,
    cancel: CancellationToken,
    _guard: DropGuard,
    seed: Vec<Message>,
}

impl AgentStream {
    /// Stop the loop without dropping the stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain the stream and return the terminal message with the full history.
    pub async fn finish(mut self) -> Result<RunOutput> {
        let mut messages = std::mem::take(&mut self.seed);
        let mut last = None;
        let mut rounds = 0;

        while let Some(item) = self.next().await {
            match item? {
                Fragment::Aggregate(message) => {
                    rounds += 1;
                    messages.push(message.clone());
                    last = Some(message);
                }
                Fragment::ToolResults(message) => messages.push(message),
                Fragment::Delta(_) => {}
            }
        }

        let message = last.ok_or(Error::Cancelled)?;
        Ok(RunOutput {
            message,
            messages,
            rounds,
        })
    }

    /// Drain the stream and return only the terminal message.
    pub async fn final_message(self) -> Result<Message> {
        Ok(self.finish().await?.message)
    }
}

impl Stream for AgentStream {
    type Item = Result<Fragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
