//! The agent runtime, the heart of BigTalk.
//!
//! The agent follows a **Generate → Execute → Feed back** cycle:
//!
//! 1. **Generate**: run the generation pipeline for the current history and
//!    stream the provider's fragments to the caller
//! 2. **Aggregate** the round into one assistant message
//! 3. **If tool uses**: run them through the execution pipeline, append the
//!    results, loop back to step 1
//! 4. **If text only**: the round is terminal
//!
//! The loop stops at the first text-only round or fails once the round limit
//! is reached.

pub mod aggregator;
pub mod execution;
pub mod generation;
pub mod loop_runner;
pub mod runtime;

pub use aggregator::{StreamAggregator, aggregate};
pub use execution::{
    Approval, ApprovalMiddleware, Approver, ExecutionPipeline, ExecutionResult, ExecutionStack,
    ParallelToolHandler, ToolTimeoutMiddleware,
};
pub use generation::{
    FallbackMiddleware, GenerationPipeline, GenerationResult, GenerationStack,
    ModelRewriteMiddleware, ProviderHandler, RetryMiddleware, SystemPromptMiddleware,
    TimeoutMiddleware,
};
pub use loop_runner::{AgentLoop, AgentStream, LoopRequest, RunOutput, check_correlation};
pub use runtime::BigTalk;
