//! # BigTalk Core
//!
//! Domain types, traits, and error definitions for the BigTalk agent runtime,
//! plus the generic middleware chain both pipelines are built from.
//!
//! ## Design Philosophy
//!
//! Every collaborator (LLM provider, tool) is defined as a trait here.
//! Implementations live elsewhere. This enables:
//! - Swapping providers by registering a different factory
//! - Easy testing with scripted/mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod context;
pub mod error;
pub mod fragment;
pub mod message;
pub mod middleware;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use context::{GenerationContext, Params, ToolContext};
pub use error::{CorrelationError, Error, ProviderError, Result, ToolError};
pub use fragment::{Delta, Fragment, FragmentStream};
pub use message::{ContentBlock, Message, Role, ToolContent, ToolResult, ToolUse};
pub use middleware::{Chain, Handler, Middleware, MiddlewareStack, Next, compose, from_fn};
pub use provider::{Provider, ProviderRequest, ToolDefinition};
pub use tool::{FnTool, Tool, ToolSet, tool_fn};
