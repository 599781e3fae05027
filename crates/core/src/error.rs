//! Error types for the BigTalk domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context (provider, tool, correlation) has its own enum that
//! folds into the top-level [`Error`].

use crate::message::Message;
use thiserror::Error;

/// The top-level error type for all BigTalk operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Loop errors ---
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Loop limit exceeded: tools were still requested after {max_rounds} rounds")]
    LoopLimitExceeded {
        max_rounds: u32,
        /// History accumulated up to the point the limit was hit.
        messages: Vec<Message>,
    },

    #[error("Generation round timed out after {seconds}s")]
    Timeout { seconds: f64 },

    #[error("Operation cancelled")]
    Cancelled,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether a retry of the same generation round could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Rate limits, timeouts and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout(_)
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: f64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum CorrelationError {
    #[error("tool result '{tool_use_id}' does not answer any tool use of round {round}")]
    UnmatchedResult { tool_use_id: String, round: u32 },

    #[error("tool use '{tool_use_id}' was answered more than once in round {round}")]
    DuplicateResult { tool_use_id: String, round: u32 },
}
