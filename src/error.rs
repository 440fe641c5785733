//! Error types for mail-steward.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// Any of these surfacing from a read during triage or drafting is the
/// "memory store unavailable" case: the workflow continues with an empty
/// context.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tool execution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} rate limited, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

impl ToolError {
    /// Whether the registry should retry this failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Outbound mail and calendar transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{service} request failed: {reason}")]
    Failed { service: String, reason: String },

    #[error("{service} rate limited, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Lift into a tool failure, keeping rate limits retryable.
    pub fn into_tool_error(self, tool: &str) -> ToolError {
        match self {
            Self::RateLimited { retry_after, .. } => ToolError::RateLimited {
                name: tool.to_string(),
                retry_after,
            },
            other => ToolError::ExecutionFailed {
                name: tool.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Classification failures. Never surfaced to callers: the triage step
/// recovers by escalating.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Classifier call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Unparseable classification: {0}")]
    Unparseable(String),
}

/// Drafting failures.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Drafter call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Unparseable draft: {0}")]
    Unparseable(String),

    #[error("Draft names unknown action '{0}'")]
    UnknownAction(String),
}

/// Executor contract violations and fatal per-conversation errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No suspended workflow for conversation {0}")]
    UnknownConversation(String),

    #[error("Conversation {0} was already resumed")]
    AlreadyResumed(String),

    #[error("Conversation {0} already has a workflow in flight")]
    ConversationBusy(String),

    #[error("Invalid conversation id '{0}'")]
    InvalidConversationId(String),

    #[error("Checkpoint for conversation {conversation_id} is corrupted: {reason}")]
    CorruptCheckpoint {
        conversation_id: String,
        reason: String,
    },

    #[error("Edit decision for conversation {0} carried no edit")]
    MissingEdit(String),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
