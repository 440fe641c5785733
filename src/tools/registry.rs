//! Tool registry: maps action types to tools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::retry::{RetryPolicy, retry_rate_limited};
use crate::tools::tool::{Tool, ToolDefinition, ToolError, ToolOutput, validate_against_schema};

/// Upper bound on a single tool call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ToolRegistry {
    /// Create a new empty registry with the default retry policy.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name.clone(), tool);
        debug!("Registered tool: {}", name);
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// List all tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Get tool definitions for the drafter prompt.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Check `args` against the named tool's declared schema.
    pub async fn validate_args(&self, name: &str, args: &serde_json::Value) -> Result<(), ToolError> {
        let tool = self.get(name).await.ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        validate_against_schema(&tool.parameters_schema(), args).map_err(|reason| {
            ToolError::InvalidParameters {
                name: name.to_string(),
                reason,
            }
        })
    }

    /// Validate and run a tool. Rate-limit failures are retried within the
    /// registry's retry policy; every other failure is returned as-is.
    pub async fn invoke(&self, name: &str, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let tool = self.get(name).await.ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        validate_against_schema(&tool.parameters_schema(), &args).map_err(|reason| {
            ToolError::InvalidParameters {
                name: name.to_string(),
                reason,
            }
        })?;

        let start = Instant::now();
        let timeout = self.call_timeout;
        let result = retry_rate_limited(&self.retry, name, ToolError::is_rate_limited, || {
            let tool = Arc::clone(&tool);
            let args = args.clone();
            async move {
                match tokio::time::timeout(timeout, tool.execute(args)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        name: tool.name().to_string(),
                        timeout,
                    }),
                }
            }
        })
        .await;

        match &result {
            Ok(_) => info!(
                tool = name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Tool call succeeded"
            ),
            Err(e) => info!(tool = name, error = %e, "Tool call failed"),
        }
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
