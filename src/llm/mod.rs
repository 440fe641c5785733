//! LLM integration for mail-steward.
//!
//! The classifier and drafter talk to an `LlmProvider`. With the `rig`
//! feature enabled, `create_provider` builds an Anthropic or OpenAI backend
//! through rig-core; without it the binary runs on the offline rules
//! classifier and template drafter.

pub mod provider;
#[cfg(feature = "rig")]
mod rig_adapter;

pub use provider::*;
#[cfg(feature = "rig")]
pub use rig_adapter::RigAdapter;

use crate::error::LlmError;
use crate::retry::{RetryPolicy, retry_rate_limited};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
#[cfg(feature = "rig")]
pub fn create_provider(
    config: &LlmConfig,
) -> Result<std::sync::Arc<dyn LlmProvider>, LlmError> {
    use rig::client::CompletionClient;
    use secrecy::ExposeSecret;

    match config.backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;

            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
                    LlmError::RequestFailed {
                        provider: "anthropic".to_string(),
                        reason: format!("Failed to create Anthropic client: {}", e),
                    }
                })?;
            let model = client.completion_model(&config.model);
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(std::sync::Arc::new(RigAdapter::new(model, &config.model)))
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;

            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
                    LlmError::RequestFailed {
                        provider: "openai".to_string(),
                        reason: format!("Failed to create OpenAI client: {}", e),
                    }
                })?;
            let model = client.completion_model(&config.model);
            tracing::info!("Using OpenAI (model: {})", config.model);
            Ok(std::sync::Arc::new(RigAdapter::new(model, &config.model)))
        }
    }
}

/// Run a completion, retrying rate-limit failures within `policy`.
pub async fn complete_with_retry(
    llm: &dyn LlmProvider,
    request: CompletionRequest,
    policy: &RetryPolicy,
) -> Result<CompletionResponse, LlmError> {
    retry_rate_limited(
        policy,
        llm.model_name(),
        |e: &LlmError| matches!(e, LlmError::RateLimited { .. }),
        || llm.complete(request.clone()),
    )
    .await
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
