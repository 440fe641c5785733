//! Triage classifiers.
//!
//! A classifier turns an email plus memory context into a structured
//! [`TriageDecision`]. The LLM classifier holds the model to a strict JSON
//! contract; anything outside it is a [`ClassificationError`], which the
//! executor turns into an escalation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ClassificationError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::{complete_with_retry, extract_json_object};
use crate::pipeline::types::{Classification, EmailRecord, TriageDecision};
use crate::retry::RetryPolicy;
use crate::store::model::FullContext;

/// Max tokens for the triage call. Runs on every email.
const TRIAGE_MAX_TOKENS: u32 = 256;

const TRIAGE_TEMPERATURE: f32 = 0.1;

/// Longest body excerpt sent to the model.
const BODY_PREVIEW_CHARS: usize = 2000;

/// Decides what to do with an inbound email.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        email: &EmailRecord,
        context: &FullContext,
    ) -> Result<TriageDecision, ClassificationError>;
}

/// LLM-backed classifier.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn name(&self) -> &str {
        "llm"
    }

    async fn classify(
        &self,
        email: &EmailRecord,
        context: &FullContext,
    ) -> Result<TriageDecision, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(email, context)),
        ])
        .with_temperature(TRIAGE_TEMPERATURE)
        .with_max_tokens(TRIAGE_MAX_TOKENS);

        let response = complete_with_retry(self.llm.as_ref(), request, &self.retry).await?;
        let decision = parse_decision(&response.content).inspect_err(|e| {
            warn!(
                raw_response = %response.content,
                error = %e,
                "Classifier response broke the JSON contract"
            );
        })?;
        debug!(email_id = %email.id, decision = %decision.decision, "Classified");
        Ok(decision)
    }
}

fn build_system_prompt() -> String {
    "You triage email for a busy professional. Classify the email into exactly one decision.\n\n\
     Decisions:\n\
     - \"ignore\": spam, marketing, newsletters, automated noise.\n\
     - \"escalate\": the user must handle it personally (legal, billing, sensitive, or unclear).\n\
     - \"act\": a routine request you can draft a response or action for.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"decision\": \"ignore|escalate|act\", \"reasoning\": \"one sentence\"}\n\n\
     When unsure, choose \"escalate\"."
        .to_string()
}

fn build_user_prompt(email: &EmailRecord, context: &FullContext) -> String {
    let mut prompt = String::with_capacity(1024);

    let memory = context.summary();
    if !memory.is_empty() {
        prompt.push_str("What you know:\n");
        prompt.push_str(&memory);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!("From: {}", email.from));
    if let Some(name) = &email.from_name {
        prompt.push_str(&format!(" ({name})"));
    }
    prompt.push('\n');
    prompt.push_str(&format!("Subject: {}\n", email.subject));

    let body: String = email.body.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nBody:\n{body}"));
    prompt
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    decision: String,
    #[serde(default)]
    reasoning: String,
}

/// Parse the model output into a decision. No fallback: unknown decisions
/// and malformed JSON are errors.
pub fn parse_decision(raw: &str) -> Result<TriageDecision, ClassificationError> {
    let json = extract_json_object(raw);
    let response: DecisionResponse = serde_json::from_str(&json)
        .map_err(|e| ClassificationError::Unparseable(format!("JSON parse error: {e}")))?;
    let decision: Classification = response
        .decision
        .parse()
        .map_err(ClassificationError::Unparseable)?;
    Ok(TriageDecision::new(decision, response.reasoning))
}
