//! Drafters turn an actionable email into a [`PendingAction`].
//!
//! Both drafters read the learned [`StyleGuide`] from the memory context, so
//! preferences from earlier edits shape the next draft.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DraftError;
use crate::learning::patterns::{Formality, StyleGuide};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::{complete_with_retry, extract_json_object};
use crate::pipeline::types::{EmailRecord, PendingAction};
use crate::retry::RetryPolicy;
use crate::store::model::FullContext;
use crate::tools::tool::ToolDefinition;

const DRAFT_MAX_TOKENS: u32 = 1024;
const DRAFT_TEMPERATURE: f32 = 0.4;
const BODY_PREVIEW_CHARS: usize = 3000;
const PREVIEW_CHARS: usize = 280;

/// Proposes the action to take for an email classified `act`.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(
        &self,
        email: &EmailRecord,
        context: &FullContext,
    ) -> Result<PendingAction, DraftError>;
}

fn reply_subject(subject: &str) -> String {
    if subject.trim_start().to_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

fn preview_of(action_type: &str, to: &str, text: &str) -> String {
    let mut excerpt: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        excerpt.push_str("...");
    }
    format!("{action_type} to {to}:\n{excerpt}")
}

// ── LLM drafter ─────────────────────────────────────────────────────

/// LLM-backed drafter. The model picks one of the advertised tools.
pub struct LlmDrafter {
    llm: Arc<dyn LlmProvider>,
    tools: Vec<ToolDefinition>,
    retry: RetryPolicy,
}

impl LlmDrafter {
    pub fn new(llm: Arc<dyn LlmProvider>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            llm,
            tools,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn system_prompt(&self, style: &StyleGuide) -> String {
        let mut prompt = String::from(
            "You draft actions on behalf of the user for the email below. \
             Pick exactly one action from the list and fill in its arguments.\n\nActions:\n",
        );
        for tool in &self.tools {
            prompt.push_str(&format!(
                "- {}: {}\n  arguments schema: {}\n",
                tool.name, tool.description, tool.parameters
            ));
        }
        prompt.push_str(
            "\nRespond with ONLY a JSON object:\n\
             {\"action_type\": \"...\", \"args\": {...}, \"preview\": \"what the user will see\"}\n",
        );
        let instructions = style.instructions();
        if !instructions.is_empty() {
            prompt.push_str("\nWriting style:\n");
            prompt.push_str(&instructions);
            prompt.push('\n');
        }
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    action_type: String,
    #[serde(default)]
    args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    preview: String,
}

#[async_trait]
impl Drafter for LlmDrafter {
    async fn draft(
        &self,
        email: &EmailRecord,
        context: &FullContext,
    ) -> Result<PendingAction, DraftError> {
        let style = StyleGuide::from_preferences(&context.preferences);

        let mut user = String::with_capacity(1024);
        let memory = context.summary();
        if !memory.is_empty() {
            user.push_str(&format!("What you know:\n{memory}\n\n"));
        }
        let body: String = email.body.chars().take(BODY_PREVIEW_CHARS).collect();
        user.push_str(&format!(
            "Email id: {}\nFrom: {}\nSubject: {}\n\n{}",
            email.id, email.from, email.subject, body
        ));

        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt(&style)),
            ChatMessage::user(user),
        ])
        .with_temperature(DRAFT_TEMPERATURE)
        .with_max_tokens(DRAFT_MAX_TOKENS);

        let response = complete_with_retry(self.llm.as_ref(), request, &self.retry).await?;
        let parsed: DraftResponse = serde_json::from_str(&extract_json_object(&response.content))
            .map_err(|e| {
                warn!(raw_response = %response.content, error = %e, "Draft response unparseable");
                DraftError::Unparseable(format!("JSON parse error: {e}"))
            })?;

        if !self.tools.iter().any(|t| t.name == parsed.action_type) {
            return Err(DraftError::UnknownAction(parsed.action_type));
        }

        let mut action = PendingAction::new(parsed.action_type, parsed.args, parsed.preview);
        if action.preview.trim().is_empty() {
            let to = action
                .args
                .get("to")
                .and_then(|v| v.as_str())
                .unwrap_or(email.from.as_str())
                .to_string();
            action.preview = preview_of(&action.action_type, &to, action.draft_text().unwrap_or(""));
        }
        debug!(email_id = %email.id, action = %action.action_type, "Drafted action");
        Ok(action)
    }
}

// ── Template drafter ────────────────────────────────────────────────

/// Deterministic reply drafter. Always proposes `send_email_reply`.
pub struct TemplateDrafter {
    signature: Option<String>,
}

impl TemplateDrafter {
    pub const ACTION: &'static str = "send_email_reply";

    pub fn new() -> Self {
        Self { signature: None }
    }

    /// Name written under the sign-off.
    pub fn with_signature(mut self, name: impl Into<String>) -> Self {
        self.signature = Some(name.into());
        self
    }

    /// Compose the reply body under `style`.
    pub fn compose(&self, email: &EmailRecord, style: &StyleGuide) -> String {
        let casual = style.formality == Some(Formality::Casual);
        let mut parts = Vec::new();

        if !style.no_greeting {
            let name = email
                .from_name
                .as_deref()
                .and_then(|n| n.split_whitespace().next())
                .unwrap_or("there");
            parts.push(if casual {
                format!("Hey {name},")
            } else {
                format!("Hi {name},")
            });
        }

        let core = match (style.concise, casual) {
            (true, true) => "Got it, I'll get back to you soon.".to_string(),
            (true, false) => "Thanks, I will follow up shortly.".to_string(),
            (false, true) => format!(
                "Thanks for the note about \"{}\". I'm on it and will get back to you soon with the details.",
                email.subject
            ),
            (false, false) => format!(
                "Thank you for your email regarding \"{}\". I have read your message and will follow up with a detailed response shortly.",
                email.subject
            ),
        };
        parts.push(strip_avoided(&core, &style.avoid_words));

        if !style.no_sign_off {
            let closing = if casual { "Cheers" } else { "Best regards" };
            match &self.signature {
                Some(name) => parts.push(format!("{closing},\n{name}")),
                None => parts.push(format!("{closing},")),
            }
        }

        parts.join("\n\n")
    }
}

impl Default for TemplateDrafter {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop words the user has repeatedly removed.
fn strip_avoided(text: &str, avoid: &[String]) -> String {
    if avoid.is_empty() {
        return text.to_string();
    }
    text.split(' ')
        .filter(|w| {
            let bare: String = w
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            !avoid.iter().any(|a| *a == bare)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Drafter for TemplateDrafter {
    async fn draft(
        &self,
        email: &EmailRecord,
        context: &FullContext,
    ) -> Result<PendingAction, DraftError> {
        let style = StyleGuide::from_preferences(&context.preferences);
        let body = self.compose(email, &style);

        let mut args = serde_json::Map::new();
        args.insert("to".into(), email.from.trim().into());
        args.insert("subject".into(), reply_subject(&email.subject).into());
        args.insert("body".into(), body.clone().into());
        args.insert("in_reply_to".into(), email.id.clone().into());

        let preview = preview_of(Self::ACTION, email.from.trim(), &body);
        Ok(PendingAction::new(Self::ACTION, args, preview))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::learning::patterns::keys;
    use crate::llm::provider::CompletionResponse;
    use crate::store::model::{Preference, PreferenceValue};
    use chrono::Utc;
    use std::time::Duration;

    fn email() -> EmailRecord {
        let mut e = EmailRecord::new(
            "m-9",
            "sam@example.com",
            "me@example.com",
            "Quarterly numbers",
            "Could you review the attached numbers?",
        );
        e.from_name = Some("Sam Lee".into());
        e
    }

    fn pref(ctx: &mut FullContext, key: &str, value: PreferenceValue) {
        ctx.preferences.insert(
            key.into(),
            Preference {
                key: key.into(),
                value,
                confidence: 0.9,
                updated_at: Utc::now(),
            },
        );
    }

    #[tokio::test]
    async fn template_reply_has_greeting_and_sign_off_by_default() {
        let action = TemplateDrafter::new()
            .with_signature("Alex")
            .draft(&email(), &FullContext::default())
            .await
            .unwrap();
        assert_eq!(action.action_type, "send_email_reply");
        assert_eq!(action.args["subject"], "Re: Quarterly numbers");
        let body = action.draft_text().unwrap();
        assert!(body.starts_with("Hi Sam,"));
        assert!(body.ends_with("Best regards,\nAlex"));
        assert!(action.preview.contains("sam@example.com"));
    }

    #[tokio::test]
    async fn template_honours_learned_style() {
        let mut ctx = FullContext::default();
        pref(&mut ctx, keys::NO_GREETINGS, PreferenceValue::scalar("true"));
        pref(&mut ctx, keys::NO_SIGN_OFFS, PreferenceValue::scalar("true"));
        pref(&mut ctx, keys::TONE, PreferenceValue::scalar("concise"));

        let action = TemplateDrafter::new().draft(&email(), &ctx).await.unwrap();
        assert_eq!(action.draft_text(), Some("Thanks, I will follow up shortly."));
    }

    #[test]
    fn avoided_words_are_dropped() {
        let out = strip_avoided("Thanks, I will follow up shortly.", &["shortly".to_string()]);
        assert_eq!(out, "Thanks, I will follow up");
    }

    #[test]
    fn reply_subject_is_not_doubled() {
        assert_eq!(reply_subject("RE: hello"), "RE: hello");
        assert_eq!(reply_subject("hello"), "Re: hello");
    }

    struct CannedLlm(String);

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.0.clone(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn llm_drafter(reply: &str) -> LlmDrafter {
        let tools = vec![ToolDefinition {
            name: "send_email_reply".into(),
            description: "Send".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        LlmDrafter::new(Arc::new(CannedLlm(reply.into())), tools).with_retry_policy(RetryPolicy {
            max_retries: 0,
            backoff: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn llm_draft_parses_contract() {
        let reply = r#"{"action_type": "send_email_reply", "args": {"to": "sam@example.com", "subject": "Re: Q", "body": "Will do."}}"#;
        let action = llm_drafter(reply)
            .draft(&email(), &FullContext::default())
            .await
            .unwrap();
        assert_eq!(action.draft_text(), Some("Will do."));
        assert!(action.preview.contains("Will do."));
    }

    #[tokio::test]
    async fn llm_draft_rejects_unknown_action() {
        let reply = r#"{"action_type": "wire_money", "args": {}}"#;
        let err = llm_drafter(reply)
            .draft(&email(), &FullContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DraftError::UnknownAction(a) if a == "wire_money"));
    }
}
