//! Shared types for the triage and drafting pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound email ───────────────────────────────────────────────────

/// An inbound email as the workflow sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Unique id (Message-ID or generated UUID).
    pub id: String,
    /// Explicit conversation key. Derived from `id` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Sender address.
    pub from: String,
    /// Sender display name, if the headers carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl EmailRecord {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: None,
            from: from.into(),
            from_name: None,
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Canonical sender key for memory lookups.
    pub fn sender_key(&self) -> String {
        self.from.trim().to_lowercase()
    }

    /// Conversation key: the explicit id, or `conv-<email id>` with the id
    /// reduced to key-safe characters.
    pub fn conversation_key(&self) -> String {
        match &self.conversation_id {
            Some(id) => id.clone(),
            None => format!("conv-{}", key_safe(&self.id, 120)),
        }
    }
}

/// Map `raw` onto `[A-Za-z0-9._:@-]`, dropping angle brackets and
/// truncating to `max` chars.
pub fn key_safe(raw: &str, max: usize) -> String {
    raw.trim_matches(|c| c == '<' || c == '>')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._:@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(max)
        .collect()
}

// ── Classification ──────────────────────────────────────────────────

/// Triage outcome for an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Noise. Recorded and dropped.
    Ignore,
    /// Needs a human. Informational notification, no draft.
    Escalate,
    /// The agent drafts an action.
    Act,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Escalate => "escalate",
            Self::Act => "act",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "escalate" => Ok(Self::Escalate),
            "act" => Ok(Self::Act),
            other => Err(format!("unknown classification '{other}'")),
        }
    }
}

/// Structured output of a classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageDecision {
    pub decision: Classification,
    pub reasoning: String,
}

impl TriageDecision {
    pub fn new(decision: Classification, reasoning: impl Into<String>) -> Self {
        Self {
            decision,
            reasoning: reasoning.into(),
        }
    }
}

// ── Drafted action ──────────────────────────────────────────────────

/// Argument fields that carry the human-editable draft text, in priority order.
pub const DRAFT_TEXT_FIELDS: &[&str] = &["body", "content", "description"];

/// Longest value shown per argument in an approval summary.
const SUMMARY_VALUE_CHARS: usize = 60;

/// An action the drafter wants to take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Tool name, e.g. `send_email_reply`.
    pub action_type: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// What the human sees when asked to approve.
    #[serde(default)]
    pub preview: String,
}

impl PendingAction {
    pub fn new(
        action_type: impl Into<String>,
        args: serde_json::Map<String, serde_json::Value>,
        preview: impl Into<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            args,
            preview: preview.into(),
        }
    }

    /// Name of the argument holding the draft text, if any.
    pub fn draft_field(&self) -> Option<&'static str> {
        DRAFT_TEXT_FIELDS
            .iter()
            .copied()
            .find(|f| self.args.get(*f).is_some_and(|v| v.is_string()))
    }

    pub fn draft_text(&self) -> Option<&str> {
        self.draft_field()
            .and_then(|f| self.args.get(f))
            .and_then(|v| v.as_str())
    }

    /// One line per argument, values truncated.
    pub fn argument_summary(&self) -> String {
        let mut keys: Vec<&String> = self.args.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| {
                let raw = match &self.args[k] {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let mut shown: String = raw.chars().take(SUMMARY_VALUE_CHARS).collect();
                if raw.chars().count() > SUMMARY_VALUE_CHARS {
                    shown.push_str("...");
                }
                format!("{k}: {shown}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_defaults_to_email_id() {
        let email = EmailRecord::new("m-1", "a@b.com", "me@x.com", "Hi", "Body");
        assert_eq!(email.conversation_key(), "conv-m-1");

        let email = email.with_conversation_id("thread-7");
        assert_eq!(email.conversation_key(), "thread-7");

        let odd = EmailRecord::new("<a+b/c@x.com>", "a@b.com", "", "", "");
        assert_eq!(odd.conversation_key(), "conv-a-b-c@x.com");
    }

    #[test]
    fn sender_key_is_case_folded() {
        let email = EmailRecord::new("m-1", " Alice@Example.COM ", "", "", "");
        assert_eq!(email.sender_key(), "alice@example.com");
    }

    #[test]
    fn classification_round_trips_as_snake_case() {
        let json = serde_json::to_string(&Classification::Escalate).unwrap();
        assert_eq!(json, "\"escalate\"");
        assert_eq!("ACT".parse::<Classification>().unwrap(), Classification::Act);
        assert!("respond".parse::<Classification>().is_err());
    }

    #[test]
    fn draft_text_prefers_body() {
        let args = serde_json::json!({"to": "a@b.com", "body": "Hello", "description": "x"});
        let action = PendingAction::new(
            "send_email_reply",
            args.as_object().cloned().unwrap(),
            "preview",
        );
        assert_eq!(action.draft_field(), Some("body"));
        assert_eq!(action.draft_text(), Some("Hello"));

        let none = PendingAction::new("delete_email", serde_json::Map::new(), "");
        assert!(none.draft_text().is_none());
    }

    #[test]
    fn argument_summary_is_sorted_and_truncated() {
        let long = "x".repeat(100);
        let args = serde_json::json!({"to": "a@b.com", "body": long});
        let action = PendingAction::new("send_email_reply", args.as_object().cloned().unwrap(), "");
        let summary = action.argument_summary();
        assert!(summary.starts_with("body: "));
        assert!(summary.contains("..."));
        assert!(summary.ends_with("to: a@b.com"));
    }

    #[test]
    fn email_record_deserializes_with_defaults() {
        let email: EmailRecord =
            serde_json::from_str(r#"{"id": "1", "from": "a@b.com", "subject": "s"}"#).unwrap();
        assert_eq!(email.body, "");
        assert!(email.conversation_id.is_none());
    }
}
