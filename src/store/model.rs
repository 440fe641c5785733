//! Records held by the memory store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::Classification;

// ── Preferences ─────────────────────────────────────────────────────

/// A preference value: a single scalar, or a deduplicated set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Scalar(String),
    Set(Vec<String>),
}

impl PreferenceValue {
    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(value.into())
    }

    /// Build a set value, sorted and deduplicated.
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
        items.sort();
        items.dedup();
        Self::Set(items)
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::Set(_) => None,
        }
    }

    pub fn as_set(&self) -> Option<&[String]> {
        match self {
            Self::Set(items) => Some(items),
            Self::Scalar(_) => None,
        }
    }
}

impl fmt::Display for PreferenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => f.write_str(s),
            Self::Set(items) => f.write_str(&items.join(", ")),
        }
    }
}

/// A learned preference with its confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub key: String,
    pub value: PreferenceValue,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

// ── Sender context ──────────────────────────────────────────────────

/// What the agent knows about one counterpart address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderContext {
    pub address: String,
    pub name: Option<String>,
    pub relationship: Option<String>,
    pub tone: Option<String>,
    /// Learned classification that bypasses the classifier.
    pub triage_override: Option<Classification>,
    pub interaction_count: i64,
    /// Append-only free-text notes, oldest first.
    pub notes: Vec<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

/// Last-write-wins fields for `upsert_sender_context`. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderUpdate {
    pub name: Option<String>,
    pub relationship: Option<String>,
    pub tone: Option<String>,
    pub triage_override: Option<Classification>,
    /// Write fields and note without counting an interaction or touching
    /// `last_interaction`.
    pub note_only: bool,
}

// ── History records ─────────────────────────────────────────────────

/// Terminal status of one processed email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Ignored,
    Escalated,
    Executed,
    Denied,
    Failed,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Escalated => "escalated",
            Self::Executed => "executed",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignored" => Ok(Self::Ignored),
            "escalated" => Ok(Self::Escalated),
            "executed" => Ok(Self::Executed),
            "denied" => Ok(Self::Denied),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown interaction status '{other}'")),
        }
    }
}

/// One `email_history` row: the terminal summary of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub email_id: String,
    pub conversation_id: String,
    pub from: String,
    pub subject: String,
    pub decision: Option<Classification>,
    pub action_taken: Option<String>,
    pub human_approved: Option<bool>,
    pub status: InteractionStatus,
    /// Human-readable outcome or failure cause.
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// An edited draft, kept for the pattern learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub email_id: String,
    pub from: String,
    pub subject: String,
    pub original_draft: String,
    pub edited_draft: String,
    pub note: String,
    /// Action type the draft belonged to.
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

/// A human correction of a triage decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageCorrection {
    pub from: String,
    pub subject: String,
    pub original: Classification,
    pub corrected: Classification,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl TriageCorrection {
    pub fn new(
        from: impl Into<String>,
        subject: impl Into<String>,
        original: Classification,
        corrected: Classification,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            subject: subject.into(),
            original,
            corrected,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

// ── Full context ────────────────────────────────────────────────────

/// Everything the classifier and drafter get to see about memory.
#[derive(Debug, Clone, Default)]
pub struct FullContext {
    pub preferences: HashMap<String, Preference>,
    pub sender: Option<SenderContext>,
    pub recent_feedback: Vec<FeedbackRecord>,
    pub recent_corrections: Vec<TriageCorrection>,
    pub sender_history: Vec<InteractionRecord>,
}

impl FullContext {
    /// Render as prompt text. Empty context renders as an empty string.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if !self.preferences.is_empty() {
            let mut keys: Vec<&String> = self.preferences.keys().collect();
            keys.sort();
            let lines: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let p = &self.preferences[k];
                    format!("- {}: {} (confidence {:.2})", k, p.value, p.confidence)
                })
                .collect();
            parts.push(format!("User preferences:\n{}", lines.join("\n")));
        }

        if let Some(sender) = &self.sender {
            let mut lines = vec![format!("- address: {}", sender.address)];
            if let Some(name) = &sender.name {
                lines.push(format!("- name: {name}"));
            }
            if let Some(rel) = &sender.relationship {
                lines.push(format!("- relationship: {rel}"));
            }
            if let Some(tone) = &sender.tone {
                lines.push(format!("- preferred tone: {tone}"));
            }
            lines.push(format!("- past interactions: {}", sender.interaction_count));
            for note in sender.notes.iter().rev().take(3) {
                lines.push(format!("- note: {note}"));
            }
            parts.push(format!("Sender context:\n{}", lines.join("\n")));
        }

        if !self.sender_history.is_empty() {
            let lines: Vec<String> = self
                .sender_history
                .iter()
                .map(|r| format!("- '{}' → {}", r.subject, r.status))
                .collect();
            parts.push(format!("Recent emails from this sender:\n{}", lines.join("\n")));
        }

        if !self.recent_corrections.is_empty() {
            let lines: Vec<String> = self
                .recent_corrections
                .iter()
                .map(|c| format!("- {} → {} ({})", c.original, c.corrected, c.reason))
                .collect();
            parts.push(format!("Past triage corrections:\n{}", lines.join("\n")));
        }

        if !self.recent_feedback.is_empty() {
            parts.push(format!(
                "The user has edited {} recent drafts.",
                self.recent_feedback.len()
            ));
        }

        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_set_is_sorted_and_deduplicated() {
        let value = PreferenceValue::set(["zeta", "alpha", "zeta"]);
        assert_eq!(value.as_set().unwrap(), ["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn preference_value_json_is_untagged() {
        let scalar: PreferenceValue = serde_json::from_str("\"concise\"").unwrap();
        assert_eq!(scalar, PreferenceValue::scalar("concise"));
        let set: PreferenceValue = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(set.as_set().unwrap().len(), 2);
    }

    #[test]
    fn empty_context_summary_is_empty() {
        assert!(FullContext::default().summary().is_empty());
    }

    #[test]
    fn summary_mentions_sender_and_preferences() {
        let mut ctx = FullContext::default();
        ctx.preferences.insert(
            "tone".into(),
            Preference {
                key: "tone".into(),
                value: PreferenceValue::scalar("concise"),
                confidence: 0.7,
                updated_at: Utc::now(),
            },
        );
        ctx.sender = Some(SenderContext {
            address: "sam@example.com".into(),
            name: Some("Sam".into()),
            relationship: None,
            tone: None,
            triage_override: None,
            interaction_count: 4,
            notes: vec!["prefers mornings".into()],
            last_interaction: None,
        });
        let summary = ctx.summary();
        assert!(summary.contains("tone: concise"));
        assert!(summary.contains("name: Sam"));
        assert!(summary.contains("prefers mornings"));
    }

    #[test]
    fn interaction_status_parses() {
        assert_eq!("denied".parse::<InteractionStatus>().unwrap(), InteractionStatus::Denied);
        assert!("bogus".parse::<InteractionStatus>().is_err());
    }
}
