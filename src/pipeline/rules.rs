//! Offline rules classifier.
//!
//! Used when no model is configured, and as the deterministic classifier in
//! tests. Rules are checked in order and the first match wins:
//! - noreply / marketing / bulk senders → Ignore
//! - spam phrasing or unsubscribe footers → Ignore
//! - scheduling, billing, legal → Escalate
//! - request phrasing or a question → Act
//!
//! Anything left over escalates.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::ClassificationError;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::types::{Classification, EmailRecord, TriageDecision};
use crate::store::model::FullContext;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
    /// Subject and body together.
    Text,
}

/// A single rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct Rule {
    pub regex: Regex,
    pub field: RuleField,
    pub decision: Classification,
    /// Why this rule triggers.
    pub reason: String,
}

impl Rule {
    fn new(pattern: &str, field: RuleField, decision: Classification, reason: &str) -> Self {
        Self {
            regex: Regex::new(pattern).unwrap(),
            field,
            decision,
            reason: reason.into(),
        }
    }

    fn matches(&self, email: &EmailRecord) -> bool {
        match self.field {
            RuleField::Sender => self.regex.is_match(email.from.trim()),
            RuleField::Subject => self.regex.is_match(&email.subject),
            RuleField::Body => self.regex.is_match(&email.body),
            RuleField::Text => {
                self.regex.is_match(&email.subject) || self.regex.is_match(&email.body)
            }
        }
    }
}

/// Ordered rule list with an escalate fallback.
pub struct RulesClassifier {
    rules: Vec<Rule>,
}

impl RulesClassifier {
    /// Rules for a typical inbox.
    pub fn default_rules() -> Self {
        use Classification::{Act, Escalate, Ignore};

        let rules = vec![
            Rule::new(r"(?i)^no[\-_.]?reply@", RuleField::Sender, Ignore, "noreply sender"),
            Rule::new(
                r"(?i)@(marketing|newsletter|promo|campaign)\b",
                RuleField::Sender,
                Ignore,
                "marketing/newsletter sender",
            ),
            Rule::new(
                r"(?i)^(mailer[\-_]?daemon|postmaster)@",
                RuleField::Sender,
                Ignore,
                "automated mail system",
            ),
            Rule::new(
                r"(?i)(unsubscribe|buy now|free money|lottery|click here|limited time offer|save 50%)",
                RuleField::Text,
                Ignore,
                "spam or bulk marketing",
            ),
            Rule::new(
                r"(?i)\b(invoice|billing|contract|legal|terms|payment|receipt)\b",
                RuleField::Text,
                Escalate,
                "billing or legal matter",
            ),
            Rule::new(
                r"(?i)\b(meeting|schedule|calendar|invite|reschedule|availability|book|appointment|kickoff)\b",
                RuleField::Text,
                Escalate,
                "scheduling request",
            ),
            Rule::new(
                r"(?i)\b(can you|could you|please|would you|help|do you mind|how do i)\b",
                RuleField::Text,
                Act,
                "direct request",
            ),
            Rule::new(r"\?", RuleField::Text, Act, "contains a question"),
        ];

        Self { rules }
    }

    /// Create an empty rules classifier: everything escalates.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule, checked before the built-in ones.
    pub fn prepend_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        decision: Classification,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.insert(
            0,
            Rule {
                regex: Regex::new(pattern)?,
                field,
                decision,
                reason: reason.into(),
            },
        );
        Ok(())
    }

    /// First matching rule's decision, or escalate.
    pub fn evaluate(&self, email: &EmailRecord) -> TriageDecision {
        for rule in &self.rules {
            if rule.matches(email) {
                debug!(
                    sender = %email.from,
                    reason = %rule.reason,
                    decision = %rule.decision,
                    "Email matched rule"
                );
                return TriageDecision::new(rule.decision, format!("Rule: {}", rule.reason));
            }
        }
        TriageDecision::new(Classification::Escalate, "No rule matched; needs a human")
    }
}

#[async_trait]
impl Classifier for RulesClassifier {
    fn name(&self) -> &str {
        "rules"
    }

    async fn classify(
        &self,
        email: &EmailRecord,
        _context: &FullContext,
    ) -> Result<TriageDecision, ClassificationError> {
        Ok(self.evaluate(email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(from: &str, subject: &str, body: &str) -> EmailRecord {
        EmailRecord::new("test-1", from, "me@example.com", subject, body)
    }

    fn decide(from: &str, subject: &str, body: &str) -> Classification {
        RulesClassifier::default_rules()
            .evaluate(&email(from, subject, body))
            .decision
    }

    #[test]
    fn ignores_noreply() {
        assert_eq!(decide("noreply@company.com", "Your account", "Welcome!"), Classification::Ignore);
        assert_eq!(decide("no-reply@service.io", "Update", "Info"), Classification::Ignore);
    }

    #[test]
    fn ignores_marketing_domain() {
        assert_eq!(
            decide("promo@newsletter.company.com", "Sale!", "Deals inside"),
            Classification::Ignore
        );
    }

    #[test]
    fn ignores_spam_phrasing() {
        assert_eq!(
            decide("deals@store.com", "Limited time offer", "Buy now and save 50%"),
            Classification::Ignore
        );
    }

    #[test]
    fn escalates_billing_before_request() {
        assert_eq!(
            decide("vendor@acme.com", "Invoice #42", "Could you confirm the payment date?"),
            Classification::Escalate
        );
    }

    #[test]
    fn escalates_scheduling() {
        assert_eq!(
            decide("alice@company.com", "Kickoff", "Let's book a slot next week."),
            Classification::Escalate
        );
    }

    #[test]
    fn acts_on_direct_request() {
        assert_eq!(
            decide("sam@company.com", "Deck", "Could you send me the latest deck"),
            Classification::Act
        );
        assert_eq!(decide("sam@company.com", "Quick one", "Is the report done?"), Classification::Act);
    }

    #[test]
    fn defaults_to_escalate() {
        let decision = RulesClassifier::default_rules().evaluate(&email("sam@company.com", "FYI", "Done."));
        assert_eq!(decision.decision, Classification::Escalate);
        assert!(!decision.reasoning.is_empty());
    }

    #[test]
    fn prepended_rule_wins() {
        let mut rules = RulesClassifier::default_rules();
        rules
            .prepend_rule(r"(?i)@vip\.com$", RuleField::Sender, Classification::Act, "vip")
            .unwrap();
        assert_eq!(
            rules.evaluate(&email("noreply@vip.com", "Status", "fyi")).decision,
            Classification::Act
        );
    }

    #[test]
    fn empty_rules_escalate_everything() {
        let rules = RulesClassifier::empty();
        assert_eq!(
            rules.evaluate(&email("noreply@company.com", "Spam", "Buy now")).decision,
            Classification::Escalate
        );
    }
}
