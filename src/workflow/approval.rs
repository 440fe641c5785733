//! Approval Gate policy: which action types suspend for a human.

use std::collections::BTreeSet;

/// Actions with external, hard-to-reverse side effects.
pub const DEFAULT_DANGEROUS_ACTIONS: &[&str] = &[
    "send_email_reply",
    "schedule_meeting",
    "delete_email",
    "forward_email",
];

/// Read-only actions that auto-approve.
pub const DEFAULT_SAFE_ACTIONS: &[&str] = &["check_calendar", "search_past_emails", "draft_email_reply"];

/// Classification of action types into safe and dangerous.
///
/// An action listed as both is dangerous. An action listed as neither is
/// treated as dangerous too: the gate fails closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    dangerous: BTreeSet<String>,
    safe: BTreeSet<String>,
}

impl ApprovalPolicy {
    pub fn new<D, S>(dangerous: D, safe: S) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        let dangerous: BTreeSet<String> = dangerous.into_iter().map(Into::into).collect();
        let safe = safe
            .into_iter()
            .map(Into::into)
            .filter(|a| !dangerous.contains(a))
            .collect();
        Self { dangerous, safe }
    }

    /// Whether `action_type` must wait for a human decision.
    pub fn requires_approval(&self, action_type: &str) -> bool {
        !self.safe.contains(action_type)
    }

    pub fn is_safe(&self, action_type: &str) -> bool {
        self.safe.contains(action_type)
    }

    pub fn safe_actions(&self) -> Vec<String> {
        self.safe.iter().cloned().collect()
    }

    pub fn dangerous_actions(&self) -> Vec<String> {
        self.dangerous.iter().cloned().collect()
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_DANGEROUS_ACTIONS.iter().copied(),
            DEFAULT_SAFE_ACTIONS.iter().copied(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_splits_actions() {
        let policy = ApprovalPolicy::default();
        for action in DEFAULT_DANGEROUS_ACTIONS {
            assert!(policy.requires_approval(action), "{action} should need approval");
        }
        for action in DEFAULT_SAFE_ACTIONS {
            assert!(!policy.requires_approval(action), "{action} should auto-approve");
        }
    }

    #[test]
    fn unknown_action_requires_approval() {
        assert!(ApprovalPolicy::default().requires_approval("wire_money"));
    }

    #[test]
    fn dangerous_wins_over_safe() {
        let policy = ApprovalPolicy::new(vec!["check_calendar"], vec!["check_calendar", "search_past_emails"]);
        assert!(policy.requires_approval("check_calendar"));
        assert_eq!(policy.safe_actions(), vec!["search_past_emails".to_string()]);
    }
}
