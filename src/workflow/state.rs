//! Workflow state for one email.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::pipeline::types::PendingAction;
use crate::pipeline::types::{Classification, EmailRecord};

/// Bumped whenever the serialized shape of [`WorkflowState`] changes.
pub const WORKFLOW_STATE_VERSION: u32 = 1;

/// Steps of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    LoadContext,
    Triage,
    Draft,
    ApprovalGate,
    Suspended,
    Resumed,
    Execute,
    Persist,
    End,
}

impl Step {
    /// Check if this step may follow `self`.
    pub fn can_transition_to(&self, next: Step) -> bool {
        use Step::*;

        matches!(
            (self, next),
            (LoadContext, Triage)
                | (Triage, Draft)
                | (Triage, Persist)
                | (Draft, ApprovalGate)
                | (Draft, Persist)
                | (ApprovalGate, Suspended)
                | (ApprovalGate, Execute)
                | (ApprovalGate, Persist)
                | (Suspended, Resumed)
                | (Suspended, Persist)
                | (Resumed, Execute)
                | (Resumed, Persist)
                | (Execute, Persist)
                | (Persist, End)
        )
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LoadContext => "load_context",
            Self::Triage => "triage",
            Self::Draft => "draft",
            Self::ApprovalGate => "approval_gate",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::Execute => "execute",
            Self::Persist => "persist",
            Self::End => "end",
        };
        write!(f, "{s}")
    }
}

/// The human's answer at the Approval Gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecision {
    Approve,
    Deny,
    Edit,
}

impl HumanDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Edit => "edit",
        }
    }
}

impl std::fmt::Display for HumanDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HumanDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "a" | "yes" | "y" => Ok(Self::Approve),
            "deny" | "d" | "no" | "n" => Ok(Self::Deny),
            "edit" | "e" => Ok(Self::Edit),
            other => Err(format!("unknown decision '{other}'")),
        }
    }
}

/// Replacement content supplied with an `edit` decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HumanEdit {
    /// Full replacement argument object.
    Args(serde_json::Map<String, serde_json::Value>),
    /// Replacement of the draft text field only.
    Body(String),
}

/// Outcome class of the Execute step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    /// Nothing ran (ignored, escalated, denied).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: output.into(),
        }
    }

    pub fn skipped(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            output: output.into(),
        }
    }
}

/// One entry in the workflow's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// Everything the workflow knows about one email. Serialized verbatim into
/// the checkpoint when the workflow suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    pub conversation_id: String,
    pub email: EmailRecord,
    pub classification: Option<Classification>,
    #[serde(default)]
    pub reasoning: String,
    pub pending_action: Option<PendingAction>,
    #[serde(default)]
    pub requires_approval: bool,
    pub human_decision: Option<HumanDecision>,
    pub human_edit: Option<HumanEdit>,
    pub execution_result: Option<ExecutionResult>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
}

impl WorkflowState {
    pub fn new(conversation_id: impl Into<String>, email: EmailRecord) -> Self {
        Self {
            version: WORKFLOW_STATE_VERSION,
            conversation_id: conversation_id.into(),
            email,
            classification: None,
            reasoning: String::new(),
            pending_action: None,
            requires_approval: false,
            human_decision: None,
            human_edit: None,
            execution_result: None,
            history: Vec::new(),
        }
    }

    /// Step most recently entered.
    pub fn current_step(&self) -> Option<Step> {
        self.history.last().map(|r| r.step)
    }

    /// Append a step to the audit trail.
    pub fn enter(&mut self, step: Step, note: impl Into<String>) {
        if let Some(current) = self.current_step()
            && !current.can_transition_to(step)
        {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                from = %current,
                to = %step,
                "Unexpected step transition"
            );
        }
        self.history.push(StepRecord {
            step,
            at: Utc::now(),
            note: note.into(),
        });
    }

    /// Add a note to the current step without changing it.
    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        match self.history.last_mut() {
            Some(last) if last.note.is_empty() => last.note = note,
            Some(last) => {
                last.note.push_str("; ");
                last.note.push_str(&note);
            }
            None => self.enter(Step::LoadContext, note),
        }
    }

    /// Whether `step` was ever entered.
    pub fn history_contains(&self, step: Step) -> bool {
        self.history.iter().any(|r| r.step == step)
    }

    /// Whether every recorded transition is an edge of the step graph.
    pub fn history_is_consistent(&self) -> bool {
        self.history
            .windows(2)
            .all(|pair| pair[0].step.can_transition_to(pair[1].step))
    }

    /// Whether any history entry mentions `needle`.
    pub fn history_mentions(&self, needle: &str) -> bool {
        self.history.iter().any(|r| r.note.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_transitions_follow_the_graph() {
        assert!(Step::Triage.can_transition_to(Step::Draft));
        assert!(Step::ApprovalGate.can_transition_to(Step::Suspended));
        assert!(Step::Resumed.can_transition_to(Step::Persist));
        assert!(!Step::Triage.can_transition_to(Step::Execute));
        assert!(!Step::Suspended.can_transition_to(Step::Execute));
    }

    #[test]
    fn failed_checkpoint_save_can_persist_from_suspended() {
        let email = EmailRecord::new("m-2", "a@b.com", "", "s", "b");
        let mut state = WorkflowState::new("conv-m-2", email);
        for step in [
            Step::LoadContext,
            Step::Triage,
            Step::Draft,
            Step::ApprovalGate,
            Step::Suspended,
            Step::Persist,
            Step::End,
        ] {
            state.enter(step, "");
        }
        assert!(state.history_is_consistent());
        assert!(state.history_contains(Step::Suspended));
        assert!(!state.history_contains(Step::Resumed));

        state.enter(Step::Execute, "");
        assert!(!state.history_is_consistent());
    }

    #[test]
    fn decision_parses_short_forms() {
        assert_eq!("y".parse::<HumanDecision>().unwrap(), HumanDecision::Approve);
        assert_eq!("Deny".parse::<HumanDecision>().unwrap(), HumanDecision::Deny);
        assert_eq!("e".parse::<HumanDecision>().unwrap(), HumanDecision::Edit);
        assert!("maybe".parse::<HumanDecision>().is_err());
    }

    #[test]
    fn notes_accumulate_on_current_step() {
        let email = EmailRecord::new("m-1", "a@b.com", "", "s", "b");
        let mut state = WorkflowState::new("conv-m-1", email);
        state.enter(Step::LoadContext, "");
        state.note("memory unavailable");
        state.note("using empty context");
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].note, "memory unavailable; using empty context");
        assert!(state.history_mentions("empty context"));
    }

    #[test]
    fn human_edit_serializes_tagged() {
        let edit = HumanEdit::Body("new text".into());
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "body", "value": "new text"}));
    }
}
