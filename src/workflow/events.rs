//! Events exchanged with the human side of the workflow.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::{Classification, PendingAction};
use crate::workflow::state::{ExecutionResult, HumanDecision, HumanEdit};

/// Pending-approval notice sent when a dangerous action suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub conversation_id: String,
    pub action_type: String,
    pub preview: String,
    pub argument_summary: String,
}

impl PendingApproval {
    pub fn from_action(conversation_id: &str, action: &PendingAction) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            action_type: action.action_type.clone(),
            preview: action.preview.clone(),
            argument_summary: action.argument_summary(),
        }
    }
}

/// The human's answer to a [`PendingApproval`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: HumanDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<HumanEdit>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            decision: HumanDecision::Approve,
            edit: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            decision: HumanDecision::Deny,
            edit: None,
        }
    }

    pub fn edit(edit: HumanEdit) -> Self {
        Self {
            decision: HumanDecision::Edit,
            edit: Some(edit),
        }
    }

    /// Replace the draft text only.
    pub fn edit_body(body: impl Into<String>) -> Self {
        Self::edit(HumanEdit::Body(body.into()))
    }

    /// Replace the whole argument object.
    pub fn edit_args(args: serde_json::Value) -> Self {
        match args {
            serde_json::Value::Object(map) => Self::edit(HumanEdit::Args(map)),
            // Non-objects fail the schema check downstream.
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                Self::edit(HumanEdit::Args(map))
            }
        }
    }
}

/// What the executor broadcasts to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A dangerous action is waiting for a decision.
    ApprovalRequested(PendingApproval),
    /// Informational: the email needs a human, nothing is waiting.
    Escalated {
        conversation_id: String,
        email_id: String,
        from: String,
        subject: String,
        reasoning: String,
    },
    /// A workflow reached its terminal step.
    Completed {
        conversation_id: String,
        classification: Option<Classification>,
        result: ExecutionResult,
    },
}
