//! Checkpoint codec: [`WorkflowState`] to and from its stored JSON form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, WorkflowError};
use crate::store::traits::StoredCheckpoint;
use crate::workflow::state::{WORKFLOW_STATE_VERSION, WorkflowState};

/// A durable snapshot of a suspended workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub conversation_id: String,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            conversation_id: state.conversation_id.clone(),
            state,
            created_at: Utc::now(),
        }
    }

    /// Serialize for the checkpoint table.
    pub fn encode(&self) -> Result<StoredCheckpoint, DatabaseError> {
        let payload = serde_json::to_string(&self.state)
            .map_err(|e| DatabaseError::Serialization(format!("checkpoint: {e}")))?;
        Ok(StoredCheckpoint {
            conversation_id: self.conversation_id.clone(),
            payload,
            created_at: self.created_at,
        })
    }

    /// Decode a stored row. Anything unexpected is a corrupt checkpoint.
    pub fn decode(stored: &StoredCheckpoint) -> Result<Self, WorkflowError> {
        let corrupt = |reason: String| WorkflowError::CorruptCheckpoint {
            conversation_id: stored.conversation_id.clone(),
            reason,
        };

        let state: WorkflowState =
            serde_json::from_str(&stored.payload).map_err(|e| corrupt(format!("invalid JSON: {e}")))?;
        if state.version != WORKFLOW_STATE_VERSION {
            return Err(corrupt(format!(
                "state version {} (expected {WORKFLOW_STATE_VERSION})",
                state.version
            )));
        }
        if state.conversation_id != stored.conversation_id {
            return Err(corrupt(format!(
                "payload belongs to conversation {}",
                state.conversation_id
            )));
        }
        if state.pending_action.is_none() {
            return Err(corrupt("no pending action".into()));
        }

        Ok(Self {
            conversation_id: stored.conversation_id.clone(),
            state,
            created_at: stored.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Classification, EmailRecord, PendingAction};
    use crate::workflow::state::Step;

    fn suspended_state() -> WorkflowState {
        let email = EmailRecord::new("m-1", "sam@example.com", "me@example.com", "Deck", "Send it?");
        let mut state = WorkflowState::new("conv-m-1", email);
        state.classification = Some(Classification::Act);
        state.pending_action = Some(PendingAction::new(
            "send_email_reply",
            serde_json::json!({"to": "sam@example.com", "subject": "Re: Deck", "body": "Attached."})
                .as_object()
                .cloned()
                .unwrap(),
            "reply",
        ));
        state.requires_approval = true;
        state.enter(Step::ApprovalGate, "");
        state.enter(Step::Suspended, "");
        state
    }

    #[test]
    fn encode_then_decode_preserves_state() {
        let checkpoint = Checkpoint::new(suspended_state());
        let stored = checkpoint.encode().unwrap();
        let restored = Checkpoint::decode(&stored).unwrap();
        assert_eq!(restored.state, checkpoint.state);
    }

    #[test]
    fn garbage_payload_is_corrupt() {
        let stored = StoredCheckpoint {
            conversation_id: "conv-x".into(),
            payload: "{not json".into(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            Checkpoint::decode(&stored),
            Err(WorkflowError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn version_mismatch_is_corrupt() {
        let mut state = suspended_state();
        state.version = WORKFLOW_STATE_VERSION + 1;
        let stored = Checkpoint::new(state).encode().unwrap();
        let err = Checkpoint::decode(&stored).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn mismatched_conversation_is_corrupt() {
        let mut stored = Checkpoint::new(suspended_state()).encode().unwrap();
        stored.conversation_id = "conv-other".into();
        assert!(Checkpoint::decode(&stored).is_err());
    }
}
