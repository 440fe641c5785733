//! Synchronous-feeling driver: start a workflow and, if it suspends, ask a
//! [`DecisionSource`] for the answer within a deadline.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Error;
use crate::pipeline::types::EmailRecord;
use crate::workflow::events::{ApprovalDecision, PendingApproval};
use crate::workflow::executor::{ExecutionOutcome, WorkflowExecutor};

/// Reason recorded when nobody answers in time.
pub const TIMEOUT_REASON: &str = "approval timeout";

/// Somewhere a human decision comes from: a terminal, a chat, a test.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Present `pending` and wait for the answer. `None` means the source
    /// gave up (closed input, user walked away).
    async fn next_decision(&self, pending: &PendingApproval) -> Option<ApprovalDecision>;
}

/// Run one email end to end. A suspended workflow waits up to `timeout`
/// for a decision; silence or a closed source cancels it as denied.
pub async fn run_interactive(
    executor: &WorkflowExecutor,
    email: EmailRecord,
    source: &dyn DecisionSource,
    timeout: Duration,
) -> Result<ExecutionOutcome, Error> {
    let outcome = executor.start(email).await?;
    let ExecutionOutcome::Suspended { pending } = outcome else {
        return Ok(outcome);
    };

    match tokio::time::timeout(timeout, source.next_decision(&pending)).await {
        Ok(Some(decision)) => executor.resume(&pending.conversation_id, decision).await,
        Ok(None) => {
            info!(conversation_id = %pending.conversation_id, "Decision source closed");
            executor.cancel(&pending.conversation_id, "no decision").await
        }
        Err(_) => {
            warn!(
                conversation_id = %pending.conversation_id,
                timeout_secs = timeout.as_secs(),
                "Approval timed out, denying"
            );
            executor.cancel(&pending.conversation_id, TIMEOUT_REASON).await
        }
    }
}
