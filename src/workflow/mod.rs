//! Interruptible email workflow.
//!
//! ```text
//! LoadContext -> Triage -> Draft -> ApprovalGate -> Execute -> Persist -> End
//!                  |         |           |
//!                  |         |           +-> Suspended ~~> Resumed -> Execute | Persist
//!                  +---------+-> Persist (ignore, escalate, draft failure)
//! ```

pub mod approval;
pub mod checkpoint;
pub mod events;
pub mod executor;
pub mod interactive;
pub mod state;

pub use approval::ApprovalPolicy;
pub use checkpoint::Checkpoint;
pub use events::{ApprovalDecision, PendingApproval, WorkflowEvent};
pub use executor::{ExecutionOutcome, WorkflowExecutor, validate_conversation_id};
pub use interactive::{DecisionSource, run_interactive};
pub use state::{ExecutionResult, ExecutionStatus, HumanDecision, HumanEdit, Step, WorkflowState};
