//! Triage and drafting pipeline.
//!
//! An inbound email flows through:
//! 1. `Classifier::classify()`: ignore, escalate, or act
//! 2. `Drafter::draft()`: the action to take, for `act` only
//!
//! Neither step executes anything. Execution and approval belong to the
//! workflow executor.

pub mod classifier;
pub mod drafter;
pub mod email;
pub mod rules;
pub mod types;

pub use classifier::{Classifier, LlmClassifier};
pub use drafter::{Drafter, LlmDrafter, TemplateDrafter};
pub use email::parse_eml;
pub use rules::RulesClassifier;
pub use types::{Classification, EmailRecord, PendingAction, TriageDecision};
