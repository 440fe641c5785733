//! Preference learning from human edits and triage corrections.

pub mod learner;
pub mod patterns;

pub use learner::{Pattern, PatternLearner};
pub use patterns::{PatternSet, StyleGuide, extract_patterns};
