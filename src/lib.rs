//! mail-steward: an email agent that triages, drafts and acts, pausing for
//! a human before anything irreversible, and learns from the edits it gets.

pub mod config;
pub mod error;
pub mod learning;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod tools;
pub mod workflow;
