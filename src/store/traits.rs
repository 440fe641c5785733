//! Async persistence traits: the memory store and the checkpoint table.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::model::{
    FeedbackRecord, FullContext, InteractionRecord, Preference, PreferenceValue, SenderContext,
    SenderUpdate, TriageCorrection,
};

/// How many feedback / correction / history rows `get_full_context` pulls.
pub const CONTEXT_RECENT_LIMIT: usize = 5;

/// Durable memory: preferences, per-sender context and history logs.
///
/// Every write is a single atomic statement. A reader never observes a
/// half-applied sender upsert.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// All stored preferences keyed by name.
    async fn get_preferences(&self) -> Result<HashMap<String, Preference>, DatabaseError>;

    async fn get_preference(&self, key: &str) -> Result<Option<Preference>, DatabaseError>;

    /// Insert or replace a preference.
    async fn set_preference(
        &self,
        key: &str,
        value: &PreferenceValue,
        confidence: f64,
    ) -> Result<(), DatabaseError>;

    async fn get_sender_context(&self, address: &str) -> Result<Option<SenderContext>, DatabaseError>;

    /// Create or update a sender. Set fields in `update` overwrite, `note` is
    /// appended, and `interaction_count` is incremented.
    async fn upsert_sender_context(
        &self,
        address: &str,
        update: &SenderUpdate,
        note: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Append one `email_history` row.
    async fn record_interaction(&self, record: &InteractionRecord) -> Result<(), DatabaseError>;

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), DatabaseError>;

    async fn record_triage_correction(&self, record: &TriageCorrection) -> Result<(), DatabaseError>;

    /// Most recent corrections for a sender, newest first.
    async fn recent_triage_corrections(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TriageCorrection>, DatabaseError>;

    /// Most recent feedback rows across all senders, newest first.
    async fn recent_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, DatabaseError>;

    /// Interaction history for a sender, newest first.
    async fn sender_history(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, DatabaseError>;

    /// Substring search over subject and detail, optionally for one sender.
    async fn search_history(
        &self,
        query: &str,
        sender: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, DatabaseError>;

    /// The single read used to build classifier and drafter context.
    async fn get_full_context(&self, address: &str) -> Result<FullContext, DatabaseError> {
        Ok(FullContext {
            preferences: self.get_preferences().await?,
            sender: self.get_sender_context(address).await?,
            recent_feedback: self.recent_feedback(CONTEXT_RECENT_LIMIT).await?,
            recent_corrections: self
                .recent_triage_corrections(address, CONTEXT_RECENT_LIMIT)
                .await?,
            sender_history: self.sender_history(address, CONTEXT_RECENT_LIMIT).await?,
        })
    }
}

/// A serialized checkpoint row. Decoding is the workflow's business.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    pub conversation_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Tombstone left behind when a checkpoint is consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointResolution {
    pub conversation_id: String,
    /// `approve`, `deny`, `edit`, or a cancellation reason.
    pub resolution: String,
    pub resolved_at: DateTime<Utc>,
}

/// Single-use checkpoints keyed by conversation id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Fails if one already exists for the conversation.
    async fn save_checkpoint(&self, checkpoint: &StoredCheckpoint) -> Result<(), DatabaseError>;

    async fn load_checkpoint(
        &self,
        conversation_id: &str,
    ) -> Result<Option<StoredCheckpoint>, DatabaseError>;

    /// Atomically delete and return a checkpoint, recording `resolution`.
    /// At most one caller ever receives `Some` for a given save.
    async fn take_checkpoint(
        &self,
        conversation_id: &str,
        resolution: &str,
    ) -> Result<Option<StoredCheckpoint>, DatabaseError>;

    /// How a previously taken checkpoint was resolved.
    async fn resolution(
        &self,
        conversation_id: &str,
    ) -> Result<Option<CheckpointResolution>, DatabaseError>;

    /// All outstanding checkpoints, oldest first.
    async fn list_checkpoints(&self) -> Result<Vec<StoredCheckpoint>, DatabaseError>;
}
