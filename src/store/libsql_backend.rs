//! libSQL backend: `MemoryStore` and `CheckpointStore` over one connection.
//!
//! Supports local file and in-memory databases.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::Classification;
use crate::store::migrations;
use crate::store::model::{
    FeedbackRecord, InteractionRecord, InteractionStatus, Preference, PreferenceValue,
    SenderContext, SenderUpdate, TriageCorrection,
};
use crate::store::traits::{CheckpointResolution, CheckpointStore, MemoryStore, StoredCheckpoint};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_bool(b: Option<bool>) -> libsql::Value {
    match b {
        Some(b) => libsql::Value::Integer(i64::from(b)),
        None => libsql::Value::Null,
    }
}

/// Map a row-level libsql error.
fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

fn parse_classification(s: &str) -> Result<Classification, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Preference values are stored as JSON. Anything that is not valid JSON is
/// read back as a plain scalar.
fn decode_preference_value(raw: &str) -> PreferenceValue {
    serde_json::from_str(raw).unwrap_or_else(|_| PreferenceValue::Scalar(raw.to_string()))
}

fn encode_preference_value(value: &PreferenceValue) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_preference(row: &libsql::Row) -> Result<Preference, DatabaseError> {
    let raw: String = row.get(1).map_err(col_err)?;
    let updated: String = row.get(3).map_err(col_err)?;
    Ok(Preference {
        key: row.get(0).map_err(col_err)?,
        value: decode_preference_value(&raw),
        confidence: row.get(2).map_err(col_err)?,
        updated_at: parse_datetime(&updated),
    })
}

/// Column order matches SENDER_COLUMNS.
fn row_to_sender(row: &libsql::Row) -> Result<SenderContext, DatabaseError> {
    let notes_raw: String = row.get(4).map_err(col_err)?;
    let notes: Vec<String> = serde_json::from_str(&notes_raw)
        .map_err(|e| DatabaseError::Serialization(format!("sender notes: {e}")))?;
    let triage_override = match row.get::<String>(6).ok() {
        Some(s) => Some(parse_classification(&s)?),
        None => None,
    };
    Ok(SenderContext {
        address: row.get(0).map_err(col_err)?,
        name: row.get::<String>(1).ok(),
        relationship: row.get::<String>(2).ok(),
        tone: row.get::<String>(3).ok(),
        notes,
        interaction_count: row.get(5).map_err(col_err)?,
        triage_override,
        last_interaction: row.get::<String>(7).ok().map(|s| parse_datetime(&s)),
    })
}

/// Column order matches HISTORY_COLUMNS.
fn row_to_interaction(row: &libsql::Row) -> Result<InteractionRecord, DatabaseError> {
    let decision = match row.get::<String>(4).ok() {
        Some(s) => Some(parse_classification(&s)?),
        None => None,
    };
    let status_str: String = row.get(7).map_err(col_err)?;
    let status = status_str
        .parse::<InteractionStatus>()
        .map_err(DatabaseError::Serialization)?;
    let timestamp: String = row.get(9).map_err(col_err)?;
    Ok(InteractionRecord {
        email_id: row.get(0).map_err(col_err)?,
        conversation_id: row.get(1).map_err(col_err)?,
        from: row.get(2).map_err(col_err)?,
        subject: row.get(3).map_err(col_err)?,
        decision,
        action_taken: row.get::<String>(5).ok(),
        human_approved: row.get::<i64>(6).ok().map(|v| v != 0),
        status,
        detail: row.get(8).map_err(col_err)?,
        timestamp: parse_datetime(&timestamp),
    })
}

/// Column order matches FEEDBACK_COLUMNS.
fn row_to_feedback(row: &libsql::Row) -> Result<FeedbackRecord, DatabaseError> {
    let timestamp: String = row.get(7).map_err(col_err)?;
    Ok(FeedbackRecord {
        email_id: row.get(0).map_err(col_err)?,
        from: row.get(1).map_err(col_err)?,
        subject: row.get(2).map_err(col_err)?,
        original_draft: row.get(3).map_err(col_err)?,
        edited_draft: row.get(4).map_err(col_err)?,
        note: row.get(5).map_err(col_err)?,
        action: row.get(6).map_err(col_err)?,
        timestamp: parse_datetime(&timestamp),
    })
}

/// Column order matches CORRECTION_COLUMNS.
fn row_to_correction(row: &libsql::Row) -> Result<TriageCorrection, DatabaseError> {
    let original: String = row.get(2).map_err(col_err)?;
    let corrected: String = row.get(3).map_err(col_err)?;
    let timestamp: String = row.get(5).map_err(col_err)?;
    Ok(TriageCorrection {
        from: row.get(0).map_err(col_err)?,
        subject: row.get(1).map_err(col_err)?,
        original: parse_classification(&original)?,
        corrected: parse_classification(&corrected)?,
        reason: row.get(4).map_err(col_err)?,
        timestamp: parse_datetime(&timestamp),
    })
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<StoredCheckpoint, DatabaseError> {
    let created: String = row.get(2).map_err(col_err)?;
    Ok(StoredCheckpoint {
        conversation_id: row.get(0).map_err(col_err)?,
        payload: row.get(1).map_err(col_err)?,
        created_at: parse_datetime(&created),
    })
}

const SENDER_COLUMNS: &str =
    "address, name, relationship, tone, notes, interaction_count, triage_override, last_interaction";

const HISTORY_COLUMNS: &str = "email_id, conversation_id, sender, subject, decision, action_taken, human_approved, status, detail, timestamp";

const FEEDBACK_COLUMNS: &str =
    "email_id, sender, subject, original_draft, edited_draft, note, action, timestamp";

const CORRECTION_COLUMNS: &str = "sender, subject, original, corrected, reason, timestamp";

// ── MemoryStore ─────────────────────────────────────────────────────

#[async_trait]
impl MemoryStore for LibSqlBackend {
    async fn get_preferences(&self) -> Result<HashMap<String, Preference>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT key, value, confidence, updated_at FROM preferences", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("get_preferences: {e}")))?;

        let mut prefs = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_preferences: {e}")))?
        {
            let pref = row_to_preference(&row)?;
            prefs.insert(pref.key.clone(), pref);
        }
        Ok(prefs)
    }

    async fn get_preference(&self, key: &str) -> Result<Option<Preference>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, value, confidence, updated_at FROM preferences WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_preference: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let pref = row_to_preference(&row)?;
                Ok(Some(pref))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_preference: {e}"))),
        }
    }

    async fn set_preference(
        &self,
        key: &str,
        value: &PreferenceValue,
        confidence: f64,
    ) -> Result<(), DatabaseError> {
        let encoded = encode_preference_value(value)?;
        let confidence = confidence.clamp(0.0, 1.0);
        self.conn()
            .execute(
                "INSERT INTO preferences (key, value, confidence, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    confidence = excluded.confidence,
                    updated_at = excluded.updated_at",
                params![key, encoded, confidence, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_preference: {e}")))?;
        debug!(key, confidence, "Preference stored");
        Ok(())
    }

    async fn get_sender_context(&self, address: &str) -> Result<Option<SenderContext>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SENDER_COLUMNS} FROM sender_context WHERE address = ?1"),
                params![normalize_address(address)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_sender_context: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ctx = row_to_sender(&row)?;
                Ok(Some(ctx))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_sender_context: {e}"))),
        }
    }

    async fn upsert_sender_context(
        &self,
        address: &str,
        update: &SenderUpdate,
        note: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO sender_context
                    (address, name, relationship, tone, notes, interaction_count, triage_override, last_interaction, updated_at)
                 VALUES
                    (?1, ?2, ?3, ?4, CASE WHEN ?5 IS NULL THEN '[]' ELSE json_array(?5) END,
                     1 - ?8, ?6, CASE WHEN ?8 = 1 THEN NULL ELSE ?7 END, ?7)
                 ON CONFLICT(address) DO UPDATE SET
                    name = COALESCE(excluded.name, sender_context.name),
                    relationship = COALESCE(excluded.relationship, sender_context.relationship),
                    tone = COALESCE(excluded.tone, sender_context.tone),
                    triage_override = COALESCE(excluded.triage_override, sender_context.triage_override),
                    notes = CASE WHEN ?5 IS NULL THEN sender_context.notes
                                 ELSE json_insert(sender_context.notes, '$[#]', ?5) END,
                    interaction_count = sender_context.interaction_count + 1 - ?8,
                    last_interaction = CASE WHEN ?8 = 1 THEN sender_context.last_interaction
                                            ELSE excluded.last_interaction END,
                    updated_at = excluded.updated_at",
                params![
                    normalize_address(address),
                    opt_text(update.name.as_deref()),
                    opt_text(update.relationship.as_deref()),
                    opt_text(update.tone.as_deref()),
                    opt_text(note),
                    opt_text(update.triage_override.map(|c| c.as_str())),
                    now,
                    i64::from(update.note_only),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_sender_context: {e}")))?;
        Ok(())
    }

    async fn record_interaction(&self, record: &InteractionRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO email_history ({HISTORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    record.email_id.as_str(),
                    record.conversation_id.as_str(),
                    normalize_address(&record.from),
                    record.subject.as_str(),
                    opt_text(record.decision.map(|c| c.as_str())),
                    opt_text(record.action_taken.as_deref()),
                    opt_bool(record.human_approved),
                    record.status.as_str(),
                    record.detail.as_str(),
                    record.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_interaction: {e}")))?;
        debug!(
            email_id = %record.email_id,
            status = %record.status,
            "Interaction recorded"
        );
        Ok(())
    }

    async fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO feedback ({FEEDBACK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    record.email_id.as_str(),
                    normalize_address(&record.from),
                    record.subject.as_str(),
                    record.original_draft.as_str(),
                    record.edited_draft.as_str(),
                    record.note.as_str(),
                    record.action.as_str(),
                    record.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_feedback: {e}")))?;
        Ok(())
    }

    async fn record_triage_correction(&self, record: &TriageCorrection) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO triage_corrections ({CORRECTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    normalize_address(&record.from),
                    record.subject.as_str(),
                    record.original.as_str(),
                    record.corrected.as_str(),
                    record.reason.as_str(),
                    record.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_triage_correction: {e}")))?;
        Ok(())
    }

    async fn recent_triage_corrections(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TriageCorrection>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CORRECTION_COLUMNS} FROM triage_corrections WHERE sender = ?1 ORDER BY id DESC LIMIT ?2"
                ),
                params![normalize_address(address), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_triage_corrections: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_correction(&row)?);
        }
        Ok(out)
    }

    async fn recent_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FEEDBACK_COLUMNS} FROM feedback ORDER BY id DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_feedback: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_feedback(&row)?);
        }
        Ok(out)
    }

    async fn sender_history(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM email_history WHERE sender = ?1 ORDER BY id DESC LIMIT ?2"
                ),
                params![normalize_address(address), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sender_history: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_interaction(&row)?);
        }
        Ok(out)
    }

    async fn search_history(
        &self,
        query: &str,
        sender: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, DatabaseError> {
        let pattern = format!("%{}%", query.trim());
        let sender = sender.map(normalize_address);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM email_history
                     WHERE (subject LIKE ?1 OR detail LIKE ?1)
                       AND (?2 IS NULL OR sender = ?2)
                     ORDER BY id DESC LIMIT ?3"
                ),
                params![pattern, opt_text(sender.as_deref()), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("search_history: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_interaction(&row)?);
        }
        Ok(out)
    }
}

// ── CheckpointStore ─────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for LibSqlBackend {
    async fn save_checkpoint(&self, checkpoint: &StoredCheckpoint) -> Result<(), DatabaseError> {
        let conn = self.conn();
        // A fresh suspension supersedes any tombstone from an earlier run.
        conn.execute(
            "DELETE FROM checkpoint_resolutions WHERE conversation_id = ?1",
            params![checkpoint.conversation_id.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_checkpoint: {e}")))?;

        conn.execute(
            "INSERT INTO checkpoints (conversation_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![
                checkpoint.conversation_id.as_str(),
                checkpoint.payload.as_str(),
                checkpoint.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_checkpoint: {e}")))?;

        debug!(conversation_id = %checkpoint.conversation_id, "Checkpoint saved");
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        conversation_id: &str,
    ) -> Result<Option<StoredCheckpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT conversation_id, payload, created_at FROM checkpoints WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_checkpoint: {e}"))),
        }
    }

    async fn take_checkpoint(
        &self,
        conversation_id: &str,
        resolution: &str,
    ) -> Result<Option<StoredCheckpoint>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "DELETE FROM checkpoints WHERE conversation_id = ?1
                 RETURNING conversation_id, payload, created_at",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("take_checkpoint: {e}")))?;

        let taken = match rows.next().await {
            Ok(Some(row)) => Some(row_to_checkpoint(&row)?),
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("take_checkpoint: {e}"))),
        };
        drop(rows);

        if taken.is_some() {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoint_resolutions (conversation_id, resolution, resolved_at)
                 VALUES (?1, ?2, ?3)",
                params![conversation_id, resolution, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("take_checkpoint resolution: {e}")))?;
            debug!(conversation_id, resolution, "Checkpoint consumed");
        }
        Ok(taken)
    }

    async fn resolution(
        &self,
        conversation_id: &str,
    ) -> Result<Option<CheckpointResolution>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT conversation_id, resolution, resolved_at FROM checkpoint_resolutions WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let resolved: String = row.get(2).map_err(col_err)?;
                Ok(Some(CheckpointResolution {
                    conversation_id: row.get(0).map_err(col_err)?,
                    resolution: row.get(1).map_err(col_err)?,
                    resolved_at: parse_datetime(&resolved),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("resolution: {e}"))),
        }
    }

    async fn list_checkpoints(&self) -> Result<Vec<StoredCheckpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT conversation_id, payload, created_at FROM checkpoints ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_checkpoint(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn interaction(email_id: &str, from: &str, subject: &str, status: InteractionStatus) -> InteractionRecord {
        InteractionRecord {
            email_id: email_id.into(),
            conversation_id: format!("conv-{email_id}"),
            from: from.into(),
            subject: subject.into(),
            decision: Some(Classification::Act),
            action_taken: Some("send_email_reply".into()),
            human_approved: Some(true),
            status,
            detail: "sent".into(),
            timestamp: Utc::now(),
        }
    }

    fn checkpoint(id: &str) -> StoredCheckpoint {
        StoredCheckpoint {
            conversation_id: id.into(),
            payload: r#"{"version":1}"#.into(),
            created_at: Utc::now(),
        }
    }

    // ── Preferences ─────────────────────────────────────────────────

    #[tokio::test]
    async fn preference_round_trip() {
        let db = test_db().await;
        db.set_preference("tone", &PreferenceValue::scalar("concise"), 0.7)
            .await
            .unwrap();
        db.set_preference("avoid_words", &PreferenceValue::set(["synergy", "circle"]), 0.8)
            .await
            .unwrap();

        let prefs = db.get_preferences().await.unwrap();
        assert_eq!(prefs.len(), 2);
        assert_eq!(prefs["tone"].value.as_scalar(), Some("concise"));
        assert_eq!(
            prefs["avoid_words"].value.as_set().unwrap(),
            ["circle".to_string(), "synergy".to_string()]
        );
        assert!((prefs["tone"].confidence - 0.7).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn preference_overwrite_and_clamp() {
        let db = test_db().await;
        db.set_preference("tone", &PreferenceValue::scalar("concise"), 0.7)
            .await
            .unwrap();
        db.set_preference("tone", &PreferenceValue::scalar("formal"), 1.7)
            .await
            .unwrap();

        let pref = db.get_preference("tone").await.unwrap().unwrap();
        assert_eq!(pref.value.as_scalar(), Some("formal"));
        assert!((pref.confidence - 1.0).abs() < f64::EPSILON);
        assert!(db.get_preference("missing").await.unwrap().is_none());
    }

    // ── Sender context ──────────────────────────────────────────────

    #[tokio::test]
    async fn sender_upsert_appends_notes_and_counts() {
        let db = test_db().await;
        let update = SenderUpdate {
            name: Some("Sam".into()),
            ..Default::default()
        };
        db.upsert_sender_context("Sam@Example.com", &update, Some("first note"))
            .await
            .unwrap();
        db.upsert_sender_context(
            "sam@example.com",
            &SenderUpdate {
                tone: Some("casual".into()),
                ..Default::default()
            },
            Some("second note"),
        )
        .await
        .unwrap();
        db.upsert_sender_context("sam@example.com", &SenderUpdate::default(), None)
            .await
            .unwrap();

        let ctx = db.get_sender_context("SAM@example.com").await.unwrap().unwrap();
        assert_eq!(ctx.address, "sam@example.com");
        assert_eq!(ctx.name.as_deref(), Some("Sam"));
        assert_eq!(ctx.tone.as_deref(), Some("casual"));
        assert_eq!(ctx.interaction_count, 3);
        assert_eq!(ctx.notes, vec!["first note".to_string(), "second note".to_string()]);
        assert!(ctx.last_interaction.is_some());
        assert!(ctx.triage_override.is_none());
    }

    #[tokio::test]
    async fn sender_triage_override_is_last_write_wins() {
        let db = test_db().await;
        let set = |c| SenderUpdate {
            triage_override: Some(c),
            ..Default::default()
        };
        db.upsert_sender_context("x@y.com", &set(Classification::Ignore), None)
            .await
            .unwrap();
        db.upsert_sender_context("x@y.com", &set(Classification::Escalate), None)
            .await
            .unwrap();
        let ctx = db.get_sender_context("x@y.com").await.unwrap().unwrap();
        assert_eq!(ctx.triage_override, Some(Classification::Escalate));
    }

    #[tokio::test]
    async fn note_only_upsert_does_not_count_an_interaction() {
        let db = test_db().await;
        db.upsert_sender_context("x@y.com", &SenderUpdate::default(), None)
            .await
            .unwrap();
        let before = db.get_sender_context("x@y.com").await.unwrap().unwrap();

        let update = SenderUpdate {
            triage_override: Some(Classification::Ignore),
            note_only: true,
            ..Default::default()
        };
        db.upsert_sender_context("x@y.com", &update, Some("learned"))
            .await
            .unwrap();
        db.upsert_sender_context("new@y.com", &update, None)
            .await
            .unwrap();

        let ctx = db.get_sender_context("x@y.com").await.unwrap().unwrap();
        assert_eq!(ctx.interaction_count, 1);
        assert_eq!(ctx.last_interaction, before.last_interaction);
        assert_eq!(ctx.triage_override, Some(Classification::Ignore));
        assert_eq!(ctx.notes, vec!["learned".to_string()]);

        let fresh = db.get_sender_context("new@y.com").await.unwrap().unwrap();
        assert_eq!(fresh.interaction_count, 0);
        assert!(fresh.last_interaction.is_none());
    }

    #[tokio::test]
    async fn missing_sender_is_none() {
        let db = test_db().await;
        assert!(db.get_sender_context("nobody@nowhere").await.unwrap().is_none());
    }

    // ── History ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn interaction_history_newest_first() {
        let db = test_db().await;
        db.record_interaction(&interaction("1", "a@b.com", "Budget", InteractionStatus::Executed))
            .await
            .unwrap();
        db.record_interaction(&interaction("2", "a@b.com", "Lunch", InteractionStatus::Denied))
            .await
            .unwrap();
        db.record_interaction(&interaction("3", "c@d.com", "Other", InteractionStatus::Ignored))
            .await
            .unwrap();

        let history = db.sender_history("A@B.com", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].email_id, "2");
        assert_eq!(history[0].status, InteractionStatus::Denied);
        assert_eq!(history[1].human_approved, Some(true));
    }

    #[tokio::test]
    async fn search_history_filters_by_query_and_sender() {
        let db = test_db().await;
        db.record_interaction(&interaction("1", "a@b.com", "Budget review", InteractionStatus::Executed))
            .await
            .unwrap();
        db.record_interaction(&interaction("2", "c@d.com", "budget draft", InteractionStatus::Executed))
            .await
            .unwrap();

        assert_eq!(db.search_history("budget", None, 10).await.unwrap().len(), 2);
        let only_a = db.search_history("budget", Some("a@b.com"), 10).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].email_id, "1");
        assert!(db.search_history("holiday", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrections_and_feedback_round_trip() {
        let db = test_db().await;
        for _ in 0..3 {
            db.record_triage_correction(&TriageCorrection::new(
                "x@y.com",
                "Invoice",
                Classification::Ignore,
                Classification::Escalate,
                "billing matters",
            ))
            .await
            .unwrap();
        }
        let corrections = db.recent_triage_corrections("x@y.com", 2).await.unwrap();
        assert_eq!(corrections.len(), 2);
        assert_eq!(corrections[0].corrected, Classification::Escalate);

        db.record_feedback(&FeedbackRecord {
            email_id: "1".into(),
            from: "x@y.com".into(),
            subject: "Invoice".into(),
            original_draft: "Hi, thanks".into(),
            edited_draft: "Thanks".into(),
            note: String::new(),
            action: "send_email_reply".into(),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        let ctx = db.get_full_context("x@y.com").await.unwrap();
        assert_eq!(ctx.recent_feedback.len(), 1);
        assert_eq!(ctx.recent_corrections.len(), 3);
        assert!(ctx.sender.is_none());
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_take_is_single_use() {
        let db = test_db().await;
        db.save_checkpoint(&checkpoint("conv-1")).await.unwrap();
        assert!(db.load_checkpoint("conv-1").await.unwrap().is_some());

        let first = db.take_checkpoint("conv-1", "approve").await.unwrap();
        assert!(first.is_some());
        let second = db.take_checkpoint("conv-1", "approve").await.unwrap();
        assert!(second.is_none());

        let resolution = db.resolution("conv-1").await.unwrap().unwrap();
        assert_eq!(resolution.resolution, "approve");
        assert!(db.load_checkpoint("conv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_checkpoint_is_rejected() {
        let db = test_db().await;
        db.save_checkpoint(&checkpoint("conv-1")).await.unwrap();
        assert!(db.save_checkpoint(&checkpoint("conv-1")).await.is_err());
    }

    #[tokio::test]
    async fn new_checkpoint_clears_old_resolution() {
        let db = test_db().await;
        db.save_checkpoint(&checkpoint("conv-1")).await.unwrap();
        db.take_checkpoint("conv-1", "deny").await.unwrap();
        db.save_checkpoint(&checkpoint("conv-1")).await.unwrap();
        assert!(db.resolution("conv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_checkpoint_has_no_resolution() {
        let db = test_db().await;
        assert!(db.take_checkpoint("nope", "approve").await.unwrap().is_none());
        assert!(db.resolution("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_checkpoints_returns_all() {
        let db = test_db().await;
        db.save_checkpoint(&checkpoint("a")).await.unwrap();
        db.save_checkpoint(&checkpoint("b")).await.unwrap();
        let listed = db.list_checkpoints().await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
