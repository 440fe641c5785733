//! Folds edit patterns and triage corrections into stored preferences.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DEFAULT_CORRECTION_WINDOW;
use crate::error::DatabaseError;
use crate::learning::patterns::{PatternSet, extract_patterns, keys};
use crate::pipeline::types::Classification;
use crate::store::model::{PreferenceValue, SenderUpdate, TriageCorrection};
use crate::store::traits::MemoryStore;

/// Confidence of a scalar preference on first (or contradicting) observation.
pub const SCALAR_INITIAL_CONFIDENCE: f64 = 0.7;
/// Confidence of a scalar preference once the same value is seen again.
pub const SCALAR_CONFIRMED_CONFIDENCE: f64 = 0.95;
/// Fixed confidence of non-empty list preferences.
pub const LIST_CONFIDENCE: f64 = 0.8;
/// Confidence of greeting / sign-off removal.
pub const REMOVAL_CONFIDENCE: f64 = 0.9;
/// Identical corrections needed before a triage override is learned.
pub const PROMOTION_THRESHOLD: usize = 3;

/// A preference written by one `learn` call, with its resulting confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    pub key: String,
    pub value: PreferenceValue,
    pub confidence: f64,
}

/// Turns human edits into durable preferences.
pub struct PatternLearner {
    store: Arc<dyn MemoryStore>,
    correction_window: usize,
    /// Serializes read-modify-write of preferences.
    write_lock: Mutex<()>,
}

impl PatternLearner {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            correction_window: DEFAULT_CORRECTION_WINDOW,
            write_lock: Mutex::new(()),
        }
    }

    /// Override how many recent corrections promotion looks at (min 3).
    pub fn with_correction_window(mut self, window: usize) -> Self {
        self.correction_window = window.max(PROMOTION_THRESHOLD);
        self
    }

    /// Diff `original` against `edited` and persist what it says.
    pub async fn learn(&self, original: &str, edited: &str) -> Result<Vec<Pattern>, DatabaseError> {
        let patterns = extract_patterns(original, edited);
        if patterns.is_empty() {
            debug!("Edit carried no style signal");
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let mut learned = Vec::new();

        for (key, value) in scalar_signals(&patterns) {
            learned.push(self.observe_scalar(key, value).await?);
        }
        if patterns.removed_greeting {
            learned.push(self.observe_flag(keys::NO_GREETINGS).await?);
        }
        if patterns.removed_sign_off {
            learned.push(self.observe_flag(keys::NO_SIGN_OFFS).await?);
        }
        for (key, items) in [
            (keys::AVOID_WORDS, &patterns.avoid_words),
            (keys::PREFER_WORDS, &patterns.prefer_words),
            (keys::AVOID_PHRASES, &patterns.avoid_phrases),
            (keys::PREFER_PHRASES, &patterns.prefer_phrases),
        ] {
            if !items.is_empty() {
                learned.push(self.observe_list(key, items).await?);
            }
        }

        info!(
            patterns = learned.len(),
            keys = ?learned.iter().map(|p| p.key.as_str()).collect::<Vec<_>>(),
            "Learned from edit"
        );
        Ok(learned)
    }

    /// Scalar rule: same value confirms (0.95), new or different value
    /// starts over at 0.7.
    async fn observe_scalar(&self, key: &str, value: &str) -> Result<Pattern, DatabaseError> {
        let existing = self.store.get_preference(key).await?;
        let confidence = match existing {
            Some(p) if p.value.as_scalar() == Some(value) => {
                p.confidence.max(SCALAR_CONFIRMED_CONFIDENCE).min(1.0)
            }
            _ => SCALAR_INITIAL_CONFIDENCE,
        };
        let value = PreferenceValue::scalar(value);
        self.store.set_preference(key, &value, confidence).await?;
        Ok(Pattern {
            key: key.to_string(),
            value,
            confidence,
        })
    }

    /// Boolean removal signals never lose confidence on repetition.
    async fn observe_flag(&self, key: &str) -> Result<Pattern, DatabaseError> {
        let existing = self.store.get_preference(key).await?;
        let confidence = match existing {
            Some(p) if p.value.as_scalar() == Some("true") => p.confidence.max(REMOVAL_CONFIDENCE),
            _ => REMOVAL_CONFIDENCE,
        };
        let value = PreferenceValue::scalar("true");
        self.store.set_preference(key, &value, confidence).await?;
        Ok(Pattern {
            key: key.to_string(),
            value,
            confidence,
        })
    }

    /// List rule: union with what is stored, fixed confidence.
    async fn observe_list(&self, key: &str, items: &[String]) -> Result<Pattern, DatabaseError> {
        let existing = self.store.get_preference(key).await?;
        let mut merged: Vec<String> = existing
            .as_ref()
            .and_then(|p| p.value.as_set())
            .map(|s| s.to_vec())
            .unwrap_or_default();
        merged.extend(items.iter().cloned());
        let value = PreferenceValue::set(merged);
        self.store.set_preference(key, &value, LIST_CONFIDENCE).await?;
        Ok(Pattern {
            key: key.to_string(),
            value,
            confidence: LIST_CONFIDENCE,
        })
    }

    /// Record a correction, then promote a sender override if the last
    /// `correction_window` corrections agree at least three times.
    ///
    /// Returns the override when this call changed it.
    pub async fn record_triage_correction(
        &self,
        correction: &TriageCorrection,
    ) -> Result<Option<Classification>, DatabaseError> {
        self.store.record_triage_correction(correction).await?;

        let recent = self
            .store
            .recent_triage_corrections(&correction.from, self.correction_window)
            .await?;
        let Some((winner, count)) = most_frequent(&recent) else {
            return Ok(None);
        };
        if count < PROMOTION_THRESHOLD {
            return Ok(None);
        }

        let current = self
            .store
            .get_sender_context(&correction.from)
            .await?
            .and_then(|c| c.triage_override);
        if current == Some(winner) {
            return Ok(None);
        }

        let update = SenderUpdate {
            triage_override: Some(winner),
            note_only: true,
            ..Default::default()
        };
        let note = format!("Auto-learned triage override from {count} corrections");
        self.store
            .upsert_sender_context(&correction.from, &update, Some(&note))
            .await?;
        info!(
            sender = %correction.from,
            override_decision = %winner,
            corrections = count,
            "Promoted triage override"
        );
        Ok(Some(winner))
    }
}

/// Scalar (key, value) pairs implied by a pattern set.
fn scalar_signals(patterns: &PatternSet) -> Vec<(&'static str, &'static str)> {
    let mut out = Vec::new();
    if let Some(length) = patterns.length {
        out.push((keys::LENGTH, length.as_str()));
    }
    if patterns.concise() {
        out.push((keys::TONE, "concise"));
    }
    if let Some(formality) = patterns.formality {
        out.push((keys::FORMALITY, formality.as_str()));
    }
    out
}

/// Most common corrected decision in `corrections` (newest first). Ties go to
/// the decision seen most recently.
fn most_frequent(corrections: &[TriageCorrection]) -> Option<(Classification, usize)> {
    let mut counts: HashMap<Classification, (usize, usize)> = HashMap::new();
    for (idx, c) in corrections.iter().enumerate() {
        let entry = counts.entry(c.corrected).or_insert((0, idx));
        entry.0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.0.cmp(&b.1.0).then(b.1.1.cmp(&a.1.1)))
        .map(|(decision, (count, _))| (decision, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn learner() -> (PatternLearner, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (PatternLearner::new(store.clone()), store)
    }

    const ORIGINAL: &str = "Hi Sam,\n\nThanks for sending the quarterly numbers over. I will review them carefully and get back to you with detailed comments by Friday afternoon.\n\nBest regards,\nAlex";
    const EDITED: &str = "Got the numbers. Comments by Friday.";

    #[tokio::test]
    async fn greeting_and_sign_off_removal_is_learned_at_point_nine() {
        let (learner, store) = learner().await;
        let learned = learner.learn(ORIGINAL, EDITED).await.unwrap();

        let find = |k: &str| learned.iter().find(|p| p.key == k).cloned().unwrap();
        assert!((find(keys::NO_GREETINGS).confidence - 0.9).abs() < f64::EPSILON);
        assert!((find(keys::NO_SIGN_OFFS).confidence - 0.9).abs() < f64::EPSILON);

        learner
            .learn("Hello Jo, the deck is attached. Cheers", "The deck is attached.")
            .await
            .unwrap();
        learner
            .learn("Dear team, notes below. Kind regards", "Notes below.")
            .await
            .unwrap();

        let prefs = store.get_preferences().await.unwrap();
        assert!(prefs[keys::NO_GREETINGS].confidence >= 0.9);
        assert!(prefs[keys::NO_SIGN_OFFS].confidence >= 0.9);
    }

    #[tokio::test]
    async fn brief_edit_sets_concise_tone_and_length() {
        let (learner, store) = learner().await;
        learner.learn(ORIGINAL, EDITED).await.unwrap();
        let prefs = store.get_preferences().await.unwrap();
        assert_eq!(prefs[keys::TONE].value.as_scalar(), Some("concise"));
        assert_eq!(prefs[keys::LENGTH].value.as_scalar(), Some("brief"));
        assert!((prefs[keys::TONE].confidence - SCALAR_INITIAL_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn repeated_scalar_raises_confidence_and_contradiction_resets() {
        let (learner, store) = learner().await;
        learner.learn("I will look", "Sure, sounds good").await.unwrap();
        let first = store.get_preference(keys::FORMALITY).await.unwrap().unwrap();
        assert_eq!(first.value.as_scalar(), Some("casual"));

        learner.learn("I will check", "Cool, got it").await.unwrap();
        let second = store.get_preference(keys::FORMALITY).await.unwrap().unwrap();
        assert!(second.confidence > first.confidence);
        assert!(second.confidence <= 1.0);

        learner.learn("ok", "Kindly see attached").await.unwrap();
        let third = store.get_preference(keys::FORMALITY).await.unwrap().unwrap();
        assert_eq!(third.value.as_scalar(), Some("formal"));
        assert!((third.confidence - SCALAR_INITIAL_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn word_lists_merge_across_edits() {
        let (learner, store) = learner().await;
        learner
            .learn("Let us leverage this", "Let us use this")
            .await
            .unwrap();
        learner
            .learn("Great synergy here", "Great overlap here")
            .await
            .unwrap();

        let avoid = store.get_preference(keys::AVOID_WORDS).await.unwrap().unwrap();
        assert_eq!(
            avoid.value.as_set().unwrap(),
            ["leverage".to_string(), "synergy".to_string()]
        );
        assert!((avoid.confidence - LIST_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn identical_drafts_learn_nothing() {
        let (learner, store) = learner().await;
        let learned = learner.learn("Same text", "Same text").await.unwrap();
        assert!(learned.is_empty());
        assert!(store.get_preferences().await.unwrap().is_empty());
    }

    fn correction(original: Classification, corrected: Classification) -> TriageCorrection {
        TriageCorrection::new("x@y.com", "Invoice", original, corrected, "test")
    }

    #[tokio::test]
    async fn three_identical_corrections_promote_override() {
        let (learner, store) = learner().await;
        let c = correction(Classification::Ignore, Classification::Escalate);

        assert_eq!(learner.record_triage_correction(&c).await.unwrap(), None);
        assert_eq!(learner.record_triage_correction(&c).await.unwrap(), None);
        assert_eq!(
            learner.record_triage_correction(&c).await.unwrap(),
            Some(Classification::Escalate)
        );

        let ctx = store.get_sender_context("x@y.com").await.unwrap().unwrap();
        assert_eq!(ctx.triage_override, Some(Classification::Escalate));
        assert!(ctx.notes.iter().any(|n| n.contains("3 corrections")));
        assert_eq!(ctx.interaction_count, 0);

        // Already promoted: a fourth correction does not rewrite it.
        assert_eq!(learner.record_triage_correction(&c).await.unwrap(), None);
    }

    #[tokio::test]
    async fn mixed_corrections_do_not_promote() {
        let (learner, store) = learner().await;
        learner
            .record_triage_correction(&correction(Classification::Ignore, Classification::Escalate))
            .await
            .unwrap();
        learner
            .record_triage_correction(&correction(Classification::Ignore, Classification::Act))
            .await
            .unwrap();
        learner
            .record_triage_correction(&correction(Classification::Act, Classification::Ignore))
            .await
            .unwrap();
        assert!(store.get_sender_context("x@y.com").await.unwrap().is_none());
    }

    #[test]
    fn most_frequent_breaks_ties_by_recency() {
        let newest_first = vec![
            correction(Classification::Ignore, Classification::Act),
            correction(Classification::Ignore, Classification::Escalate),
            correction(Classification::Ignore, Classification::Escalate),
            correction(Classification::Ignore, Classification::Act),
        ];
        assert_eq!(most_frequent(&newest_first), Some((Classification::Act, 2)));
        assert_eq!(most_frequent(&[]), None);
    }
}
