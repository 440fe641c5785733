//! Edit-diff pattern extraction and the style guide derived from it.
//!
//! `extract_patterns` is pure and deterministic: the same pair of drafts
//! always yields the same `PatternSet`, with every list sorted.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::model::Preference;

/// Edited/original word-count ratio below which an edit reads as "shorter".
pub const BRIEF_RATIO: f64 = 0.6;
/// Ratio above which an edit reads as "longer". Recorded only.
pub const DETAILED_RATIO: f64 = 1.4;
/// Max vocabulary entries taken from one edit.
pub const MAX_WORDS: usize = 10;
/// Max phrase entries taken from one edit.
pub const MAX_PHRASES: usize = 5;

/// Preferences below this confidence do not shape drafts.
pub const STYLE_MIN_CONFIDENCE: f64 = 0.6;

pub mod keys {
    pub const TONE: &str = "tone";
    pub const LENGTH: &str = "length";
    pub const NO_GREETINGS: &str = "no_greetings";
    pub const NO_SIGN_OFFS: &str = "no_sign_offs";
    pub const AVOID_WORDS: &str = "avoid_words";
    pub const PREFER_WORDS: &str = "prefer_words";
    pub const AVOID_PHRASES: &str = "avoid_phrases";
    pub const PREFER_PHRASES: &str = "prefer_phrases";
    pub const FORMALITY: &str = "formality";
}

/// Salutation at the start of a line.
static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|dear|good\s+(morning|afternoon|evening))\b").unwrap()
});

/// Closing phrase that ends a line, either alone or after a sentence.
static SIGN_OFF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^|[.!?]\s+)(best(\s+(regards|wishes))?|kind\s+regards|warm\s+regards|regards|sincerely|many\s+thanks|thanks|thank\s+you|cheers)[\s,.!]*$",
    )
    .unwrap()
});

/// A sign-off may be followed by one name line.
const SIGN_OFF_TAIL_LINES: usize = 2;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").unwrap());

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "from",
    "by", "as", "is", "was", "are", "were", "be", "been", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "i", "you", "we", "they",
    "it", "this", "that", "these", "those",
];

const FORMAL_INDICATORS: &[&str] = &[
    "kindly",
    "please",
    "appreciate",
    "regarding",
    "furthermore",
    "however",
];

const CASUAL_INDICATORS: &[&str] = &["hey", "yeah", "cool", "awesome", "sure", "got it", "sounds good"];

/// Length signal of an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthShift {
    Brief,
    Detailed,
}

impl LengthShift {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Detailed => "detailed",
        }
    }
}

/// Formality direction of an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formality {
    Casual,
    Formal,
}

impl Formality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Casual => "casual",
            Self::Formal => "formal",
        }
    }
}

/// Everything one (original, edited) pair says about the user's style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSet {
    pub length_ratio: f64,
    pub length: Option<LengthShift>,
    pub removed_greeting: bool,
    pub removed_sign_off: bool,
    pub avoid_words: Vec<String>,
    pub prefer_words: Vec<String>,
    pub avoid_phrases: Vec<String>,
    pub prefer_phrases: Vec<String>,
    pub formality: Option<Formality>,
}

impl PatternSet {
    /// Whether the edit carried any signal at all.
    pub fn is_empty(&self) -> bool {
        self.length.is_none()
            && !self.removed_greeting
            && !self.removed_sign_off
            && self.avoid_words.is_empty()
            && self.prefer_words.is_empty()
            && self.avoid_phrases.is_empty()
            && self.prefer_phrases.is_empty()
            && self.formality.is_none()
    }

    /// `tone = concise` follows from a brief edit.
    pub fn concise(&self) -> bool {
        self.length == Some(LengthShift::Brief)
    }
}

/// Diff two drafts into style signals.
pub fn extract_patterns(original: &str, edited: &str) -> PatternSet {
    let orig_count = original.split_whitespace().count();
    let edit_count = edited.split_whitespace().count();
    let length_ratio = if orig_count > 0 {
        edit_count as f64 / orig_count as f64
    } else {
        1.0
    };
    let length = if length_ratio < BRIEF_RATIO {
        Some(LengthShift::Brief)
    } else if length_ratio > DETAILED_RATIO {
        Some(LengthShift::Detailed)
    } else {
        None
    };

    let removed_greeting = has_greeting(original) && !has_greeting(edited);
    let removed_sign_off = has_sign_off(original) && !has_sign_off(edited);

    let orig_tokens = tokenize(original);
    let edit_tokens = tokenize(edited);

    let orig_words: BTreeSet<&str> = orig_tokens
        .iter()
        .map(String::as_str)
        .filter(|w| !STOPWORDS.contains(w))
        .collect();
    let edit_words: BTreeSet<&str> = edit_tokens
        .iter()
        .map(String::as_str)
        .filter(|w| !STOPWORDS.contains(w))
        .collect();

    let orig_bigrams = bigrams(&orig_tokens);
    let edit_bigrams = bigrams(&edit_tokens);

    PatternSet {
        length_ratio,
        length,
        removed_greeting,
        removed_sign_off,
        avoid_words: capped_difference(&orig_words, &edit_words, MAX_WORDS),
        prefer_words: capped_difference(&edit_words, &orig_words, MAX_WORDS),
        avoid_phrases: capped_difference(&orig_bigrams, &edit_bigrams, MAX_PHRASES),
        prefer_phrases: capped_difference(&edit_bigrams, &orig_bigrams, MAX_PHRASES),
        formality: formality_shift(original, edited),
    }
}

/// Whether the first non-empty line opens with a salutation.
pub fn has_greeting(text: &str) -> bool {
    text.lines()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| GREETING.is_match(line))
}

/// Whether one of the closing lines is a sign-off.
pub fn has_sign_off(text: &str) -> bool {
    text.lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(SIGN_OFF_TAIL_LINES)
        .any(|line| SIGN_OFF.is_match(line.trim_end()))
}

fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD.find_iter(&lower).map(|m| m.as_str().to_string()).collect()
}

fn bigrams(tokens: &[String]) -> BTreeSet<String> {
    tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])).collect()
}

fn capped_difference<T>(left: &BTreeSet<T>, right: &BTreeSet<T>, cap: usize) -> Vec<String>
where
    T: Ord + AsRef<str>,
{
    left.difference(right)
        .take(cap)
        .map(|s| AsRef::<str>::as_ref(s).to_string())
        .collect()
}

fn count_indicators(text: &str, indicators: &[&str]) -> usize {
    let lower = text.to_lowercase();
    indicators.iter().filter(|w| lower.contains(*w)).count()
}

fn formality_shift(original: &str, edited: &str) -> Option<Formality> {
    let casual_gain =
        count_indicators(edited, CASUAL_INDICATORS) > count_indicators(original, CASUAL_INDICATORS);
    let formal_gain =
        count_indicators(edited, FORMAL_INDICATORS) > count_indicators(original, FORMAL_INDICATORS);
    if casual_gain {
        Some(Formality::Casual)
    } else if formal_gain {
        Some(Formality::Formal)
    } else {
        None
    }
}

// ── Style guide ─────────────────────────────────────────────────────

/// Drafting constraints derived from stored preferences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleGuide {
    pub no_greeting: bool,
    pub no_sign_off: bool,
    pub concise: bool,
    pub formality: Option<Formality>,
    pub avoid_words: Vec<String>,
    pub prefer_words: Vec<String>,
    pub avoid_phrases: Vec<String>,
    pub prefer_phrases: Vec<String>,
}

impl StyleGuide {
    /// Build from the preference map, ignoring low-confidence entries.
    pub fn from_preferences(prefs: &HashMap<String, Preference>) -> Self {
        let get = |key: &str| {
            prefs
                .get(key)
                .filter(|p| p.confidence >= STYLE_MIN_CONFIDENCE)
                .map(|p| &p.value)
        };
        let flag = |key: &str| get(key).and_then(|v| v.as_scalar()) == Some("true");
        let list = |key: &str| {
            get(key)
                .and_then(|v| v.as_set())
                .map(|s| s.to_vec())
                .unwrap_or_default()
        };

        let formality = match get(keys::FORMALITY).and_then(|v| v.as_scalar()) {
            Some("casual") => Some(Formality::Casual),
            Some("formal") => Some(Formality::Formal),
            _ => None,
        };

        Self {
            no_greeting: flag(keys::NO_GREETINGS),
            no_sign_off: flag(keys::NO_SIGN_OFFS),
            concise: get(keys::TONE).and_then(|v| v.as_scalar()) == Some("concise"),
            formality,
            avoid_words: list(keys::AVOID_WORDS),
            prefer_words: list(keys::PREFER_WORDS),
            avoid_phrases: list(keys::AVOID_PHRASES),
            prefer_phrases: list(keys::PREFER_PHRASES),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Instructions for an LLM drafter. Empty when there is nothing to say.
    pub fn instructions(&self) -> String {
        let mut lines = Vec::new();
        if self.no_greeting {
            lines.push("Do not open with a greeting.".to_string());
        }
        if self.no_sign_off {
            lines.push("Do not close with a sign-off.".to_string());
        }
        if self.concise {
            lines.push("Keep it short and to the point.".to_string());
        }
        if let Some(f) = self.formality {
            lines.push(format!("Use a {} register.", f.as_str()));
        }
        if !self.avoid_words.is_empty() {
            lines.push(format!("Avoid these words: {}.", self.avoid_words.join(", ")));
        }
        if !self.avoid_phrases.is_empty() {
            lines.push(format!("Avoid these phrases: {}.", self.avoid_phrases.join(", ")));
        }
        if !self.prefer_words.is_empty() {
            lines.push(format!("The user tends to write: {}.", self.prefer_words.join(", ")));
        }
        lines.join("\n")
    }
}
