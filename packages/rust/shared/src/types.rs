//! Core domain types for the Examflow classification pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Well-known name for the fallback subject and topic that receive
/// unclassifiable items.
pub const UNDECIDED_NAME: &str = "UNDECIDED";

/// Sentinel topic name recorded in ledger proposals for items that produced
/// no usable prediction (image-only items, or a classifier subtopic miss).
pub const SENTINEL_TOPIC_NAME: &str = "NO_PREDICTION";

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for item identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generate a new time-sortable item identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Content segments & answer options
// ---------------------------------------------------------------------------

/// One unit of an item's body: literal text, or a reference to a media asset
/// (`content` holds the asset URL when `is_media` is set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSegment {
    pub content: String,
    pub is_media: bool,
}

impl ContentSegment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_media: false,
        }
    }

    pub fn media(url: impl Into<String>) -> Self {
        Self {
            content: url.into(),
            is_media: true,
        }
    }
}

/// A single answer choice attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    /// Stable option identifier (UUID v7 string).
    pub id: String,
    /// Option body text.
    pub content: String,
    /// Choice letter (A–E).
    pub key: char,
    /// Whether this option is the recorded correct answer.
    pub is_correct: bool,
}

impl AnswerOption {
    pub fn new(key: char, content: impl Into<String>, is_correct: bool) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            content: content.into(),
            key,
            is_correct,
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A single exam-question record undergoing classification.
///
/// The taxonomy fields (`subject_id`, `topic_id`) are mutated only by the
/// migration driver; `None` means the item routes to the Undecided bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Ordered content segments (question body).
    pub content: Vec<ContentSegment>,
    /// Ordered answer choices.
    pub answers: Vec<AnswerOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    /// Source label (exam batch / upload name).
    pub source_label: String,
    /// Exam year.
    pub year: i64,
    /// Number of recorded solve attempts against this item.
    pub attempt_count: i64,
    /// SHA-256 over the ordered text segments; dedup key within a scope.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Concatenation of all non-media segment text, newline-joined.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter(|s| !s.is_media)
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// True when the item carries no non-blank text segment.
    pub fn is_image_only(&self) -> bool {
        !self
            .content
            .iter()
            .any(|s| !s.is_media && !s.content.trim().is_empty())
    }

    /// URLs of all media segments, in order.
    pub fn media_refs(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter(|s| s.is_media)
            .map(|s| s.content.as_str())
            .collect()
    }
}

/// Compute the dedup hash for a set of content segments: SHA-256 over the
/// ordered non-media text, newline-separated.
pub fn content_hash(segments: &[ContentSegment]) -> String {
    let mut hasher = Sha256::new();
    for segment in segments.iter().filter(|s| !s.is_media) {
        hasher.update(segment.content.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// A subject — the first level of the taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    /// Display name; not unique on its own.
    pub name: String,
    /// Distinguishes subjects sharing a display name. Equals `name` for
    /// rows created by find-or-create.
    pub alternate_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
}

/// A topic — the second level, scoped to one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    pub subject_id: String,
}

// ---------------------------------------------------------------------------
// ClassificationProposal
// ---------------------------------------------------------------------------

/// One staging-ledger row: a recorded classification proposal for an item.
///
/// Append-only; its presence marks the item "already processed" for a pass.
/// Only the drift-repair pass rewrites the `new_*` target fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationProposal {
    pub id: String,
    pub item_id: ItemId,
    pub old_subject_id: Option<String>,
    pub old_subject_name: Option<String>,
    pub old_topic_id: Option<String>,
    pub old_topic_name: Option<String>,
    pub new_subject_id: String,
    pub new_subject_name: String,
    pub new_topic_id: String,
    pub new_topic_name: String,
    /// Free-text prediction rationale from the classifier.
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl ClassificationProposal {
    /// True when this proposal carries the unclassifiable sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.new_topic_name == SENTINEL_TOPIC_NAME
    }
}
