//! Core domain types for ConceptForge extraction pipelines.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for the database.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Id newtypes
// ---------------------------------------------------------------------------

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_newtype! {
    /// A UUID v7 wrapper for concept identifiers (time-sortable).
    ConceptId
}

id_newtype! {
    /// A UUID v7 wrapper for course identifiers.
    CourseId
}

id_newtype! {
    /// A UUID v7 wrapper for extraction session identifiers.
    SessionId
}

// ---------------------------------------------------------------------------
// Category & difficulty
// ---------------------------------------------------------------------------

/// Concept category. The taxonomy is fixed to these two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Grammar,
    Vocabulary,
}

impl Category {
    /// Total coercion from untrusted input. Unrecognized values fall back to
    /// `Grammar`; model output is never allowed to fail parsing here.
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "vocabulary" | "vocab" | "word" => Self::Vocabulary,
            _ => Self::Grammar,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grammar => "grammar",
            Self::Vocabulary => "vocabulary",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Six-point CEFR difficulty scale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Difficulty {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl Difficulty {
    /// Total coercion from untrusted input; defaults to `B1`.
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "A1" => Self::A1,
            "A2" => Self::A2,
            "B1" => Self::B1,
            "B2" => Self::B2,
            "C1" => Self::C1,
            "C2" => Self::C2,
            _ => Self::B1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::B1 => "B1",
            Self::B2 => "B2",
            Self::C1 => "C1",
            Self::C2 => "C2",
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Concept
// ---------------------------------------------------------------------------

/// A durable unit of learning content.
///
/// Within the active set, `(name, category)` pairs are unique
/// (case-insensitive). Concepts are never hard-deleted: a superseded concept
/// is archived (`is_active = false`) and linked forward via `merged_into`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    pub name: String,
    pub category: Category,
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    pub difficulty: Difficulty,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Originating course ids (provenance).
    #[serde(default)]
    pub created_from: Vec<CourseId>,
    pub is_active: bool,
    /// Set when this concept was archived by a merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<ConceptId>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight projection of an active concept, used for similarity
/// comparisons without loading full records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptIndexEntry {
    pub id: ConceptId,
    pub name: String,
    pub category: Category,
    pub description: String,
    pub difficulty: Difficulty,
}

// ---------------------------------------------------------------------------
// Extracted candidates
// ---------------------------------------------------------------------------

/// An ephemeral concept candidate produced by the model. Owned by the
/// extraction session until a review decision promotes or discards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedConcept {
    pub name: String,
    pub category: Category,
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Excerpt of the source content the candidate was extracted from.
    #[serde(default)]
    pub source_excerpt: String,
    pub confidence: f64,
    pub suggested_difficulty: Difficulty,
    #[serde(default)]
    pub suggested_tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// The content field a chunk was sliced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Keywords,
    Notes,
    Practice,
    Homework,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keywords => "keywords",
            Self::Notes => "notes",
            Self::Practice => "practice",
            Self::Homework => "homework",
        }
    }
}

/// A typed slice of a course's raw content, processed independently.
///
/// Immutable once processed except for the `processed`/result fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChunk {
    pub kind: ChunkKind,
    pub text: String,
    /// SHA-256 of `text`, for provenance.
    pub content_hash: String,
    pub estimated_concepts: usize,
    pub processed: bool,
    #[serde(default)]
    pub concepts: Vec<ExtractedConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Output of the content chunker: an ordered plan of chunks with estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<ContentChunk>,
    pub estimated_concepts: usize,
    pub estimated_seconds: u64,
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// A structured merge suggestion attached to a similarity match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub reason: String,
    #[serde(default)]
    pub conflicting_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_description: Option<String>,
}

/// Result of comparing one extracted concept against an existing concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub concept_id: ConceptId,
    pub concept_name: String,
    pub category: Category,
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Raw content similarity in [0, 1].
    pub similarity: f64,
    /// Merge desirability in [0, 1], scored separately from similarity.
    pub merge_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_suggestion: Option<MergeSuggestion>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Extraction session state machine.
///
/// `Analyzing → Extracting → SimilarityChecking → Extracted → Reviewed`,
/// with `Error` reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Analyzing,
    Extracting,
    SimilarityChecking,
    Extracted,
    Reviewed,
    Error,
}

impl SessionStatus {
    /// Terminal states: no further orchestrator work happens in them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Extracted | Self::Reviewed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Extracting => "extracting",
            Self::SimilarityChecking => "similarity_checking",
            Self::Extracted => "extracted",
            Self::Reviewed => "reviewed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = crate::ConceptForgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "analyzing" => Ok(Self::Analyzing),
            "extracting" => Ok(Self::Extracting),
            "similarity_checking" => Ok(Self::SimilarityChecking),
            "extracted" => Ok(Self::Extracted),
            "reviewed" => Ok(Self::Reviewed),
            "error" => Ok(Self::Error),
            other => Err(crate::ConceptForgeError::validation(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

/// Structured progress payload, persisted after every unit of work so the
/// session is resumable and observable even after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionProgress {
    pub phase: SessionStatus,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub concepts_extracted: usize,
    pub concepts_checked: usize,
    /// Human-readable description of the in-flight operation.
    pub current_operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionProgress {
    pub fn new(chunks_total: usize) -> Self {
        let now = Utc::now();
        Self {
            phase: SessionStatus::Analyzing,
            chunks_total,
            chunks_processed: 0,
            concepts_extracted: 0,
            concepts_checked: 0,
            current_operation: "Analyzing course content".into(),
            error: None,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate statistics computed when a session finalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_concepts: usize,
    /// Concepts at or above the high-confidence threshold.
    pub high_confidence_count: usize,
    pub average_confidence: f64,
    pub processing_ms: u64,
    pub chunks_processed: usize,
}

/// The unit of work for one course extraction.
///
/// At most one non-terminal session may exist per course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSession {
    pub id: SessionId,
    pub course_id: CourseId,
    pub status: SessionStatus,
    pub chunks: Vec<ContentChunk>,
    #[serde(default)]
    pub concepts: Vec<ExtractedConcept>,
    /// Similarity matches keyed by extracted-concept name.
    #[serde(default)]
    pub similarity: HashMap<String, Vec<SimilarityMatch>>,
    pub progress: ExtractionProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SessionStats>,
    /// Model identifier used for this session.
    pub model: String,
}

// ---------------------------------------------------------------------------
// Course & practice-side records
// ---------------------------------------------------------------------------

/// A readable course record: the raw material extraction runs over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub practice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homework: Option<String>,
    #[serde(default)]
    pub new_words: Vec<String>,
    /// Denormalized summary of the last completed extraction, written at
    /// finalize. Best-effort: failures here never fail the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_extraction: Option<SessionStats>,
}

/// Link between a concept and the course it was extracted from.
/// Owned by the practice subsystem; the merger re-points these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseConcept {
    pub concept_id: ConceptId,
    pub course_id: CourseId,
    pub confidence: f64,
    pub source_content: String,
    pub is_active: bool,
    pub extracted_at: DateTime<Utc>,
}

/// Per-learner spaced-repetition state for one concept.
/// Owned by the practice subsystem; the merger consolidates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptProgress {
    pub concept_id: ConceptId,
    pub user_id: String,
    pub total_attempts: u32,
    pub correct_attempts: u32,
    pub streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review: Option<DateTime<Utc>>,
    /// Scheduler difficulty, 1..=10; lower is easier.
    pub difficulty: u32,
    pub interval_days: u32,
}
