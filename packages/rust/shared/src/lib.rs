//! Shared types, error model, and configuration for ConceptForge.
//!
//! This crate is the foundation depended on by all other ConceptForge crates.
//! It provides:
//! - [`ConceptForgeError`], the unified error type
//! - Domain types ([`Concept`], [`ExtractionSession`], [`ContentChunk`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, ExtractionConfig, LlmConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, resolve_api_key, resolve_data_dir,
};
pub use error::{ConceptForgeError, Result};
pub use types::{
    CURRENT_SCHEMA_VERSION, Category, ChunkKind, ChunkPlan, Concept, ConceptId,
    ConceptIndexEntry, ConceptProgress, ContentChunk, Course, CourseConcept, CourseId,
    Difficulty, ExtractedConcept, ExtractionProgress, ExtractionSession, MergeSuggestion,
    SessionId, SessionStats, SessionStatus, SimilarityMatch,
};
