//! Core pipeline orchestration and domain logic for ConceptForge.
//!
//! This crate ties together chunk planning, model calls, duplicate
//! detection, and merging into end-to-end workflows (e.g., `start_extraction`).

pub mod chunker;
pub mod dedup;
pub mod index;
pub mod manager;
pub mod merge;
pub mod pipeline;
