//! Duplicate detection against stored concepts.
//!
//! Matching is name-based within a category: the stored lookup is
//! case-insensitive, and the detector reports whether the hit was an exact
//! or a case-only match. Category must match exactly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use conceptforge_shared::{Category, Concept, ExtractedConcept, Result};
use conceptforge_storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    CaseInsensitive,
}

/// A stored concept that collides with a candidate name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub concept: Concept,
    pub match_type: MatchType,
}

/// Per-candidate result within a batch duplicate check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub name: String,
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub has_duplicates: bool,
    pub entries: Vec<DuplicateEntry>,
    /// Candidate names that collided, in input order.
    pub duplicate_names: Vec<String>,
}

pub struct DuplicationDetector {
    storage: Arc<Storage>,
}

impl DuplicationDetector {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Look for an active stored concept with the same name (modulo case
    /// and surrounding whitespace) in the same category.
    pub async fn find_exact_duplicate(
        &self,
        name: &str,
        category: Category,
    ) -> Result<Option<DuplicateMatch>> {
        let trimmed = name.trim();
        let Some(existing) = self
            .storage
            .find_by_name_category(trimmed, category)
            .await?
        else {
            return Ok(None);
        };

        let match_type = if existing.name == trimmed {
            MatchType::Exact
        } else {
            MatchType::CaseInsensitive
        };
        Ok(Some(DuplicateMatch {
            concept: existing,
            match_type,
        }))
    }

    /// Check a batch of extracted candidates. The report keeps one entry
    /// per candidate so callers can act per concept rather than all-or-nothing.
    pub async fn check_for_duplicates(
        &self,
        candidates: &[ExtractedConcept],
    ) -> Result<DuplicateReport> {
        let mut entries = Vec::with_capacity(candidates.len());
        let mut duplicate_names = Vec::new();

        for candidate in candidates {
            let duplicate = self
                .find_exact_duplicate(&candidate.name, candidate.category)
                .await?;
            if duplicate.is_some() {
                duplicate_names.push(candidate.name.trim().to_string());
            }
            entries.push(DuplicateEntry {
                name: candidate.name.trim().to_string(),
                category: candidate.category,
                duplicate,
            });
        }

        Ok(DuplicateReport {
            has_duplicates: !duplicate_names.is_empty(),
            entries,
            duplicate_names,
        })
    }
}
