//! Concept lifecycle management.
//!
//! [`ConceptManager`] is the single write path for concepts: every create
//! goes through the duplicate gate and every write invalidates the index
//! cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use conceptforge_shared::{
    Concept, ConceptForgeError, ConceptId, ConceptIndexEntry, CourseConcept, CourseId,
    ExtractedConcept, Result,
};
use conceptforge_storage::Storage;

use crate::dedup::DuplicationDetector;
use crate::index::{Clock, ConceptIndexCache, SystemClock};
use crate::merge::{ConceptMerger, MergeOverrides, MergePreview};

/// Reviewer decision for one extracted candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptDecision {
    pub concept: ExtractedConcept,
    #[serde(flatten)]
    pub action: DecisionAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "target", rename_all = "snake_case")]
pub enum DecisionAction {
    Create,
    MergeInto(ConceptId),
    Skip,
}

/// Outcome of applying a batch of reviewed decisions. Collisions during
/// apply land in `errors` per concept; the rest of the batch still goes
/// through.
#[derive(Debug, Default, Serialize)]
pub struct ApplyReport {
    pub created: Vec<ConceptId>,
    pub merged: Vec<ConceptId>,
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub struct ConceptManager {
    storage: Arc<Storage>,
    index: ConceptIndexCache,
    detector: DuplicationDetector,
    merger: ConceptMerger,
}

impl ConceptManager {
    pub fn new(storage: Arc<Storage>, index_ttl: Duration) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock), index_ttl)
    }

    pub fn with_clock(storage: Arc<Storage>, clock: Arc<dyn Clock>, index_ttl: Duration) -> Self {
        Self {
            index: ConceptIndexCache::new(storage.clone(), clock, index_ttl),
            detector: DuplicationDetector::new(storage.clone()),
            merger: ConceptMerger::new(storage.clone()),
            storage,
        }
    }

    pub fn detector(&self) -> &DuplicationDetector {
        &self.detector
    }

    /// Cached active-concept projection for similarity checks.
    pub async fn concept_index(&self, force_refresh: bool) -> Result<Vec<ConceptIndexEntry>> {
        self.index.get(force_refresh).await
    }

    /// Insert a new concept. Fails with a validation error when an active
    /// concept with the same name (modulo case) exists in the category.
    pub async fn create_concept(&self, concept: &Concept) -> Result<()> {
        if let Some(existing) = self
            .detector
            .find_exact_duplicate(&concept.name, concept.category)
            .await?
        {
            return Err(ConceptForgeError::validation(format!(
                "concept '{}' already exists as '{}' ({})",
                concept.name, existing.concept.name, existing.concept.id
            )));
        }
        self.storage.insert_concept(concept).await?;
        self.index.invalidate().await;
        Ok(())
    }

    /// Promote an extracted candidate to a stored concept and link its
    /// source course.
    pub async fn create_from_extracted(
        &self,
        extracted: &ExtractedConcept,
        course_id: &CourseId,
    ) -> Result<Concept> {
        let concept = Concept {
            id: ConceptId::new(),
            name: extracted.name.trim().to_string(),
            category: extracted.category,
            description: extracted.description.clone(),
            examples: extracted.examples.clone(),
            difficulty: extracted.suggested_difficulty,
            confidence: extracted.confidence,
            tags: extracted.suggested_tags.clone(),
            created_from: vec![course_id.clone()],
            is_active: true,
            merged_into: None,
            updated_at: Utc::now(),
        };
        self.create_concept(&concept).await?;
        self.storage
            .upsert_course_concept(&CourseConcept {
                concept_id: concept.id.clone(),
                course_id: course_id.clone(),
                confidence: extracted.confidence,
                source_content: extracted.source_excerpt.clone(),
                is_active: true,
                extracted_at: Utc::now(),
            })
            .await?;
        Ok(concept)
    }

    pub async fn update_concept(&self, concept: &Concept) -> Result<()> {
        self.storage.update_concept(concept).await?;
        self.index.invalidate().await;
        Ok(())
    }

    pub async fn merge_concepts(
        &self,
        target_id: &ConceptId,
        source_ids: &[ConceptId],
        final_data: &MergeOverrides,
    ) -> Result<Concept> {
        let merged = self
            .merger
            .merge_existing_concepts(target_id, source_ids, final_data)
            .await?;
        self.index.invalidate().await;
        Ok(merged)
    }

    pub async fn preview_merge(
        &self,
        target_id: &ConceptId,
        source_ids: &[ConceptId],
    ) -> Result<MergePreview> {
        self.merger.preview_merge(target_id, source_ids).await
    }

    /// Apply a reviewed batch. Each decision is handled independently:
    /// collisions and other failures are recorded against the concept name
    /// and the remaining decisions still apply.
    pub async fn apply_reviewed_concepts(
        &self,
        course_id: &CourseId,
        decisions: &[ConceptDecision],
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for decision in decisions {
            match &decision.action {
                DecisionAction::Skip => report.skipped += 1,
                DecisionAction::Create => {
                    match self.create_from_extracted(&decision.concept, course_id).await {
                        Ok(concept) => report.created.push(concept.id),
                        Err(e) => report
                            .errors
                            .push(format!("{}: {e}", decision.concept.name)),
                    }
                }
                DecisionAction::MergeInto(target) => {
                    match self
                        .merger
                        .merge_extracted_into(target, &decision.concept, course_id)
                        .await
                    {
                        Ok(_) => report.merged.push(target.clone()),
                        Err(e) => report
                            .errors
                            .push(format!("{}: {e}", decision.concept.name)),
                    }
                }
            }
        }

        if !report.created.is_empty() || !report.merged.is_empty() {
            self.index.invalidate().await;
        }
        tracing::info!(
            created = report.created.len(),
            merged = report.merged.len(),
            skipped = report.skipped,
            errors = report.errors.len(),
            "applied reviewed concepts"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conceptforge_shared::{Category, Course, Difficulty};
    use uuid::Uuid;

    async fn test_manager() -> (ConceptManager, Arc<Storage>) {
        let tmp = std::env::temp_dir().join(format!("cf_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        (
            ConceptManager::new(storage.clone(), Duration::from_secs(300)),
            storage,
        )
    }

    fn extracted(name: &str, category: Category) -> ExtractedConcept {
        ExtractedConcept {
            name: name.into(),
            category,
            description: format!("About {name}"),
            examples: vec![],
            source_excerpt: "excerpt".into(),
            confidence: 0.85,
            suggested_difficulty: Difficulty::A2,
            suggested_tags: vec![],
        }
    }

    async fn test_course(storage: &Storage) -> CourseId {
        let course = Course {
            id: CourseId::new(),
            name: "unit 1".into(),
            keywords: vec![],
            notes: "n".into(),
            practice: String::new(),
            homework: None,
            new_words: vec![],
            last_extraction: None,
        };
        storage.insert_course(&course).await.unwrap();
        course.id
    }

    #[tokio::test]
    async fn create_gate_rejects_case_collisions() {
        let (manager, storage) = test_manager().await;
        let course_id = test_course(&storage).await;

        manager
            .create_from_extracted(&extracted("Kwadrans", Category::Vocabulary), &course_id)
            .await
            .unwrap();

        let err = manager
            .create_from_extracted(&extracted("kwadrans", Category::Vocabulary), &course_id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        // Same name in the other category is allowed
        manager
            .create_from_extracted(&extracted("kwadrans", Category::Grammar), &course_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_links_the_source_course() {
        let (manager, storage) = test_manager().await;
        let course_id = test_course(&storage).await;

        let concept = manager
            .create_from_extracted(&extracted("pół", Category::Vocabulary), &course_id)
            .await
            .unwrap();

        let links = storage.list_links_by_concept(&concept.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].course_id, course_id);
        assert_eq!(concept.created_from, vec![course_id]);
    }

    #[tokio::test]
    async fn writes_invalidate_the_index_cache() {
        let (manager, storage) = test_manager().await;
        let course_id = test_course(&storage).await;

        assert!(manager.concept_index(false).await.unwrap().is_empty());
        manager
            .create_from_extracted(&extracted("pół", Category::Vocabulary), &course_id)
            .await
            .unwrap();
        // Fresh read without waiting for the TTL
        assert_eq!(manager.concept_index(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_handles_mixed_decisions() {
        let (manager, storage) = test_manager().await;
        let course_id = test_course(&storage).await;

        let existing = manager
            .create_from_extracted(&extracted("Kwadrans", Category::Vocabulary), &course_id)
            .await
            .unwrap();

        let decisions = vec![
            ConceptDecision {
                concept: extracted("Godzina", Category::Vocabulary),
                action: DecisionAction::Create,
            },
            ConceptDecision {
                concept: extracted("kwadrans v2", Category::Vocabulary),
                action: DecisionAction::MergeInto(existing.id.clone()),
            },
            ConceptDecision {
                concept: extracted("noise", Category::Vocabulary),
                action: DecisionAction::Skip,
            },
        ];

        let report = manager
            .apply_reviewed_concepts(&course_id, &decisions)
            .await
            .unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.merged, vec![existing.id]);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn apply_records_collisions_without_failing_the_batch() {
        let (manager, storage) = test_manager().await;
        let course_id = test_course(&storage).await;

        manager
            .create_from_extracted(&extracted("Kwadrans", Category::Vocabulary), &course_id)
            .await
            .unwrap();

        let decisions = vec![
            ConceptDecision {
                concept: extracted("kwadrans", Category::Vocabulary),
                action: DecisionAction::Create,
            },
            ConceptDecision {
                concept: extracted("Godzina", Category::Vocabulary),
                action: DecisionAction::Create,
            },
        ];

        let report = manager
            .apply_reviewed_concepts(&course_id, &decisions)
            .await
            .unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("kwadrans"));
    }

    #[test]
    fn decision_json_shape() {
        let decision = ConceptDecision {
            concept: extracted("pół", Category::Vocabulary),
            action: DecisionAction::MergeInto(ConceptId::new()),
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["action"], "merge_into");
        assert!(json["target"].is_string());

        let skip = serde_json::to_value(&ConceptDecision {
            concept: extracted("pół", Category::Vocabulary),
            action: DecisionAction::Skip,
        })
        .unwrap();
        assert_eq!(skip["action"], "skip");
    }
}
