//! Concept merging.
//!
//! Merges never delete. Sources are archived with a `merged_into` back-ref,
//! their course links are re-pointed to the target, and learner progress is
//! transferred per user. All aggregation is deterministic: unions keep
//! first-seen order with the target first.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use conceptforge_shared::{
    Concept, ConceptForgeError, ConceptId, ConceptProgress, CourseConcept, CourseId, Difficulty,
    ExtractedConcept, Result,
};
use conceptforge_storage::Storage;

/// Confidence floor applied to links re-pointed during a merge.
const TRANSFER_CONFIDENCE_FLOOR: f64 = 0.8;

/// Caller-supplied field overrides. Any field left `None` keeps the
/// computed aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeOverrides {
    pub name: Option<String>,
    pub description: Option<String>,
    pub examples: Option<Vec<String>>,
    pub difficulty: Option<Difficulty>,
    pub tags: Option<Vec<String>>,
}

/// Dry-run result: the record as it would be written, plus the courses and
/// learners whose data a real merge would touch.
#[derive(Debug, Clone, Serialize)]
pub struct MergePreview {
    pub merged: Concept,
    pub affected_courses: Vec<CourseId>,
    pub affected_learners: Vec<String>,
}

pub struct ConceptMerger {
    storage: Arc<Storage>,
}

impl ConceptMerger {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Compute the merged record without writing anything, together with
    /// the courses and learners the merge would affect.
    pub async fn preview_merge(
        &self,
        target_id: &ConceptId,
        source_ids: &[ConceptId],
    ) -> Result<MergePreview> {
        let (target, sources) = self.load_participants(target_id, source_ids).await?;

        let mut affected_courses: Vec<CourseId> = Vec::new();
        let mut affected_learners: Vec<String> = Vec::new();
        for source in &sources {
            for link in self.storage.list_links_by_concept(&source.id).await? {
                if !affected_courses.contains(&link.course_id) {
                    affected_courses.push(link.course_id);
                }
            }
            for row in self.storage.list_progress_by_concept(&source.id).await? {
                if !affected_learners.contains(&row.user_id) {
                    affected_learners.push(row.user_id);
                }
            }
        }

        Ok(MergePreview {
            merged: aggregate(target, &sources, &MergeOverrides::default()),
            affected_courses,
            affected_learners,
        })
    }

    /// Merge existing concepts into `target_id`. Sources are archived,
    /// their links re-pointed, and learner progress transferred.
    pub async fn merge_existing_concepts(
        &self,
        target_id: &ConceptId,
        source_ids: &[ConceptId],
        final_data: &MergeOverrides,
    ) -> Result<Concept> {
        let (target, sources) = self.load_participants(target_id, source_ids).await?;

        let merged = aggregate(target, &sources, final_data);
        self.storage.update_concept(&merged).await?;

        for source in &sources {
            self.transfer_links(source, target_id).await?;
            self.transfer_progress(&source.id, target_id).await?;
            self.storage.archive_concept(&source.id, target_id).await?;
            tracing::info!(source = %source.id, target = %target_id, "merged concept");
        }

        Ok(merged)
    }

    /// Fold a freshly extracted candidate into an existing concept and link
    /// the course it came from.
    pub async fn merge_extracted_into(
        &self,
        target_id: &ConceptId,
        extracted: &ExtractedConcept,
        course_id: &CourseId,
    ) -> Result<Concept> {
        let mut target = self.require_active(target_id).await?;

        union_into(&mut target.examples, &extracted.examples);
        union_into(&mut target.tags, &extracted.suggested_tags);
        target.confidence = target.confidence.max(extracted.confidence);
        if !target.created_from.contains(course_id) {
            target.created_from.push(course_id.clone());
        }
        if target.description.trim().is_empty() {
            target.description = extracted.description.clone();
        }
        target.updated_at = Utc::now();

        self.storage.update_concept(&target).await?;
        self.storage
            .upsert_course_concept(&CourseConcept {
                concept_id: target_id.clone(),
                course_id: course_id.clone(),
                confidence: extracted.confidence,
                source_content: extracted.source_excerpt.clone(),
                is_active: true,
                extracted_at: Utc::now(),
            })
            .await?;

        Ok(target)
    }

    async fn require_active(&self, id: &ConceptId) -> Result<Concept> {
        let concept = self
            .storage
            .get_concept(id)
            .await?
            .ok_or_else(|| ConceptForgeError::validation(format!("no such concept: {id}")))?;
        if !concept.is_active {
            return Err(ConceptForgeError::validation(format!(
                "concept {id} is archived and cannot take part in a merge"
            )));
        }
        Ok(concept)
    }

    async fn load_participants(
        &self,
        target_id: &ConceptId,
        source_ids: &[ConceptId],
    ) -> Result<(Concept, Vec<Concept>)> {
        if source_ids.is_empty() {
            return Err(ConceptForgeError::validation("no merge sources given"));
        }
        if source_ids.contains(target_id) {
            return Err(ConceptForgeError::validation(
                "merge target cannot also be a source",
            ));
        }

        let target = self.require_active(target_id).await?;
        let mut sources = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            sources.push(self.require_active(id).await?);
        }
        Ok((target, sources))
    }

    /// Re-point a source's active links to the target, floor the confidence,
    /// annotate the provenance, then deactivate the originals.
    async fn transfer_links(&self, source: &Concept, target_id: &ConceptId) -> Result<()> {
        let existing_target: Vec<CourseConcept> =
            self.storage.list_links_by_concept(target_id).await?;

        for link in self.storage.list_links_by_concept(&source.id).await? {
            let prior = existing_target
                .iter()
                .find(|l| l.course_id == link.course_id)
                .map(|l| l.confidence)
                .unwrap_or(0.0);
            let confidence = link
                .confidence
                .max(TRANSFER_CONFIDENCE_FLOOR)
                .max(prior);

            self.storage
                .upsert_course_concept(&CourseConcept {
                    concept_id: target_id.clone(),
                    course_id: link.course_id.clone(),
                    confidence,
                    source_content: format!(
                        "[merged from {}] {}",
                        source.name, link.source_content
                    ),
                    is_active: true,
                    extracted_at: link.extracted_at,
                })
                .await?;
        }

        self.storage.deactivate_links(&source.id).await?;
        Ok(())
    }

    /// Fold each learner's progress on the source into their progress on
    /// the target, then remove the source rows.
    async fn transfer_progress(&self, source_id: &ConceptId, target_id: &ConceptId) -> Result<()> {
        for source_row in self.storage.list_progress_by_concept(source_id).await? {
            let merged = match self
                .storage
                .get_progress(target_id, &source_row.user_id)
                .await?
            {
                Some(target_row) => combine_progress(&target_row, &source_row),
                None => ConceptProgress {
                    concept_id: target_id.clone(),
                    ..source_row.clone()
                },
            };
            self.storage.upsert_progress(&merged).await?;
        }
        self.storage.delete_progress_for_concept(source_id).await?;
        Ok(())
    }
}

/// Progress arithmetic: attempts sum, streak keeps the best, the review is
/// due at the earlier date, difficulty keeps the easier rating, interval
/// keeps the longer one.
fn combine_progress(target: &ConceptProgress, source: &ConceptProgress) -> ConceptProgress {
    ConceptProgress {
        concept_id: target.concept_id.clone(),
        user_id: target.user_id.clone(),
        total_attempts: target.total_attempts + source.total_attempts,
        correct_attempts: target.correct_attempts + source.correct_attempts,
        streak: target.streak.max(source.streak),
        last_reviewed: max_option(target.last_reviewed, source.last_reviewed),
        next_review: min_option(target.next_review, source.next_review),
        difficulty: target.difficulty.min(source.difficulty),
        interval_days: target.interval_days.max(source.interval_days),
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn union_into(into: &mut Vec<String>, from: &[String]) {
    for item in from {
        let trimmed = item.trim();
        if !trimmed.is_empty() && !into.iter().any(|e| e == trimmed) {
            into.push(trimmed.to_string());
        }
    }
}

fn aggregate(mut target: Concept, sources: &[Concept], overrides: &MergeOverrides) -> Concept {
    for source in sources {
        union_into(&mut target.examples, &source.examples);
        union_into(&mut target.tags, &source.tags);
        target.confidence = target.confidence.max(source.confidence);
        for course in &source.created_from {
            if !target.created_from.contains(course) {
                target.created_from.push(course.clone());
            }
        }
        if source.description.trim() != target.description.trim()
            && !source.description.trim().is_empty()
        {
            target.description =
                format!("{} [merged] {}", target.description, source.description);
        }
    }

    if let Some(name) = &overrides.name {
        target.name = name.clone();
    }
    if let Some(description) = &overrides.description {
        target.description = description.clone();
    }
    if let Some(examples) = &overrides.examples {
        target.examples = examples.clone();
    }
    if let Some(difficulty) = overrides.difficulty {
        target.difficulty = difficulty;
    }
    if let Some(tags) = &overrides.tags {
        target.tags = tags.clone();
    }

    target.updated_at = Utc::now();
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use conceptforge_shared::{Category, Course};
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("cf_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn concept(name: &str, examples: &[&str], confidence: f64) -> Concept {
        Concept {
            id: ConceptId::new(),
            name: name.into(),
            category: Category::Grammar,
            description: format!("About {name}"),
            examples: examples.iter().map(|s| s.to_string()).collect(),
            difficulty: Difficulty::A2,
            confidence,
            tags: vec![],
            created_from: vec![],
            is_active: true,
            merged_into: None,
            updated_at: Utc::now(),
        }
    }

    fn course(name: &str) -> Course {
        Course {
            id: CourseId::new(),
            name: name.into(),
            keywords: vec![],
            notes: "n".into(),
            practice: String::new(),
            homework: None,
            new_words: vec![],
            last_extraction: None,
        }
    }

    #[tokio::test]
    async fn merge_unions_examples_and_takes_max_confidence() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &["w domu", "w szkole"], 0.7);
        let source = concept("Locative", &["w szkole", "o kocie"], 0.9);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();

        let merger = ConceptMerger::new(storage.clone());
        let merged = merger
            .merge_existing_concepts(&target.id, &[source.id.clone()], &MergeOverrides::default())
            .await
            .unwrap();

        assert_eq!(merged.examples, vec!["w domu", "w szkole", "o kocie"]);
        assert_eq!(merged.confidence, 0.9);
        assert!(merged.description.contains("[merged]"));

        let archived = storage.get_concept(&source.id).await.unwrap().unwrap();
        assert!(!archived.is_active);
        assert_eq!(archived.merged_into, Some(target.id.clone()));
    }

    #[tokio::test]
    async fn final_data_overrides_win_field_by_field() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &["a"], 0.7);
        let source = concept("Locative", &["b"], 0.9);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();

        let overrides = MergeOverrides {
            description: Some("The locative case, unified.".into()),
            ..Default::default()
        };
        let merged = ConceptMerger::new(storage)
            .merge_existing_concepts(&target.id, &[source.id], &overrides)
            .await
            .unwrap();

        assert_eq!(merged.description, "The locative case, unified.");
        // Non-overridden fields keep the aggregation
        assert_eq!(merged.examples, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn links_are_repointed_with_confidence_floor() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &[], 0.7);
        let source = concept("Locative", &[], 0.9);
        let c = course("unit 3");
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();
        storage.insert_course(&c).await.unwrap();
        storage
            .upsert_course_concept(&CourseConcept {
                concept_id: source.id.clone(),
                course_id: c.id.clone(),
                confidence: 0.5,
                source_content: "w domu".into(),
                is_active: true,
                extracted_at: Utc::now(),
            })
            .await
            .unwrap();

        ConceptMerger::new(storage.clone())
            .merge_existing_concepts(&target.id, &[source.id.clone()], &MergeOverrides::default())
            .await
            .unwrap();

        let target_links = storage.list_links_by_concept(&target.id).await.unwrap();
        assert_eq!(target_links.len(), 1);
        assert_eq!(target_links[0].confidence, 0.8);
        assert!(target_links[0].source_content.contains("[merged from Locative]"));

        // No active links remain on the source
        assert!(storage
            .list_links_by_concept(&source.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn progress_arithmetic_per_learner() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &[], 0.7);
        let source = concept("Locative", &[], 0.9);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();

        let soon = Utc::now() + ChronoDuration::days(1);
        let later = Utc::now() + ChronoDuration::days(7);
        storage
            .upsert_progress(&ConceptProgress {
                concept_id: target.id.clone(),
                user_id: "learner-1".into(),
                total_attempts: 5,
                correct_attempts: 4,
                streak: 2,
                last_reviewed: None,
                next_review: Some(later),
                difficulty: 6,
                interval_days: 2,
            })
            .await
            .unwrap();
        storage
            .upsert_progress(&ConceptProgress {
                concept_id: source.id.clone(),
                user_id: "learner-1".into(),
                total_attempts: 3,
                correct_attempts: 1,
                streak: 5,
                last_reviewed: None,
                next_review: Some(soon),
                difficulty: 4,
                interval_days: 8,
            })
            .await
            .unwrap();

        ConceptMerger::new(storage.clone())
            .merge_existing_concepts(&target.id, &[source.id.clone()], &MergeOverrides::default())
            .await
            .unwrap();

        let merged = storage
            .get_progress(&target.id, "learner-1")
            .await
            .unwrap()
            .expect("progress on target");
        assert_eq!(merged.total_attempts, 8);
        assert_eq!(merged.correct_attempts, 5);
        assert_eq!(merged.streak, 5);
        assert_eq!(merged.difficulty, 4);
        assert_eq!(merged.interval_days, 8);
        // Due at the earlier of the two dates
        assert!(merged.next_review.unwrap() < later);

        // Source rows are gone
        assert!(storage
            .list_progress_by_concept(&source.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn progress_is_copied_when_target_has_none() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &[], 0.7);
        let source = concept("Locative", &[], 0.9);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();
        storage
            .upsert_progress(&ConceptProgress {
                concept_id: source.id.clone(),
                user_id: "learner-2".into(),
                total_attempts: 7,
                correct_attempts: 6,
                streak: 3,
                last_reviewed: Some(Utc::now()),
                next_review: None,
                difficulty: 5,
                interval_days: 4,
            })
            .await
            .unwrap();

        ConceptMerger::new(storage.clone())
            .merge_existing_concepts(&target.id, &[source.id], &MergeOverrides::default())
            .await
            .unwrap();

        let copied = storage
            .get_progress(&target.id, "learner-2")
            .await
            .unwrap()
            .expect("copied progress");
        assert_eq!(copied.total_attempts, 7);
        assert_eq!(copied.streak, 3);
    }

    #[tokio::test]
    async fn merge_extracted_folds_into_target_and_links_course() {
        let storage = test_storage().await;
        let target = concept("Kwadrans", &["kwadrans po trzeciej"], 0.6);
        let c = course("telling time");
        storage.insert_concept(&target).await.unwrap();
        storage.insert_course(&c).await.unwrap();

        let extracted = ExtractedConcept {
            name: "kwadrans".into(),
            category: Category::Vocabulary,
            description: "A quarter of an hour.".into(),
            examples: vec!["za kwadrans ósma".into()],
            source_excerpt: "kwadrans, pół".into(),
            confidence: 0.95,
            suggested_difficulty: Difficulty::A2,
            suggested_tags: vec!["time".into()],
        };

        let merged = ConceptMerger::new(storage.clone())
            .merge_extracted_into(&target.id, &extracted, &c.id)
            .await
            .unwrap();

        assert_eq!(
            merged.examples,
            vec!["kwadrans po trzeciej", "za kwadrans ósma"]
        );
        assert_eq!(merged.confidence, 0.95);
        assert!(merged.created_from.contains(&c.id));
        assert!(merged.tags.contains(&"time".to_string()));

        let links = storage.list_links_by_concept(&target.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].course_id, c.id);
    }

    #[tokio::test]
    async fn target_cannot_be_its_own_source() {
        let storage = test_storage().await;
        let target = concept("Kwadrans", &[], 0.6);
        storage.insert_concept(&target).await.unwrap();

        let err = ConceptMerger::new(storage)
            .merge_existing_concepts(&target.id, &[target.id.clone()], &MergeOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("source"));
    }

    #[tokio::test]
    async fn archived_concepts_are_rejected() {
        let storage = test_storage().await;
        let target = concept("Kwadrans", &[], 0.6);
        let gone = concept("Old", &[], 0.5);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&gone).await.unwrap();
        storage.archive_concept(&gone.id, &target.id).await.unwrap();

        let err = ConceptMerger::new(storage)
            .merge_existing_concepts(&target.id, &[gone.id], &MergeOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("archived"));
    }

    #[tokio::test]
    async fn preview_writes_nothing() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &["a"], 0.7);
        let source = concept("Locative", &["b"], 0.9);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();

        let preview = ConceptMerger::new(storage.clone())
            .preview_merge(&target.id, &[source.id.clone()])
            .await
            .unwrap();
        assert_eq!(preview.merged.examples, vec!["a", "b"]);

        // Nothing changed on disk
        let stored_source = storage.get_concept(&source.id).await.unwrap().unwrap();
        assert!(stored_source.is_active);
        let stored_target = storage.get_concept(&target.id).await.unwrap().unwrap();
        assert_eq!(stored_target.examples, vec!["a"]);
    }

    #[tokio::test]
    async fn preview_reports_affected_courses_and_learners() {
        let storage = test_storage().await;
        let target = concept("Locative Case", &[], 0.7);
        let source = concept("Locative", &[], 0.9);
        storage.insert_concept(&target).await.unwrap();
        storage.insert_concept(&source).await.unwrap();

        let c1 = course("Lesson 4");
        let c2 = course("Lesson 9");
        storage.insert_course(&c1).await.unwrap();
        storage.insert_course(&c2).await.unwrap();
        for course in [&c1, &c2] {
            storage
                .upsert_course_concept(&CourseConcept {
                    concept_id: source.id.clone(),
                    course_id: course.id.clone(),
                    confidence: 0.6,
                    source_content: "w parku".into(),
                    is_active: true,
                    extracted_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        for user in ["learner-1", "learner-2"] {
            storage
                .upsert_progress(&ConceptProgress {
                    concept_id: source.id.clone(),
                    user_id: user.into(),
                    total_attempts: 1,
                    correct_attempts: 1,
                    streak: 1,
                    last_reviewed: None,
                    next_review: None,
                    difficulty: 5,
                    interval_days: 1,
                })
                .await
                .unwrap();
        }

        let preview = ConceptMerger::new(storage.clone())
            .preview_merge(&target.id, &[source.id.clone()])
            .await
            .unwrap();
        assert_eq!(preview.affected_courses.len(), 2);
        assert!(preview.affected_courses.contains(&c1.id));
        assert!(preview.affected_courses.contains(&c2.id));
        let mut learners = preview.affected_learners.clone();
        learners.sort();
        assert_eq!(learners, vec!["learner-1", "learner-2"]);

        // Still a dry run
        assert!(storage.get_concept(&source.id).await.unwrap().unwrap().is_active);
    }
}
