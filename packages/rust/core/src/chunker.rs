//! Content chunk planning.
//!
//! Pure functions: one chunk per non-empty content field, in the fixed
//! order keywords, notes, practice, homework. Estimates drive the progress
//! display only, never correctness.

use sha2::{Digest, Sha256};

use conceptforge_shared::{ChunkKind, ChunkPlan, ContentChunk, Course};

/// Seconds of wall-clock estimate per chunk (model call + pacing delay).
const SECONDS_PER_CHUNK: u64 = 8;

/// Plan the chunks for a course. Fields that are empty after trimming
/// produce no chunk; an entirely empty course yields an empty plan, which
/// the orchestrator rejects before starting.
pub fn plan_chunks(course: &Course) -> ChunkPlan {
    let mut chunks = Vec::new();

    let keywords = course.keywords.join(", ");
    if !keywords.trim().is_empty() {
        chunks.push(make_chunk(
            ChunkKind::Keywords,
            &keywords,
            estimate_keywords(&keywords),
        ));
    }
    if !course.notes.trim().is_empty() {
        chunks.push(make_chunk(
            ChunkKind::Notes,
            &course.notes,
            estimate_prose(&course.notes),
        ));
    }
    if !course.practice.trim().is_empty() {
        chunks.push(make_chunk(
            ChunkKind::Practice,
            &course.practice,
            estimate_prose(&course.practice),
        ));
    }
    if let Some(homework) = &course.homework {
        if !homework.trim().is_empty() {
            chunks.push(make_chunk(
                ChunkKind::Homework,
                homework,
                estimate_homework(homework),
            ));
        }
    }

    let estimated_concepts = chunks.iter().map(|c| c.estimated_concepts).sum();
    let estimated_seconds = chunks.len() as u64 * SECONDS_PER_CHUNK + estimated_concepts as u64;

    ChunkPlan {
        chunks,
        estimated_concepts,
        estimated_seconds,
    }
}

fn make_chunk(kind: ChunkKind, text: &str, estimated_concepts: usize) -> ContentChunk {
    ContentChunk {
        kind,
        text: text.trim().to_string(),
        content_hash: content_hash(text.trim()),
        estimated_concepts,
        processed: false,
        concepts: Vec::new(),
        processed_at: None,
        duration_ms: None,
    }
}

/// SHA-256 hex digest of chunk text, for provenance.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{digest:x}")
}

fn word_count(text: &str) -> usize {
    text.split([',', ' ', '\n', '\t'])
        .filter(|w| !w.trim().is_empty())
        .count()
}

// Keyword lists yield roughly one concept per entry.
fn estimate_keywords(text: &str) -> usize {
    word_count(text).max(1)
}

fn estimate_prose(text: &str) -> usize {
    (word_count(text) / 40).clamp(2, 12)
}

fn estimate_homework(text: &str) -> usize {
    (word_count(text) / 40).clamp(1, 6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conceptforge_shared::CourseId;

    fn course(keywords: &[&str], notes: &str, practice: &str, homework: Option<&str>) -> Course {
        Course {
            id: CourseId::new(),
            name: "test".into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            notes: notes.into(),
            practice: practice.into(),
            homework: homework.map(String::from),
            new_words: vec![],
            last_extraction: None,
        }
    }

    #[test]
    fn keywords_only_course_plans_one_chunk() {
        let plan = plan_chunks(&course(&["kwadrans", "pół", "godzina"], "", "", None));
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].kind, ChunkKind::Keywords);
        assert_eq!(plan.chunks[0].estimated_concepts, 3);
        assert_eq!(plan.estimated_seconds, 8 + 3);
    }

    #[test]
    fn chunks_come_in_fixed_order() {
        let plan = plan_chunks(&course(
            &["kwadrans"],
            "Notes about telling time.",
            "Która jest godzina?",
            Some("Write five sentences."),
        ));
        let kinds: Vec<ChunkKind> = plan.chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChunkKind::Keywords,
                ChunkKind::Notes,
                ChunkKind::Practice,
                ChunkKind::Homework
            ]
        );
    }

    #[test]
    fn whitespace_only_fields_are_skipped() {
        let plan = plan_chunks(&course(&[], "   \n  ", "practice text here", Some("  ")));
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].kind, ChunkKind::Practice);
    }

    #[test]
    fn empty_course_plans_nothing() {
        let plan = plan_chunks(&course(&[], "", "", None));
        assert!(plan.chunks.is_empty());
        assert_eq!(plan.estimated_concepts, 0);
        assert_eq!(plan.estimated_seconds, 0);
    }

    #[test]
    fn prose_estimate_is_clamped() {
        let short = plan_chunks(&course(&[], "three words only", "", None));
        assert_eq!(short.chunks[0].estimated_concepts, 2);

        let long_text = "word ".repeat(1000);
        let long = plan_chunks(&course(&[], &long_text, "", None));
        assert_eq!(long.chunks[0].estimated_concepts, 12);
    }

    #[test]
    fn homework_estimate_is_clamped() {
        let long_text = "word ".repeat(1000);
        let plan = plan_chunks(&course(&[], "", "", Some(&long_text)));
        assert_eq!(plan.chunks[0].estimated_concepts, 6);
    }

    #[test]
    fn chunk_hash_is_stable() {
        let a = plan_chunks(&course(&["kwadrans"], "", "", None));
        let b = plan_chunks(&course(&["kwadrans"], "", "", None));
        assert_eq!(a.chunks[0].content_hash, b.chunks[0].content_hash);
        assert_eq!(a.chunks[0].content_hash.len(), 64);
    }
}
