//! libSQL storage layer for ConceptForge.
//!
//! The [`Storage`] struct wraps a local libSQL database holding courses,
//! concepts, course-concept links, learner progress, and extraction sessions.
//!
//! **Access rules:**
//! - CLI pipeline: read-write (sole writer) via [`Storage::open`]
//! - Status readers: read-only via [`Storage::open_readonly`]
//!
//! Session checkpoints are targeted single-column updates (status, progress,
//! chunks, similarity, stats each have their own UPDATE) so a crash between
//! checkpoints never loses more than one unit of work.

mod migrations;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use conceptforge_shared::{
    CURRENT_SCHEMA_VERSION, Category, Concept, ConceptForgeError, ConceptId, ConceptIndexEntry,
    ConceptProgress,
    ContentChunk, Course, CourseConcept, CourseId, Difficulty, ExtractedConcept,
    ExtractionProgress, ExtractionSession, Result, SessionId, SessionStats, SessionStatus,
    SimilarityMatch,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> ConceptForgeError {
    ConceptForgeError::Storage(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(storage_err)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(storage_err)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ConceptForgeError::Storage(format!("invalid timestamp: {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConceptForgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for status readers).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ConceptForgeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }

        let applied = self.get_schema_version().await;
        if applied != CURRENT_SCHEMA_VERSION {
            return Err(ConceptForgeError::Storage(format!(
                "schema version mismatch after migration: expected {CURRENT_SCHEMA_VERSION}, found {applied}"
            )));
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ConceptForgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Course operations
    // -----------------------------------------------------------------------

    /// Insert a new course record.
    pub async fn insert_course(&self, course: &Course) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO courses
                   (id, name, keywords_json, notes, practice, homework, new_words_json,
                    last_extraction_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    course.id.to_string(),
                    course.name.as_str(),
                    to_json(&course.keywords)?,
                    course.notes.as_str(),
                    course.practice.as_str(),
                    course.homework.as_deref(),
                    to_json(&course.new_words)?,
                    course
                        .last_extraction
                        .as_ref()
                        .map(to_json)
                        .transpose()?,
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a course by id.
    pub async fn get_course(&self, id: &CourseId) -> Result<Option<Course>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, keywords_json, notes, practice, homework, new_words_json,
                        last_extraction_json
                 FROM courses WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_course(&row)?)),
            None => Ok(None),
        }
    }

    /// List all courses, ordered by name.
    pub async fn list_courses(&self) -> Result<Vec<Course>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, keywords_json, notes, practice, homework, new_words_json,
                        last_extraction_json
                 FROM courses ORDER BY name",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_course(&row)?);
        }
        Ok(results)
    }

    /// Write the denormalized last-extraction summary onto a course record.
    pub async fn set_course_extraction_summary(
        &self,
        id: &CourseId,
        stats: &SessionStats,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE courses SET last_extraction_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_json(stats)?, now.as_str(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Concept operations
    // -----------------------------------------------------------------------

    /// Insert a new concept record.
    pub async fn insert_concept(&self, concept: &Concept) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO concepts
                   (id, name, category, description, examples_json, difficulty, confidence,
                    tags_json, created_from_json, is_active, merged_into, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    concept.id.to_string(),
                    concept.name.as_str(),
                    concept.category.as_str(),
                    concept.description.as_str(),
                    to_json(&concept.examples)?,
                    concept.difficulty.as_str(),
                    concept.confidence,
                    to_json(&concept.tags)?,
                    to_json(&concept.created_from)?,
                    concept.is_active as i64,
                    concept.merged_into.as_ref().map(|m| m.to_string()),
                    concept.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a concept by id.
    pub async fn get_concept(&self, id: &ConceptId) -> Result<Option<Concept>> {
        let mut rows = self
            .conn
            .query(
                &format!("{CONCEPT_SELECT} WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_concept(&row)?)),
            None => Ok(None),
        }
    }

    /// Overwrite an existing concept record.
    pub async fn update_concept(&self, concept: &Concept) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE concepts SET
                   name = ?1, category = ?2, description = ?3, examples_json = ?4,
                   difficulty = ?5, confidence = ?6, tags_json = ?7, created_from_json = ?8,
                   is_active = ?9, merged_into = ?10, updated_at = ?11
                 WHERE id = ?12",
                params![
                    concept.name.as_str(),
                    concept.category.as_str(),
                    concept.description.as_str(),
                    to_json(&concept.examples)?,
                    concept.difficulty.as_str(),
                    concept.confidence,
                    to_json(&concept.tags)?,
                    to_json(&concept.created_from)?,
                    concept.is_active as i64,
                    concept.merged_into.as_ref().map(|m| m.to_string()),
                    Utc::now().to_rfc3339(),
                    concept.id.to_string(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// List all active concepts.
    pub async fn list_active_concepts(&self) -> Result<Vec<Concept>> {
        let mut rows = self
            .conn
            .query(
                &format!("{CONCEPT_SELECT} WHERE is_active = 1 ORDER BY name"),
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_concept(&row)?);
        }
        Ok(results)
    }

    /// Lightweight projection of all active concepts for comparisons.
    pub async fn concept_index(&self) -> Result<Vec<ConceptIndexEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, category, description, difficulty
                 FROM concepts WHERE is_active = 1 ORDER BY name",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id: String = row.get(0).map_err(storage_err)?;
            let name: String = row.get(1).map_err(storage_err)?;
            let category: String = row.get(2).map_err(storage_err)?;
            let description: String = row.get(3).map_err(storage_err)?;
            let difficulty: String = row.get(4).map_err(storage_err)?;
            results.push(ConceptIndexEntry {
                id: id.parse().map_err(storage_err)?,
                name,
                category: Category::coerce(&category),
                description,
                difficulty: Difficulty::coerce(&difficulty),
            });
        }
        Ok(results)
    }

    /// Case-insensitive lookup of an active concept by name within a
    /// category. Returns the stored record (with its original casing) so
    /// callers can distinguish exact from case-insensitive hits.
    pub async fn find_by_name_category(
        &self,
        name: &str,
        category: Category,
    ) -> Result<Option<Concept>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{CONCEPT_SELECT}
                     WHERE is_active = 1 AND category = ?1 AND name = ?2 COLLATE NOCASE"
                ),
                params![category.as_str(), name.trim()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_concept(&row)?)),
            None => Ok(None),
        }
    }

    /// Archive a concept after a merge: clears the active flag and records
    /// the surviving concept. Never deletes.
    pub async fn archive_concept(&self, id: &ConceptId, merged_into: &ConceptId) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE concepts SET is_active = 0, merged_into = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![
                    merged_into.to_string(),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Course-concept link operations
    // -----------------------------------------------------------------------

    /// Insert or update a link (conflict on `concept_id + course_id`).
    pub async fn upsert_course_concept(&self, link: &CourseConcept) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO course_concepts
                   (concept_id, course_id, confidence, source_content, is_active, extracted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(concept_id, course_id) DO UPDATE SET
                   confidence = excluded.confidence,
                   source_content = excluded.source_content,
                   is_active = excluded.is_active,
                   extracted_at = excluded.extracted_at",
                params![
                    link.concept_id.to_string(),
                    link.course_id.to_string(),
                    link.confidence,
                    link.source_content.as_str(),
                    link.is_active as i64,
                    link.extracted_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// List active links owned by a concept.
    pub async fn list_links_by_concept(&self, id: &ConceptId) -> Result<Vec<CourseConcept>> {
        let mut rows = self
            .conn
            .query(
                "SELECT concept_id, course_id, confidence, source_content, is_active, extracted_at
                 FROM course_concepts WHERE concept_id = ?1 AND is_active = 1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_link(&row)?);
        }
        Ok(results)
    }

    /// Deactivate every link owned by a concept (after re-pointing).
    pub async fn deactivate_links(&self, id: &ConceptId) -> Result<usize> {
        self.check_writable()?;
        let n = self
            .conn
            .execute(
                "UPDATE course_concepts SET is_active = 0 WHERE concept_id = ?1 AND is_active = 1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Learner progress operations
    // -----------------------------------------------------------------------

    /// Insert or update a learner's progress row for a concept.
    pub async fn upsert_progress(&self, progress: &ConceptProgress) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO concept_progress
                   (concept_id, user_id, total_attempts, correct_attempts, streak,
                    last_reviewed, next_review, difficulty, interval_days)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(concept_id, user_id) DO UPDATE SET
                   total_attempts = excluded.total_attempts,
                   correct_attempts = excluded.correct_attempts,
                   streak = excluded.streak,
                   last_reviewed = excluded.last_reviewed,
                   next_review = excluded.next_review,
                   difficulty = excluded.difficulty,
                   interval_days = excluded.interval_days",
                params![
                    progress.concept_id.to_string(),
                    progress.user_id.as_str(),
                    progress.total_attempts as i64,
                    progress.correct_attempts as i64,
                    progress.streak as i64,
                    progress.last_reviewed.map(|t| t.to_rfc3339()),
                    progress.next_review.map(|t| t.to_rfc3339()),
                    progress.difficulty as i64,
                    progress.interval_days as i64,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get one learner's progress against a concept.
    pub async fn get_progress(
        &self,
        concept_id: &ConceptId,
        user_id: &str,
    ) -> Result<Option<ConceptProgress>> {
        let mut rows = self
            .conn
            .query(
                "SELECT concept_id, user_id, total_attempts, correct_attempts, streak,
                        last_reviewed, next_review, difficulty, interval_days
                 FROM concept_progress WHERE concept_id = ?1 AND user_id = ?2",
                params![concept_id.to_string(), user_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_progress(&row)?)),
            None => Ok(None),
        }
    }

    /// List all learner progress rows against a concept.
    pub async fn list_progress_by_concept(
        &self,
        concept_id: &ConceptId,
    ) -> Result<Vec<ConceptProgress>> {
        let mut rows = self
            .conn
            .query(
                "SELECT concept_id, user_id, total_attempts, correct_attempts, streak,
                        last_reviewed, next_review, difficulty, interval_days
                 FROM concept_progress WHERE concept_id = ?1",
                params![concept_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_progress(&row)?);
        }
        Ok(results)
    }

    /// Remove a concept's progress rows once transferred to a merge target.
    pub async fn delete_progress_for_concept(&self, concept_id: &ConceptId) -> Result<usize> {
        self.check_writable()?;
        let n = self
            .conn
            .execute(
                "DELETE FROM concept_progress WHERE concept_id = ?1",
                params![concept_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    /// Insert a new extraction session.
    pub async fn insert_session(&self, session: &ExtractionSession) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sessions
                   (id, course_id, status, chunks_json, concepts_json, similarity_json,
                    progress_json, stats_json, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    session.id.to_string(),
                    session.course_id.to_string(),
                    session.status.as_str(),
                    to_json(&session.chunks)?,
                    to_json(&session.concepts)?,
                    to_json(&session.similarity)?,
                    to_json(&session.progress)?,
                    session.stats.as_ref().map(to_json).transpose()?,
                    session.model.as_str(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a session by id.
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<ExtractionSession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, course_id, status, chunks_json, concepts_json, similarity_json,
                        progress_json, stats_json, model
                 FROM sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    /// List all sessions for a course, newest first.
    pub async fn list_sessions_by_course(
        &self,
        course_id: &CourseId,
    ) -> Result<Vec<ExtractionSession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, course_id, status, chunks_json, concepts_json, similarity_json,
                        progress_json, stats_json, model
                 FROM sessions WHERE course_id = ?1 ORDER BY created_at DESC",
                params![course_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_session(&row)?);
        }
        Ok(results)
    }

    /// Find a non-terminal session for a course, if any. This backs the
    /// at-most-one-active-session-per-course check.
    pub async fn find_active_session(&self, course_id: &CourseId) -> Result<Option<SessionId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM sessions
                 WHERE course_id = ?1
                   AND status NOT IN ('extracted', 'reviewed', 'error')
                 LIMIT 1",
                params![course_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(storage_err)?;
                Ok(Some(id.parse().map_err(storage_err)?))
            }
            None => Ok(None),
        }
    }

    /// Update a session's status.
    pub async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist the session's progress payload. Called after every unit of
    /// work; this is the resumability checkpoint.
    pub async fn update_session_progress(
        &self,
        id: &SessionId,
        progress: &ExtractionProgress,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sessions SET progress_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    to_json(progress)?,
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist the chunk list (plan or per-chunk results).
    pub async fn update_session_chunks(
        &self,
        id: &SessionId,
        chunks: &[ContentChunk],
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sessions SET chunks_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_json(&chunks)?, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist the accumulated extracted-concept list.
    pub async fn update_session_concepts(
        &self,
        id: &SessionId,
        concepts: &[ExtractedConcept],
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sessions SET concepts_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_json(&concepts)?, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist the similarity map (after every batch).
    pub async fn update_session_similarity(
        &self,
        id: &SessionId,
        similarity: &HashMap<String, Vec<SimilarityMatch>>,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sessions SET similarity_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_json(similarity)?, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist the finalize-time aggregate statistics.
    pub async fn update_session_stats(&self, id: &SessionId, stats: &SessionStats) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sessions SET stats_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![to_json(stats)?, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const CONCEPT_SELECT: &str =
    "SELECT id, name, category, description, examples_json, difficulty, confidence,
            tags_json, created_from_json, is_active, merged_into, updated_at
     FROM concepts";

fn row_to_course(row: &libsql::Row) -> Result<Course> {
    let id: String = row.get(0).map_err(storage_err)?;
    let keywords_json: String = row.get(2).map_err(storage_err)?;
    let new_words_json: String = row.get(6).map_err(storage_err)?;
    let last_extraction_json: Option<String> = row.get(7).ok();

    Ok(Course {
        id: id.parse().map_err(storage_err)?,
        name: row.get(1).map_err(storage_err)?,
        keywords: from_json(&keywords_json)?,
        notes: row.get(3).map_err(storage_err)?,
        practice: row.get(4).map_err(storage_err)?,
        homework: row.get::<String>(5).ok(),
        new_words: from_json(&new_words_json)?,
        last_extraction: last_extraction_json
            .as_deref()
            .map(from_json)
            .transpose()?,
    })
}

fn row_to_concept(row: &libsql::Row) -> Result<Concept> {
    let id: String = row.get(0).map_err(storage_err)?;
    let category: String = row.get(2).map_err(storage_err)?;
    let examples_json: String = row.get(4).map_err(storage_err)?;
    let difficulty: String = row.get(5).map_err(storage_err)?;
    let tags_json: String = row.get(7).map_err(storage_err)?;
    let created_from_json: String = row.get(8).map_err(storage_err)?;
    let is_active: i64 = row.get(9).map_err(storage_err)?;
    let merged_into: Option<String> = row.get(10).ok();
    let updated_at: String = row.get(11).map_err(storage_err)?;

    Ok(Concept {
        id: id.parse().map_err(storage_err)?,
        name: row.get(1).map_err(storage_err)?,
        category: Category::coerce(&category),
        description: row.get(3).map_err(storage_err)?,
        examples: from_json(&examples_json)?,
        difficulty: Difficulty::coerce(&difficulty),
        confidence: row.get(6).map_err(storage_err)?,
        tags: from_json(&tags_json)?,
        created_from: from_json(&created_from_json)?,
        is_active: is_active != 0,
        merged_into: merged_into
            .map(|m| m.parse().map_err(storage_err))
            .transpose()?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_link(row: &libsql::Row) -> Result<CourseConcept> {
    let concept_id: String = row.get(0).map_err(storage_err)?;
    let course_id: String = row.get(1).map_err(storage_err)?;
    let is_active: i64 = row.get(4).map_err(storage_err)?;
    let extracted_at: String = row.get(5).map_err(storage_err)?;

    Ok(CourseConcept {
        concept_id: concept_id.parse().map_err(storage_err)?,
        course_id: course_id.parse().map_err(storage_err)?,
        confidence: row.get(2).map_err(storage_err)?,
        source_content: row.get(3).map_err(storage_err)?,
        is_active: is_active != 0,
        extracted_at: parse_timestamp(&extracted_at)?,
    })
}

fn row_to_progress(row: &libsql::Row) -> Result<ConceptProgress> {
    let concept_id: String = row.get(0).map_err(storage_err)?;
    let total_attempts: i64 = row.get(2).map_err(storage_err)?;
    let correct_attempts: i64 = row.get(3).map_err(storage_err)?;
    let streak: i64 = row.get(4).map_err(storage_err)?;
    let last_reviewed: Option<String> = row.get(5).ok();
    let next_review: Option<String> = row.get(6).ok();
    let difficulty: i64 = row.get(7).map_err(storage_err)?;
    let interval_days: i64 = row.get(8).map_err(storage_err)?;

    Ok(ConceptProgress {
        concept_id: concept_id.parse().map_err(storage_err)?,
        user_id: row.get(1).map_err(storage_err)?,
        total_attempts: total_attempts as u32,
        correct_attempts: correct_attempts as u32,
        streak: streak as u32,
        last_reviewed: last_reviewed.as_deref().map(parse_timestamp).transpose()?,
        next_review: next_review.as_deref().map(parse_timestamp).transpose()?,
        difficulty: difficulty as u32,
        interval_days: interval_days as u32,
    })
}

fn row_to_session(row: &libsql::Row) -> Result<ExtractionSession> {
    let id: String = row.get(0).map_err(storage_err)?;
    let course_id: String = row.get(1).map_err(storage_err)?;
    let status_raw: String = row.get(2).map_err(storage_err)?;
    let chunks_json: String = row.get(3).map_err(storage_err)?;
    let concepts_json: String = row.get(4).map_err(storage_err)?;
    let similarity_json: String = row.get(5).map_err(storage_err)?;
    let progress_json: String = row.get(6).map_err(storage_err)?;
    let stats_json: Option<String> = row.get(7).ok();

    let status: SessionStatus = status_raw.parse()?;

    Ok(ExtractionSession {
        id: id.parse().map_err(storage_err)?,
        course_id: course_id.parse().map_err(storage_err)?,
        status,
        chunks: from_json(&chunks_json)?,
        concepts: from_json(&concepts_json)?,
        similarity: from_json(&similarity_json)?,
        progress: from_json(&progress_json)?,
        stats: stats_json.as_deref().map(from_json).transpose()?,
        model: row.get(8).map_err(storage_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conceptforge_shared::ChunkKind;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("cf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn sample_course() -> Course {
        Course {
            id: CourseId::new(),
            name: "Telling time".into(),
            keywords: vec!["kwadrans".into(), "pół".into()],
            notes: "Telling time in Polish...".into(),
            practice: "Ćwiczenie: która jest godzina?".into(),
            homework: None,
            new_words: vec!["kwadrans".into(), "pół".into()],
            last_extraction: None,
        }
    }

    fn sample_concept(name: &str, category: Category) -> Concept {
        Concept {
            id: ConceptId::new(),
            name: name.into(),
            category,
            description: format!("About {name}"),
            examples: vec![format!("{name} example")],
            difficulty: Difficulty::A2,
            confidence: 0.9,
            tags: vec!["time".into()],
            created_from: vec![],
            is_active: true,
            merged_into: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cf_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn course_crud() {
        let storage = test_storage().await;
        let course = sample_course();

        storage.insert_course(&course).await.expect("insert course");

        let found = storage
            .get_course(&course.id)
            .await
            .expect("get course")
            .expect("course exists");
        assert_eq!(found.name, "Telling time");
        assert_eq!(found.keywords.len(), 2);
        assert!(found.last_extraction.is_none());

        let stats = SessionStats {
            total_concepts: 5,
            high_confidence_count: 3,
            average_confidence: 0.82,
            processing_ms: 12_000,
            chunks_processed: 3,
        };
        storage
            .set_course_extraction_summary(&course.id, &stats)
            .await
            .expect("set summary");

        let found = storage.get_course(&course.id).await.unwrap().unwrap();
        let summary = found.last_extraction.expect("summary written");
        assert_eq!(summary.total_concepts, 5);

        let all = storage.list_courses().await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn concept_crud_and_index() {
        let storage = test_storage().await;
        let concept = sample_concept("Kwadrans", Category::Vocabulary);

        storage.insert_concept(&concept).await.expect("insert");

        let found = storage
            .get_concept(&concept.id)
            .await
            .unwrap()
            .expect("concept exists");
        assert_eq!(found.name, "Kwadrans");
        assert_eq!(found.category, Category::Vocabulary);
        assert!(found.is_active);

        let index = storage.concept_index().await.expect("index");
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].name, "Kwadrans");

        let mut updated = found.clone();
        updated.tags.push("clock".into());
        storage.update_concept(&updated).await.expect("update");
        let found = storage.get_concept(&concept.id).await.unwrap().unwrap();
        assert_eq!(found.tags.len(), 2);
    }

    #[tokio::test]
    async fn name_lookup_is_case_insensitive() {
        let storage = test_storage().await;
        let concept = sample_concept("Kwadrans", Category::Vocabulary);
        storage.insert_concept(&concept).await.unwrap();

        let hit = storage
            .find_by_name_category("kwadrans", Category::Vocabulary)
            .await
            .unwrap();
        assert!(hit.is_some());
        // Stored casing is preserved in the result
        assert_eq!(hit.unwrap().name, "Kwadrans");

        // Different category does not match
        let miss = storage
            .find_by_name_category("kwadrans", Category::Grammar)
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn archive_removes_from_index() {
        let storage = test_storage().await;
        let a = sample_concept("Locative Case", Category::Grammar);
        let b = sample_concept("Locative", Category::Grammar);
        storage.insert_concept(&a).await.unwrap();
        storage.insert_concept(&b).await.unwrap();

        storage.archive_concept(&b.id, &a.id).await.expect("archive");

        let index = storage.concept_index().await.unwrap();
        assert_eq!(index.len(), 1);

        let archived = storage.get_concept(&b.id).await.unwrap().unwrap();
        assert!(!archived.is_active);
        assert_eq!(archived.merged_into, Some(a.id.clone()));
    }

    #[tokio::test]
    async fn link_upsert_and_deactivate() {
        let storage = test_storage().await;
        let course = sample_course();
        let concept = sample_concept("Kwadrans", Category::Vocabulary);
        storage.insert_course(&course).await.unwrap();
        storage.insert_concept(&concept).await.unwrap();

        let link = CourseConcept {
            concept_id: concept.id.clone(),
            course_id: course.id.clone(),
            confidence: 0.7,
            source_content: "kwadrans, pół".into(),
            is_active: true,
            extracted_at: Utc::now(),
        };
        storage.upsert_course_concept(&link).await.expect("upsert");

        let links = storage.list_links_by_concept(&concept.id).await.unwrap();
        assert_eq!(links.len(), 1);

        // Upsert again with a higher confidence, still one row
        let bumped = CourseConcept {
            confidence: 0.9,
            ..link
        };
        storage.upsert_course_concept(&bumped).await.unwrap();
        let links = storage.list_links_by_concept(&concept.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!((links[0].confidence - 0.9).abs() < f64::EPSILON);

        let n = storage.deactivate_links(&concept.id).await.unwrap();
        assert_eq!(n, 1);
        let links = storage.list_links_by_concept(&concept.id).await.unwrap();
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn progress_upsert_and_transfer_queries() {
        let storage = test_storage().await;
        let concept = sample_concept("Kwadrans", Category::Vocabulary);
        storage.insert_concept(&concept).await.unwrap();

        let progress = ConceptProgress {
            concept_id: concept.id.clone(),
            user_id: "learner-1".into(),
            total_attempts: 4,
            correct_attempts: 3,
            streak: 2,
            last_reviewed: Some(Utc::now()),
            next_review: None,
            difficulty: 4,
            interval_days: 3,
        };
        storage.upsert_progress(&progress).await.expect("upsert");

        let found = storage
            .get_progress(&concept.id, "learner-1")
            .await
            .unwrap()
            .expect("progress exists");
        assert_eq!(found.total_attempts, 4);

        let all = storage.list_progress_by_concept(&concept.id).await.unwrap();
        assert_eq!(all.len(), 1);

        let n = storage.delete_progress_for_concept(&concept.id).await.unwrap();
        assert_eq!(n, 1);
        assert!(storage
            .get_progress(&concept.id, "learner-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn session_lifecycle_and_targeted_updates() {
        let storage = test_storage().await;
        let course = sample_course();
        storage.insert_course(&course).await.unwrap();

        let session = ExtractionSession {
            id: SessionId::new(),
            course_id: course.id.clone(),
            status: SessionStatus::Analyzing,
            chunks: vec![],
            concepts: vec![],
            similarity: HashMap::new(),
            progress: ExtractionProgress::new(3),
            stats: None,
            model: "test-model".into(),
        };
        storage.insert_session(&session).await.expect("insert");

        // Active-session check sees it
        let active = storage.find_active_session(&course.id).await.unwrap();
        assert_eq!(active, Some(session.id.clone()));

        // Targeted updates
        storage
            .update_session_status(&session.id, SessionStatus::Extracting)
            .await
            .unwrap();

        let chunks = vec![ContentChunk {
            kind: ChunkKind::Notes,
            text: "Telling time".into(),
            content_hash: "h".into(),
            estimated_concepts: 3,
            processed: true,
            concepts: vec![],
            processed_at: Some(Utc::now()),
            duration_ms: Some(40),
        }];
        storage.update_session_chunks(&session.id, &chunks).await.unwrap();

        let mut progress = session.progress.clone();
        progress.phase = SessionStatus::Extracting;
        progress.chunks_processed = 1;
        storage
            .update_session_progress(&session.id, &progress)
            .await
            .unwrap();

        let found = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(found.status, SessionStatus::Extracting);
        assert_eq!(found.chunks.len(), 1);
        assert_eq!(found.progress.chunks_processed, 1);

        // Terminal status leaves no active session
        storage
            .update_session_status(&session.id, SessionStatus::Extracted)
            .await
            .unwrap();
        let active = storage.find_active_session(&course.id).await.unwrap();
        assert!(active.is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cf_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.insert_course(&sample_course()).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.insert_course(&sample_course()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));

        // Reads still work
        let courses = ro.list_courses().await.unwrap();
        assert_eq!(courses.len(), 1);
    }
}
