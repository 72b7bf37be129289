//! End-to-end extraction pipeline: course → chunks → model → similarity → session.
//!
//! The session record is the source of truth. Every unit of work (chunk,
//! similarity batch) is persisted before the next one starts, so a crash
//! leaves a session that tells you exactly how far it got.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, instrument, warn};

use conceptforge_llm::ConceptModel;
use conceptforge_shared::{
    ChunkKind, ConceptForgeError, CourseId, ExtractionConfig, ExtractionProgress,
    ExtractionSession, Result, SessionId, SessionStats, SessionStatus,
};
use conceptforge_storage::Storage;

use crate::chunker;
use crate::manager::ConceptManager;

/// Minimum concepts requested from a keywords chunk.
const KEYWORDS_MIN_CONCEPTS: usize = 3;

/// Result of a completed extraction run.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub session_id: SessionId,
    pub course_id: CourseId,
    pub stats: SessionStats,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after a chunk finishes extraction.
    fn chunk_processed(&self, kind: ChunkKind, current: usize, total: usize, extracted: usize);
    /// Called after a candidate's similarity check completes.
    fn concept_checked(&self, name: &str, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, outcome: &ExtractionOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn chunk_processed(&self, _kind: ChunkKind, _current: usize, _total: usize, _extracted: usize) {
    }
    fn concept_checked(&self, _name: &str, _current: usize, _total: usize) {}
    fn done(&self, _outcome: &ExtractionOutcome) {}
}

pub struct ExtractionOrchestrator {
    storage: Arc<Storage>,
    manager: Arc<ConceptManager>,
    model: Arc<dyn ConceptModel>,
    config: ExtractionConfig,
}

impl ExtractionOrchestrator {
    pub fn new(
        storage: Arc<Storage>,
        manager: Arc<ConceptManager>,
        model: Arc<dyn ConceptModel>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            storage,
            manager,
            model,
            config,
        }
    }

    /// Run the full extraction pipeline for a course.
    ///
    /// 1. Validate the course and plan chunks
    /// 2. Extract concepts chunk by chunk
    /// 3. Score candidates against the stored concept index
    /// 4. Finalize stats and mark the session `extracted`
    ///
    /// Any phase failure is persisted onto the session (status `error`,
    /// message in progress) before the error propagates.
    #[instrument(skip_all, fields(course_id = %course_id))]
    pub async fn start_extraction(
        &self,
        course_id: &CourseId,
        progress: &dyn ProgressReporter,
    ) -> Result<ExtractionOutcome> {
        let session = self.open_session(course_id, progress).await?;
        let session_id = session.id.clone();

        match self.run_phases(session, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&session_id, &e).await;
                Err(e)
            }
        }
    }

    /// Persisted progress for a session, error message included.
    pub async fn get_session_status(&self, session_id: &SessionId) -> Result<ExtractionProgress> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| {
                ConceptForgeError::extraction(format!("no such session: {session_id}"))
            })?;
        Ok(session.progress)
    }

    // --- Phase 0: validate + plan ---
    async fn open_session(
        &self,
        course_id: &CourseId,
        progress: &dyn ProgressReporter,
    ) -> Result<ExtractionSession> {
        progress.phase("Planning chunks");

        let course = self
            .storage
            .get_course(course_id)
            .await?
            .ok_or_else(|| ConceptForgeError::extraction(format!("no such course: {course_id}")))?;

        let plan = chunker::plan_chunks(&course);
        if plan.chunks.is_empty() {
            return Err(ConceptForgeError::extraction(
                "course has no extractable content (keywords, notes, and practice are all empty)",
            ));
        }

        // Read-then-insert: the CLI is the only writer, so the window
        // between check and insert is accepted.
        if let Some(active) = self.storage.find_active_session(course_id).await? {
            return Err(ConceptForgeError::extraction(format!(
                "course already has an active extraction session ({active})"
            )));
        }

        let session = ExtractionSession {
            id: SessionId::new(),
            course_id: course_id.clone(),
            status: SessionStatus::Analyzing,
            progress: ExtractionProgress::new(plan.chunks.len()),
            chunks: plan.chunks,
            concepts: Vec::new(),
            similarity: Default::default(),
            stats: None,
            model: self.model.model_name().to_string(),
        };
        self.storage.insert_session(&session).await?;
        info!(session_id = %session.id, chunks = session.chunks.len(), "extraction session opened");
        Ok(session)
    }

    async fn run_phases(
        &self,
        mut session: ExtractionSession,
        progress: &dyn ProgressReporter,
    ) -> Result<ExtractionOutcome> {
        let start = Instant::now();

        // --- Phase 1: extract chunk by chunk ---
        progress.phase("Extracting concepts");
        self.set_phase(&mut session, SessionStatus::Extracting).await?;

        let total_chunks = session.chunks.len();
        for i in 0..total_chunks {
            let kind = session.chunks[i].kind;
            session.progress.current_operation =
                format!("extracting {} chunk {}/{}", kind.as_str(), i + 1, total_chunks);
            self.save_progress(&session).await?;

            let min_expected = match kind {
                ChunkKind::Keywords => {
                    session.chunks[i].estimated_concepts.max(KEYWORDS_MIN_CONCEPTS)
                }
                _ => session.chunks[i].estimated_concepts,
            };

            let chunk_start = Instant::now();
            let extracted = self
                .model
                .extract_concepts(kind, &session.chunks[i].text, min_expected)
                .await?;

            let chunk = &mut session.chunks[i];
            chunk.processed = true;
            chunk.processed_at = Some(Utc::now());
            chunk.duration_ms = Some(chunk_start.elapsed().as_millis() as u64);
            chunk.concepts = extracted.clone();
            session.concepts.extend(extracted);

            session.progress.chunks_processed = i + 1;
            session.progress.concepts_extracted = session.concepts.len();
            self.storage.update_session_chunks(&session.id, &session.chunks).await?;
            self.storage
                .update_session_concepts(&session.id, &session.concepts)
                .await?;
            self.save_progress(&session).await?;

            progress.chunk_processed(kind, i + 1, total_chunks, session.chunks[i].concepts.len());

            if i + 1 < total_chunks && self.config.chunk_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.chunk_delay_ms)).await;
            }
        }

        // --- Phase 2: similarity against the stored index ---
        progress.phase("Checking for similar concepts");
        self.set_phase(&mut session, SessionStatus::SimilarityChecking)
            .await?;
        self.run_similarity(&mut session, progress).await?;

        // --- Phase 3: finalize ---
        progress.phase("Finalizing");
        let stats = compute_stats(
            &session,
            self.config.high_confidence_threshold,
            start.elapsed(),
        );
        self.storage.update_session_stats(&session.id, &stats).await?;
        session.progress.current_operation = "done".into();
        session.progress.phase = SessionStatus::Extracted;
        self.save_progress(&session).await?;
        self.storage
            .update_session_status(&session.id, SessionStatus::Extracted)
            .await?;

        // Best-effort denormalized summary; the session already holds the truth
        if let Err(e) = self
            .storage
            .set_course_extraction_summary(&session.course_id, &stats)
            .await
        {
            warn!(course_id = %session.course_id, error = %e, "failed to write course summary");
        }

        let outcome = ExtractionOutcome {
            session_id: session.id.clone(),
            course_id: session.course_id.clone(),
            stats,
        };
        info!(
            session_id = %outcome.session_id,
            concepts = outcome.stats.total_concepts,
            "extraction complete"
        );
        progress.done(&outcome);
        Ok(outcome)
    }

    async fn run_similarity(
        &self,
        session: &mut ExtractionSession,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let index = self.manager.concept_index(false).await?;
        let total = session.concepts.len();

        if index.is_empty() {
            // Nothing stored yet: every candidate is trivially new
            for concept in &session.concepts {
                session.similarity.insert(concept.name.clone(), Vec::new());
            }
            session.progress.concepts_checked = total;
            session.progress.current_operation = "similarity skipped (no stored concepts)".into();
            self.storage
                .update_session_similarity(&session.id, &session.similarity)
                .await?;
            self.save_progress(session).await?;
            return Ok(());
        }

        let batch_size = self.config.batch_size.max(1);
        let candidates = session.concepts.clone();
        let batch_count = candidates.len().div_ceil(batch_size);

        for (b, batch) in candidates.chunks(batch_size).enumerate() {
            let futures: Vec<_> = batch
                .iter()
                .map(|candidate| self.model.score_similarity(candidate, &index))
                .collect();

            for (candidate, result) in batch.iter().zip(join_all(futures).await) {
                session
                    .similarity
                    .insert(candidate.name.clone(), result?);
                session.progress.concepts_checked += 1;
                progress.concept_checked(
                    &candidate.name,
                    session.progress.concepts_checked,
                    total,
                );
            }

            session.progress.current_operation =
                format!("similarity batch {}/{batch_count}", b + 1);
            self.storage
                .update_session_similarity(&session.id, &session.similarity)
                .await?;
            self.save_progress(session).await?;

            if b + 1 < batch_count && self.config.batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
        }
        Ok(())
    }

    async fn set_phase(
        &self,
        session: &mut ExtractionSession,
        status: SessionStatus,
    ) -> Result<()> {
        session.status = status;
        session.progress.phase = status;
        self.storage.update_session_status(&session.id, status).await?;
        self.save_progress(session).await
    }

    async fn save_progress(&self, session: &ExtractionSession) -> Result<()> {
        let mut progress = session.progress.clone();
        progress.updated_at = Utc::now();
        self.storage
            .update_session_progress(&session.id, &progress)
            .await
    }

    /// Leave the session inspectable: error message into progress, status
    /// to `error`. Persistence failures here are logged, not propagated,
    /// so the original error survives.
    async fn record_failure(&self, session_id: &SessionId, error: &ConceptForgeError) {
        let update = async {
            if let Some(session) = self.storage.get_session(session_id).await? {
                let mut progress = session.progress;
                progress.phase = SessionStatus::Error;
                progress.error = Some(error.to_string());
                progress.updated_at = Utc::now();
                self.storage
                    .update_session_progress(session_id, &progress)
                    .await?;
                self.storage
                    .update_session_status(session_id, SessionStatus::Error)
                    .await?;
            }
            Ok::<_, ConceptForgeError>(())
        };
        if let Err(e) = update.await {
            warn!(session_id = %session_id, error = %e, "failed to persist session failure");
        }
    }
}

fn compute_stats(
    session: &ExtractionSession,
    high_confidence_threshold: f64,
    elapsed: Duration,
) -> SessionStats {
    let total = session.concepts.len();
    let high = session
        .concepts
        .iter()
        .filter(|c| c.confidence >= high_confidence_threshold)
        .count();
    let average = if total == 0 {
        0.0
    } else {
        session.concepts.iter().map(|c| c.confidence).sum::<f64>() / total as f64
    };

    SessionStats {
        total_concepts: total,
        high_confidence_count: high,
        average_confidence: average,
        processing_ms: elapsed.as_millis() as u64,
        chunks_processed: session.chunks.iter().filter(|c| c.processed).count(),
    }
}
