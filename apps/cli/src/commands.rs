//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use conceptforge_core::manager::{ConceptDecision, ConceptManager};
use conceptforge_core::merge::MergeOverrides;
use conceptforge_core::pipeline::{
    ExtractionOrchestrator, ExtractionOutcome, ProgressReporter,
};
use conceptforge_llm::LlmGateway;
use conceptforge_shared::{
    AppConfig, ChunkKind, Course, CourseId, ExtractedConcept, SessionStatus, config_file_path,
    init_config, load_config, resolve_api_key, resolve_data_dir,
};
use conceptforge_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ConceptForge: extract and deduplicate learning concepts from courses.
#[derive(Parser)]
#[command(
    name = "conceptforge",
    version,
    about = "Extract, deduplicate, and merge learning concepts from course material.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Course management.
    Course {
        #[command(subcommand)]
        action: CourseAction,
    },

    /// Run the extraction pipeline for a course.
    Extract {
        /// Course ID to extract from.
        course_id: String,
    },

    /// Show the persisted progress of an extraction session.
    Status {
        /// Session ID.
        session_id: String,
    },

    /// Concept management.
    Concepts {
        #[command(subcommand)]
        action: ConceptsAction,
    },

    /// Check a JSON array of extracted concepts against stored concepts.
    Duplicates {
        /// Path to a JSON file with extracted concepts.
        #[arg(long)]
        file: PathBuf,
    },

    /// Apply reviewed extraction decisions.
    Apply {
        /// Course the decisions belong to.
        #[arg(long)]
        course: String,

        /// Path to a JSON file with reviewed decisions.
        #[arg(long)]
        decisions: PathBuf,

        /// Session to mark as reviewed once the decisions are applied.
        #[arg(long)]
        session: Option<String>,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Course subcommands.
#[derive(Subcommand)]
pub(crate) enum CourseAction {
    /// Register a course in the local database.
    Add {
        /// Course name.
        name: String,

        /// Comma-separated keyword list.
        #[arg(long, default_value = "")]
        keywords: String,

        /// File with the lesson notes.
        #[arg(long)]
        notes_file: Option<PathBuf>,

        /// File with practice exercises.
        #[arg(long)]
        practice_file: Option<PathBuf>,

        /// File with the homework assignment.
        #[arg(long)]
        homework_file: Option<PathBuf>,

        /// Comma-separated list of new words.
        #[arg(long, default_value = "")]
        new_words: String,
    },
    /// List registered courses.
    List,
}

/// Concept subcommands.
#[derive(Subcommand)]
pub(crate) enum ConceptsAction {
    /// List active concepts.
    List,
    /// Merge source concepts into a target.
    Merge {
        /// Surviving concept.
        #[arg(long)]
        target: String,

        /// Concepts to merge into the target.
        sources: Vec<String>,

        /// Override the merged name.
        #[arg(long)]
        name: Option<String>,

        /// Override the merged description.
        #[arg(long)]
        description: Option<String>,

        /// Show the merged record and affected courses/learners without
        /// writing anything.
        #[arg(long)]
        preview: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "conceptforge=info",
        1 => "conceptforge=debug",
        _ => "conceptforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Course { action } => match action {
            CourseAction::Add {
                name,
                keywords,
                notes_file,
                practice_file,
                homework_file,
                new_words,
            } => {
                cmd_course_add(
                    &name,
                    &keywords,
                    notes_file.as_deref(),
                    practice_file.as_deref(),
                    homework_file.as_deref(),
                    &new_words,
                )
                .await
            }
            CourseAction::List => cmd_course_list().await,
        },
        Command::Extract { course_id } => cmd_extract(&course_id).await,
        Command::Status { session_id } => cmd_status(&session_id).await,
        Command::Concepts { action } => match action {
            ConceptsAction::List => cmd_concepts_list().await,
            ConceptsAction::Merge {
                target,
                sources,
                name,
                description,
                preview,
            } => cmd_concepts_merge(&target, &sources, name, description, preview).await,
        },
        Command::Duplicates { file } => cmd_duplicates(&file).await,
        Command::Apply {
            course,
            decisions,
            session,
        } => cmd_apply(&course, &decisions, session.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(resolve_data_dir(config)?.join("conceptforge.db"))
}

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    Ok(Arc::new(Storage::open(&db_path(config)?).await?))
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Arc<Storage>> {
    Ok(Arc::new(Storage::open_readonly(&db_path(config)?).await?))
}

fn manager_for(config: &AppConfig, storage: Arc<Storage>) -> ConceptManager {
    ConceptManager::new(
        storage,
        Duration::from_secs(config.extraction.index_ttl_secs),
    )
}

fn read_file(path: Option<&Path>, what: &str) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| eyre!("cannot read {what} file '{}': {e}", p.display())),
        None => Ok(String::new()),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn format_id_list(items: impl Iterator<Item = String>) -> String {
    let list: Vec<String> = items.collect();
    if list.is_empty() {
        "none".to_string()
    } else {
        list.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_course_add(
    name: &str,
    keywords: &str,
    notes_file: Option<&Path>,
    practice_file: Option<&Path>,
    homework_file: Option<&Path>,
    new_words: &str,
) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    let homework = match homework_file {
        Some(p) => Some(read_file(Some(p), "homework")?),
        None => None,
    };
    let course = Course {
        id: CourseId::new(),
        name: name.to_string(),
        keywords: split_list(keywords),
        notes: read_file(notes_file, "notes")?,
        practice: read_file(practice_file, "practice")?,
        homework,
        new_words: split_list(new_words),
        last_extraction: None,
    };
    storage.insert_course(&course).await?;

    info!(course_id = %course.id, name, "course registered");
    println!("Course registered: {}", course.id);
    Ok(())
}

async fn cmd_course_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;

    let courses = storage.list_courses().await?;
    if courses.is_empty() {
        println!("No courses registered yet. Use `conceptforge course add`.");
        return Ok(());
    }
    for course in courses {
        let extracted = course
            .last_extraction
            .map(|s| format!("{} concepts", s.total_concepts))
            .unwrap_or_else(|| "never extracted".into());
        println!("{}  {}  ({extracted})", course.id, course.name);
    }
    Ok(())
}

async fn cmd_extract(course_id: &str) -> Result<()> {
    let config = load_config()?;
    let api_key = resolve_api_key(&config)?;
    let course_id: CourseId = course_id
        .parse()
        .map_err(|e| eyre!("invalid course id: {e}"))?;

    let storage = open_storage(&config).await?;
    let manager = Arc::new(manager_for(&config, storage.clone()));
    let gateway = Arc::new(LlmGateway::new(&config.llm, api_key)?);
    let orchestrator = ExtractionOrchestrator::new(
        storage,
        manager,
        gateway,
        config.extraction.clone(),
    );

    let reporter = CliProgress::new();
    let outcome = orchestrator.start_extraction(&course_id, &reporter).await?;

    println!();
    println!("  Extraction complete!");
    println!("  Session:         {}", outcome.session_id);
    println!("  Concepts:        {}", outcome.stats.total_concepts);
    println!(
        "  High confidence: {} (>= {:.1})",
        outcome.stats.high_confidence_count, config.extraction.high_confidence_threshold
    );
    println!(
        "  Avg confidence:  {:.2}",
        outcome.stats.average_confidence
    );
    println!("  Chunks:          {}", outcome.stats.chunks_processed);
    println!(
        "  Time:            {:.1}s",
        outcome.stats.processing_ms as f64 / 1000.0
    );
    println!();
    println!("Review the session, then apply decisions with `conceptforge apply`.");
    Ok(())
}

async fn cmd_status(session_id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;

    let session_id = session_id
        .parse()
        .map_err(|e| eyre!("invalid session id: {e}"))?;
    let session = storage
        .get_session(&session_id)
        .await?
        .ok_or_else(|| eyre!("no such session: {session_id}"))?;

    let p = &session.progress;
    println!("Session {session_id}");
    println!("  Course:    {}", session.course_id);
    println!("  Status:    {}", session.status);
    println!("  Chunks:    {}/{}", p.chunks_processed, p.chunks_total);
    println!("  Extracted: {}", p.concepts_extracted);
    println!("  Checked:   {}", p.concepts_checked);
    println!("  Doing:     {}", p.current_operation);
    if let Some(error) = &p.error {
        println!("  Error:     {error}");
    }
    if let Some(stats) = &session.stats {
        println!(
            "  Result:    {} concepts, {} high confidence",
            stats.total_concepts, stats.high_confidence_count
        );
    }
    Ok(())
}

async fn cmd_concepts_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;

    let concepts = storage.list_active_concepts().await?;
    if concepts.is_empty() {
        println!("No concepts stored yet.");
        return Ok(());
    }
    for concept in concepts {
        println!(
            "{}  [{}|{}]  {}  ({:.2})",
            concept.id,
            concept.category.as_str(),
            concept.difficulty.as_str(),
            concept.name,
            concept.confidence
        );
    }
    Ok(())
}

async fn cmd_concepts_merge(
    target: &str,
    sources: &[String],
    name: Option<String>,
    description: Option<String>,
    preview: bool,
) -> Result<()> {
    if sources.is_empty() {
        return Err(eyre!("at least one source concept is required"));
    }
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let manager = manager_for(&config, storage);

    let target_id = target.parse().map_err(|e| eyre!("invalid target id: {e}"))?;
    let source_ids = sources
        .iter()
        .map(|s| s.parse().map_err(|e| eyre!("invalid source id '{s}': {e}")))
        .collect::<Result<Vec<_>>>()?;

    if preview {
        let report = manager.preview_merge(&target_id, &source_ids).await?;
        println!("Would merge {} concept(s) into {}", source_ids.len(), report.merged.id);
        println!("  Name:       {}", report.merged.name);
        println!("  Examples:   {}", report.merged.examples.len());
        println!("  Confidence: {:.2}", report.merged.confidence);
        println!(
            "  Courses affected:  {}",
            format_id_list(report.affected_courses.iter().map(|c| c.to_string()))
        );
        println!(
            "  Learners affected: {}",
            format_id_list(report.affected_learners.iter().cloned())
        );
        return Ok(());
    }

    let overrides = MergeOverrides {
        name,
        description,
        ..Default::default()
    };
    let merged = manager
        .merge_concepts(&target_id, &source_ids, &overrides)
        .await?;

    println!("Merged {} concept(s) into {}", source_ids.len(), merged.id);
    println!("  Name:       {}", merged.name);
    println!("  Examples:   {}", merged.examples.len());
    println!("  Confidence: {:.2}", merged.confidence);
    Ok(())
}

async fn cmd_duplicates(file: &Path) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let manager = manager_for(&config, storage);

    let raw = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let candidates: Vec<ExtractedConcept> =
        serde_json::from_str(&raw).map_err(|e| eyre!("invalid concepts file: {e}"))?;

    let report = manager.detector().check_for_duplicates(&candidates).await?;
    if !report.has_duplicates {
        println!("No duplicates among {} candidate(s).", candidates.len());
        return Ok(());
    }
    println!("Duplicates found: {}", report.duplicate_names.join(", "));
    for entry in report.entries.iter().filter(|e| e.duplicate.is_some()) {
        let dup = entry.duplicate.as_ref().expect("filtered above");
        println!(
            "  '{}' collides with '{}' ({}, {:?})",
            entry.name, dup.concept.name, dup.concept.id, dup.match_type
        );
    }
    Ok(())
}

async fn cmd_apply(course: &str, decisions_file: &Path, session: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let manager = manager_for(&config, storage.clone());

    let course_id: CourseId = course.parse().map_err(|e| eyre!("invalid course id: {e}"))?;
    let raw = std::fs::read_to_string(decisions_file)
        .map_err(|e| eyre!("cannot read '{}': {e}", decisions_file.display()))?;
    let decisions: Vec<ConceptDecision> =
        serde_json::from_str(&raw).map_err(|e| eyre!("invalid decisions file: {e}"))?;

    let report = manager.apply_reviewed_concepts(&course_id, &decisions).await?;

    println!("Applied {} decision(s):", decisions.len());
    println!("  Created: {}", report.created.len());
    println!("  Merged:  {}", report.merged.len());
    println!("  Skipped: {}", report.skipped);
    for error in &report.errors {
        println!("  Error:   {error}");
    }

    if let Some(session) = session {
        let session_id = session
            .parse()
            .map_err(|e| eyre!("invalid session id: {e}"))?;
        storage
            .update_session_status(&session_id, SessionStatus::Reviewed)
            .await?;
        println!("Session {session_id} marked as reviewed.");
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config written to {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    println!("# {}", config_file_path()?.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn chunk_processed(&self, kind: ChunkKind, current: usize, total: usize, extracted: usize) {
        self.spinner.set_message(format!(
            "Extracting [{current}/{total}] {} chunk done, {extracted} concept(s)",
            kind.as_str()
        ));
    }

    fn concept_checked(&self, name: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Similarity [{current}/{total}] {name}"));
    }

    fn done(&self, _outcome: &ExtractionOutcome) {
        self.spinner.finish_and_clear();
    }
}
