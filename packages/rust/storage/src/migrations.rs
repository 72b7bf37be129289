//! SQL migration definitions for the ConceptForge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: courses, concepts, course_concepts, concept_progress, sessions",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Raw course material
CREATE TABLE IF NOT EXISTS courses (
    id                   TEXT PRIMARY KEY,
    name                 TEXT NOT NULL,
    keywords_json        TEXT NOT NULL DEFAULT '[]',
    notes                TEXT NOT NULL DEFAULT '',
    practice             TEXT NOT NULL DEFAULT '',
    homework             TEXT,
    new_words_json       TEXT NOT NULL DEFAULT '[]',
    last_extraction_json TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

-- Durable concept records. Never hard-deleted: merges archive the source
-- rows (is_active = 0) and set merged_into.
CREATE TABLE IF NOT EXISTS concepts (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    category          TEXT NOT NULL,
    description       TEXT NOT NULL DEFAULT '',
    examples_json     TEXT NOT NULL DEFAULT '[]',
    difficulty        TEXT NOT NULL DEFAULT 'B1',
    confidence        REAL NOT NULL DEFAULT 0.5,
    tags_json         TEXT NOT NULL DEFAULT '[]',
    created_from_json TEXT NOT NULL DEFAULT '[]',
    is_active         INTEGER NOT NULL DEFAULT 1,
    merged_into       TEXT,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_concepts_active ON concepts(is_active);
CREATE INDEX IF NOT EXISTS idx_concepts_name ON concepts(name COLLATE NOCASE, category);

-- Concept <-> course links (owned by the practice subsystem)
CREATE TABLE IF NOT EXISTS course_concepts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    concept_id     TEXT NOT NULL REFERENCES concepts(id),
    course_id      TEXT NOT NULL REFERENCES courses(id),
    confidence     REAL NOT NULL DEFAULT 0.5,
    source_content TEXT NOT NULL DEFAULT '',
    is_active      INTEGER NOT NULL DEFAULT 1,
    extracted_at   TEXT NOT NULL,
    UNIQUE(concept_id, course_id)
);

CREATE INDEX IF NOT EXISTS idx_course_concepts_concept ON course_concepts(concept_id);

-- Per-learner review state (owned by the practice subsystem)
CREATE TABLE IF NOT EXISTS concept_progress (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    concept_id       TEXT NOT NULL REFERENCES concepts(id),
    user_id          TEXT NOT NULL,
    total_attempts   INTEGER NOT NULL DEFAULT 0,
    correct_attempts INTEGER NOT NULL DEFAULT 0,
    streak           INTEGER NOT NULL DEFAULT 0,
    last_reviewed    TEXT,
    next_review      TEXT,
    difficulty       INTEGER NOT NULL DEFAULT 5,
    interval_days    INTEGER NOT NULL DEFAULT 1,
    UNIQUE(concept_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_progress_concept ON concept_progress(concept_id);

-- Extraction sessions. JSON columns are updated individually so every
-- checkpoint is a single-column write.
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    course_id       TEXT NOT NULL REFERENCES courses(id),
    status          TEXT NOT NULL,
    chunks_json     TEXT NOT NULL DEFAULT '[]',
    concepts_json   TEXT NOT NULL DEFAULT '[]',
    similarity_json TEXT NOT NULL DEFAULT '{}',
    progress_json   TEXT NOT NULL,
    stats_json      TEXT,
    model           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_course ON sessions(course_id, status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
