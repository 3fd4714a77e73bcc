//! SQL migration definitions for the Examflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

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
        description: "Initial schema: subjects, topics, items, proposals, extraction_cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Taxonomy: subjects (level 1)
CREATE TABLE IF NOT EXISTS subjects (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    alternate_name TEXT NOT NULL,
    year           INTEGER,
    created_at     TEXT NOT NULL
);

-- alternate_name distinguishes subjects sharing a display name; the pair is
-- the identity used by create-or-recover writes.
CREATE UNIQUE INDEX IF NOT EXISTS idx_subjects_identity
    ON subjects(name COLLATE NOCASE, alternate_name COLLATE NOCASE);

-- Taxonomy: topics (level 2, scoped to a subject)
CREATE TABLE IF NOT EXISTS topics (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    subject_id TEXT NOT NULL REFERENCES subjects(id),
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_topics_identity
    ON topics(subject_id, name COLLATE NOCASE);

-- Exam items; taxonomy fields are written only by the migration driver
CREATE TABLE IF NOT EXISTS items (
    id            TEXT PRIMARY KEY,
    content_json  TEXT NOT NULL,
    answers_json  TEXT NOT NULL,
    subject_id    TEXT REFERENCES subjects(id),
    topic_id      TEXT REFERENCES topics(id),
    source_label  TEXT NOT NULL,
    year          INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    content_hash  TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_topic ON items(topic_id);
CREATE INDEX IF NOT EXISTS idx_items_dedup ON items(source_label, year, content_hash);

-- Classification staging ledger: one proposal per item, append-only
CREATE TABLE IF NOT EXISTS proposals (
    id               TEXT PRIMARY KEY,
    item_id          TEXT NOT NULL UNIQUE REFERENCES items(id),
    old_subject_id   TEXT,
    old_subject_name TEXT,
    old_topic_id     TEXT,
    old_topic_name   TEXT,
    new_subject_id   TEXT NOT NULL,
    new_subject_name TEXT NOT NULL,
    new_topic_id     TEXT NOT NULL,
    new_topic_name   TEXT NOT NULL,
    rationale        TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_proposals_topic ON proposals(new_topic_id);

-- OCR extraction cache, keyed by normalized source URL.
-- Empty text is stored too, so broken assets are not retried.
CREATE TABLE IF NOT EXISTS extraction_cache (
    source_url TEXT PRIMARY KEY,
    text       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
