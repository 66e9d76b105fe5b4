//! SQL schema for the Carta SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    conversation_id         TEXT PRIMARY KEY,
    title                   TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    root_id                 TEXT,
    current_node            TEXT,
    tension_score           REAL,
    embedding_model_version TEXT NOT NULL,
    default_model_slug      TEXT
);

-- Structural columns are written once. Only embedding_*, metrics and
-- sibling_count are ever updated.
CREATE TABLE IF NOT EXISTS nodes (
    seq                       INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id           TEXT NOT NULL
                              REFERENCES conversations(conversation_id) ON DELETE CASCADE,
    node_id                   TEXT NOT NULL,
    parent_id                 TEXT,
    role                      TEXT NOT NULL,
    content                   TEXT NOT NULL,
    content_type              TEXT NOT NULL,
    created_at                TEXT NOT NULL,
    embedding                 BLOB,            -- little-endian f32 components
    embedding_model           TEXT,
    is_mainline               INTEGER NOT NULL,
    is_terminal               INTEGER NOT NULL,
    sibling_count             INTEGER NOT NULL,
    branch_depth              INTEGER NOT NULL,
    ancestor_path             TEXT NOT NULL,   -- JSON array, root first
    turn_number               INTEGER NOT NULL,
    generation_type           TEXT NOT NULL,
    mainline_divergence_point TEXT,
    replaced_node_id          TEXT,
    metrics                   TEXT NOT NULL DEFAULT '{}',
    UNIQUE (conversation_id, node_id),
    CHECK  ((branch_depth = 0) = (is_mainline = 1))
);

CREATE TABLE IF NOT EXISTS pairs (
    conversation_id             TEXT NOT NULL
                                REFERENCES conversations(conversation_id) ON DELETE CASCADE,
    pair_id                     TEXT NOT NULL,
    prompt_id                   TEXT NOT NULL,
    response_id                 TEXT NOT NULL,
    is_mainline                 INTEGER NOT NULL,
    is_alternate                INTEGER NOT NULL,
    is_terminal_arc             INTEGER NOT NULL,
    alternative_count           INTEGER NOT NULL,
    branch_depth                INTEGER NOT NULL,
    divergence_point            TEXT,
    divergence_turn             INTEGER,
    exchange_position_in_branch INTEGER NOT NULL,
    turn_number                 INTEGER NOT NULL,
    embedding                   BLOB,
    embedding_model             TEXT,
    embedding_derived           INTEGER NOT NULL,
    metrics                     TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (conversation_id, pair_id),
    UNIQUE (conversation_id, prompt_id, response_id)
);

CREATE TABLE IF NOT EXISTS ancestry_paths (
    conversation_id  TEXT NOT NULL
                     REFERENCES conversations(conversation_id) ON DELETE CASCADE,
    node_id          TEXT NOT NULL,
    ancestor_id      TEXT NOT NULL,
    distance         INTEGER NOT NULL CHECK (distance >= 0),
    intermediate     TEXT NOT NULL,   -- JSON array, top-down
    cumulative_drift REAL,
    PRIMARY KEY (conversation_id, node_id, ancestor_id)
);

CREATE INDEX IF NOT EXISTS nodes_parent_idx ON nodes(conversation_id, parent_id);
CREATE INDEX IF NOT EXISTS nodes_depth_idx  ON nodes(conversation_id, branch_depth);
CREATE INDEX IF NOT EXISTS nodes_turn_idx   ON nodes(conversation_id, turn_number);

PRAGMA user_version = 1;
";
