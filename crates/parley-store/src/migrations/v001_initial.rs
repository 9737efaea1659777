//! v001 -- Initial schema creation.
//!
//! Creates `users`, `conversations` and the per-participant
//! `conversation_flags` table that backs `deleted_by` / `blocked_by`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,     -- identity from the auth layer
    created_at TEXT NOT NULL                  -- RFC-3339, microsecond precision
);

-- ----------------------------------------------------------------
-- Conversations (exactly two participants, user_a < user_b)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    user_a            TEXT NOT NULL,
    user_b            TEXT NOT NULL,
    latest_message_id TEXT,                       -- nullable, messages(id)
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,

    CHECK (user_a < user_b),
    UNIQUE (user_a, user_b)
);

CREATE INDEX IF NOT EXISTS idx_conversations_user_b ON conversations(user_b);

-- ----------------------------------------------------------------
-- Per-participant flags: kind is 'deleted' or 'blocked'
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_flags (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    kind            TEXT NOT NULL,
    created_at      TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id, kind),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
