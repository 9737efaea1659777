use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id                     TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id        TEXT NOT NULL,              -- FK -> conversations(id)
    sender                 TEXT NOT NULL,
    receiver               TEXT NOT NULL,
    text                   TEXT NOT NULL,
    uuid                   TEXT NOT NULL,              -- client idempotency key
    status                 INTEGER NOT NULL DEFAULT 0, -- 0 pending, 1 delivered, 2 read
    created_at             TEXT NOT NULL,
    received_at            TEXT,
    read_at                TEXT,
    edited_at              TEXT,
    deleted_at             TEXT,
    edited_after_received  INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    deleted_after_received INTEGER NOT NULL DEFAULT 0, -- boolean 0/1

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency
    ON messages(sender, receiver, uuid);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender, created_at);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
