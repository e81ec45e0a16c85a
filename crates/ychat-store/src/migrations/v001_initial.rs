//! v001 -- Initial schema creation.
//!
//! Creates `user_metadata`, `connection_requests`, `peer_info` and
//! `chat_messages`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Local profile
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_metadata (
    peer_id       TEXT PRIMARY KEY NOT NULL,    -- base58 libp2p PeerId
    username      TEXT NOT NULL,
    avatar_url    TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL,                -- RFC-3339
    last_login_at TEXT
);

-- ----------------------------------------------------------------
-- Connection requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS connection_requests (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_id    TEXT NOT NULL,
    status     TEXT NOT NULL,                   -- sent | awaiting_decision | accepted | rejected
    username   TEXT NOT NULL DEFAULT '',
    avatar_url TEXT NOT NULL DEFAULT '',
    address    TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connection_requests_peer_status
    ON connection_requests(peer_id, status);

-- At most one pending request per peer.
CREATE UNIQUE INDEX IF NOT EXISTS idx_connection_requests_pending
    ON connection_requests(peer_id)
    WHERE status IN ('sent', 'awaiting_decision');

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS peer_info (
    peer_id    TEXT PRIMARY KEY NOT NULL,
    username   TEXT NOT NULL DEFAULT '',
    avatar_url TEXT NOT NULL DEFAULT '',
    status     TEXT NOT NULL,                   -- active | inactive
    address    TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Chat history
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    from_peer TEXT NOT NULL,
    to_peer   TEXT NOT NULL,
    message   TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_pair_ts
    ON chat_messages(from_peer, to_peer, timestamp DESC);
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
