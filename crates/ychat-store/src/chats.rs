use rusqlite::params;

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::ChatMessage;

impl Database {
    pub fn insert_chat_message(&self, message: &ChatMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_messages (from_peer, to_peer, message, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message.from,
                message.to,
                message.message,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Messages exchanged with `peer_id` in either direction, newest first.
    pub fn get_chat_messages_with(&self, peer_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT from_peer, to_peer, message, timestamp
             FROM chat_messages
             WHERE from_peer = ?1 OR to_peer = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![peer_id, limit], |row| {
            let ts_str: String = row.get(3)?;
            Ok(ChatMessage {
                from: row.get(0)?,
                to: row.get(1)?,
                message: row.get(2)?,
                timestamp: parse_timestamp(3, &ts_str)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}
