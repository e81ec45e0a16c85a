use rusqlite::{params, OptionalExtension};

use crate::database::{conversion_failure, map_insert_error, parse_timestamp, Database};
use crate::error::Result;
use crate::models::{ConnectionState, PeerInfo};

impl Database {
    pub fn insert_peer_info(&self, info: &PeerInfo) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO peer_info (peer_id, username, avatar_url, status, address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    info.peer_id,
                    info.username,
                    info.avatar_url,
                    info.status.as_str(),
                    info.address,
                    info.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| map_insert_error(e, "peer info"))?;
        Ok(())
    }

    pub fn get_peer_info(&self, peer_id: &str) -> Result<Option<PeerInfo>> {
        let info = self
            .conn()
            .query_row(
                "SELECT peer_id, username, avatar_url, status, address, created_at
                 FROM peer_info WHERE peer_id = ?1",
                params![peer_id],
                row_to_peer_info,
            )
            .optional()?;
        Ok(info)
    }

    pub fn get_all_peer_info(&self) -> Result<Vec<PeerInfo>> {
        let mut stmt = self.conn().prepare(
            "SELECT peer_id, username, avatar_url, status, address, created_at
             FROM peer_info ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_peer_info)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }
}

fn row_to_peer_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerInfo> {
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(5)?;

    Ok(PeerInfo {
        peer_id: row.get(0)?,
        username: row.get(1)?,
        avatar_url: row.get(2)?,
        status: status_str
            .parse::<ConnectionState>()
            .map_err(|e| conversion_failure(3, e))?,
        address: row.get(4)?,
        created_at: parse_timestamp(5, &created_str)?,
    })
}
