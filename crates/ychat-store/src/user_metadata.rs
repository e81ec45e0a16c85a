use rusqlite::{params, OptionalExtension};

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::UserMetadata;

impl Database {
    /// The local profile. Only one row is expected; the oldest wins.
    pub fn get_first_user_metadata(&self) -> Result<Option<UserMetadata>> {
        let meta = self
            .conn()
            .query_row(
                "SELECT peer_id, username, avatar_url, created_at, last_login_at
                 FROM user_metadata ORDER BY created_at ASC LIMIT 1",
                [],
                |row| {
                    let created_str: String = row.get(3)?;
                    let login_str: Option<String> = row.get(4)?;
                    Ok(UserMetadata {
                        peer_id: row.get(0)?,
                        username: row.get(1)?,
                        avatar_url: row.get(2)?,
                        created_at: parse_timestamp(3, &created_str)?,
                        last_login_at: login_str
                            .as_deref()
                            .map(|s| parse_timestamp(4, s))
                            .transpose()?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub fn upsert_user_metadata(&self, meta: &UserMetadata) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_metadata (peer_id, username, avatar_url, created_at, last_login_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(peer_id) DO UPDATE SET
                 username = excluded.username,
                 avatar_url = excluded.avatar_url,
                 last_login_at = excluded.last_login_at",
            params![
                meta.peer_id,
                meta.username,
                meta.avatar_url,
                meta.created_at.to_rfc3339(),
                meta.last_login_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }
}
