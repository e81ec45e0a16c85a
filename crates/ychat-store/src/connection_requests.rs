use rusqlite::{params, OptionalExtension};

use crate::database::{conversion_failure, map_insert_error, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{ConnectionRequest, RequestStatus};

const COLUMNS: &str = "peer_id, status, username, avatar_url, address, created_at, updated_at";

impl Database {
    pub fn insert_connection_request(&self, request: &ConnectionRequest) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO connection_requests
                     (peer_id, status, username, avatar_url, address, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    request.peer_id,
                    request.status.as_str(),
                    request.username,
                    request.avatar_url,
                    request.address,
                    request.created_at.to_rfc3339(),
                    request.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| map_insert_error(e, "pending connection request"))?;
        Ok(())
    }

    pub fn get_connection_request(
        &self,
        peer_id: &str,
        status: RequestStatus,
    ) -> Result<Option<ConnectionRequest>> {
        let request = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM connection_requests
                     WHERE peer_id = ?1 AND status = ?2
                     ORDER BY id DESC LIMIT 1"
                ),
                params![peer_id, status.as_str()],
                row_to_request,
            )
            .optional()?;
        Ok(request)
    }

    /// Rewrite the newest row keyed by `(request.peer_id, current)`.
    /// Only pending -> terminal moves are accepted.
    pub fn update_connection_request(
        &self,
        current: RequestStatus,
        request: &ConnectionRequest,
    ) -> Result<()> {
        if !current.can_transition_to(request.status) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: request.status,
            });
        }

        let affected = self
            .conn()
            .execute(
                "UPDATE connection_requests
                 SET status = ?1, username = ?2, avatar_url = ?3, address = ?4, updated_at = ?5
                 WHERE id = (
                     SELECT id FROM connection_requests
                     WHERE peer_id = ?6 AND status = ?7
                     ORDER BY id DESC LIMIT 1
                 )",
                params![
                    request.status.as_str(),
                    request.username,
                    request.avatar_url,
                    request.address,
                    request.updated_at.to_rfc3339(),
                    request.peer_id,
                    current.as_str(),
                ],
            )
            .map_err(|e| map_insert_error(e, "pending connection request"))?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Drop the newest `sent` row for `peer_id`.
    pub fn delete_sent_connection_request(&self, peer_id: &str) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM connection_requests
             WHERE id = (
                 SELECT id FROM connection_requests
                 WHERE peer_id = ?1 AND status = ?2
                 ORDER BY id DESC LIMIT 1
             )",
            params![peer_id, RequestStatus::Sent.as_str()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn get_connection_requests_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<ConnectionRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM connection_requests
             WHERE status = ?1
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![status.as_str()], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    pub fn get_connection_requests_for_peer(&self, peer_id: &str) -> Result<Vec<ConnectionRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM connection_requests
             WHERE peer_id = ?1
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![peer_id], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRequest> {
    let status_str: String = row.get(1)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;

    let status = status_str
        .parse::<RequestStatus>()
        .map_err(|e| conversion_failure(1, e))?;

    Ok(ConnectionRequest {
        peer_id: row.get(0)?,
        status,
        username: row.get(2)?,
        avatar_url: row.get(3)?,
        address: row.get(4)?,
        created_at: parse_timestamp(5, &created_str)?,
        updated_at: parse_timestamp(6, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn insert_and_find() {
        let db = db();
        let req = ConnectionRequest::new("12D3KooWA", RequestStatus::Sent, "/ip4/10.0.0.2/tcp/3000");
        db.insert_connection_request(&req).unwrap();

        let found = db
            .get_connection_request("12D3KooWA", RequestStatus::Sent)
            .unwrap()
            .expect("row should exist");
        assert_eq!(found.address, "/ip4/10.0.0.2/tcp/3000");
        assert!(db
            .get_connection_request("12D3KooWA", RequestStatus::Accepted)
            .unwrap()
            .is_none());
    }

    #[test]
    fn second_pending_request_is_rejected() {
        let db = db();
        db.insert_connection_request(&ConnectionRequest::new("p", RequestStatus::Sent, ""))
            .unwrap();

        let err = db
            .insert_connection_request(&ConnectionRequest::new("p", RequestStatus::AwaitingDecision, ""))
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[test]
    fn terminal_rows_accumulate() {
        let db = db();
        for _ in 0..2 {
            db.insert_connection_request(&ConnectionRequest::new("p", RequestStatus::Sent, ""))
                .unwrap();
            let mut req = db.get_connection_request("p", RequestStatus::Sent).unwrap().unwrap();
            req.status = RequestStatus::Rejected;
            db.update_connection_request(RequestStatus::Sent, &req).unwrap();
        }

        let history = db.get_connection_requests_for_peer("p").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.status == RequestStatus::Rejected));
    }

    #[test]
    fn update_missing_row_is_not_found() {
        let db = db();
        let req = ConnectionRequest::new("ghost", RequestStatus::Accepted, "");
        let err = db.update_connection_request(RequestStatus::Sent, &req).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn update_carries_profile() {
        let db = db();
        db.insert_connection_request(&ConnectionRequest::new("p", RequestStatus::Sent, "addr"))
            .unwrap();

        let req = ConnectionRequest::new("p", RequestStatus::Accepted, "addr").with_profile("bob", "http://a/b.png");
        db.update_connection_request(RequestStatus::Sent, &req).unwrap();

        let accepted = db.get_connection_requests_by_status(RequestStatus::Accepted).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].username, "bob");
        assert_eq!(accepted[0].avatar_url, "http://a/b.png");
        assert!(db.get_connection_requests_by_status(RequestStatus::Sent).unwrap().is_empty());
    }

    #[test]
    fn terminal_rows_cannot_move() {
        let db = db();
        db.insert_connection_request(&ConnectionRequest::new("p", RequestStatus::Sent, ""))
            .unwrap();
        let accepted = ConnectionRequest::new("p", RequestStatus::Accepted, "");
        db.update_connection_request(RequestStatus::Sent, &accepted).unwrap();

        let late_reject = ConnectionRequest::new("p", RequestStatus::Rejected, "");
        let err = db
            .update_connection_request(RequestStatus::Accepted, &late_reject)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: RequestStatus::Accepted,
                to: RequestStatus::Rejected
            }
        ));
        assert_eq!(db.get_connection_requests_by_status(RequestStatus::Accepted).unwrap().len(), 1);
    }

    #[test]
    fn withdrawn_sent_row_frees_the_pending_slot() {
        let db = db();
        db.insert_connection_request(&ConnectionRequest::new("p", RequestStatus::Sent, ""))
            .unwrap();

        db.delete_sent_connection_request("p").unwrap();
        assert!(db.get_connection_requests_for_peer("p").unwrap().is_empty());
        assert!(matches!(
            db.delete_sent_connection_request("p").unwrap_err(),
            StoreError::NotFound
        ));

        db.insert_connection_request(&ConnectionRequest::new("p", RequestStatus::AwaitingDecision, ""))
            .unwrap();
    }
}
