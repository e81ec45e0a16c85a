//! The storage contract the chat core depends on.

use crate::error::Result;
use crate::models::{ChatMessage, ConnectionRequest, PeerInfo, RequestStatus, UserMetadata};

/// Synchronous CRUD surface used by the server and message handler.
///
/// Implementations must reject a second pending (`sent` or
/// `awaiting_decision`) request for the same peer and a second contact row
/// for the same peer with [`StoreError::Duplicate`](crate::StoreError::Duplicate).
pub trait Storage: Send + Sync {
    fn create_connection_request(&self, request: &ConnectionRequest) -> Result<()>;

    /// Most recent request for `peer_id` in `status`.
    fn find_connection_request(
        &self,
        peer_id: &str,
        status: RequestStatus,
    ) -> Result<Option<ConnectionRequest>>;

    /// Overwrite the request currently keyed by `(request.peer_id, current)`.
    /// Fails with `NotFound` when no such row exists and with
    /// `InvalidTransition` unless `current -> request.status` is a legal move
    /// (see [`RequestStatus::can_transition_to`]).
    fn update_connection_request(
        &self,
        current: RequestStatus,
        request: &ConnectionRequest,
    ) -> Result<()>;

    /// Remove the newest `sent` request for `peer_id`. Used when our
    /// handshake never reached the peer. Fails with `NotFound` when there is
    /// none.
    fn withdraw_sent_request(&self, peer_id: &str) -> Result<()>;

    fn list_connection_requests(&self, status: RequestStatus) -> Result<Vec<ConnectionRequest>>;

    /// Every request ever recorded for `peer_id`, oldest first.
    fn connection_requests_for_peer(&self, peer_id: &str) -> Result<Vec<ConnectionRequest>>;

    fn create_peer_info(&self, info: &PeerInfo) -> Result<()>;

    fn find_peer_info(&self, peer_id: &str) -> Result<Option<PeerInfo>>;

    fn list_peer_info(&self) -> Result<Vec<PeerInfo>>;

    fn create_chat_message(&self, message: &ChatMessage) -> Result<()>;

    /// Conversation between the local node and `peer_id`, newest first.
    fn list_chat_messages(&self, peer_id: &str, limit: u32) -> Result<Vec<ChatMessage>>;

    fn first_user_metadata(&self) -> Result<Option<UserMetadata>>;

    /// Insert or replace the local profile.
    fn save_user_metadata(&self, metadata: &UserMetadata) -> Result<()>;
}

/// Behaviour every [`Storage`] implementation must share.
#[cfg(test)]
pub(crate) mod contract {
    use super::Storage;
    use crate::error::StoreError;
    use crate::models::*;
    use chrono::Utc;

    pub fn exercise(store: &dyn Storage) {
        // One pending request per peer, regardless of direction.
        store
            .create_connection_request(&ConnectionRequest::new("bob", RequestStatus::Sent, "/ip4/10.0.0.2/tcp/3000"))
            .unwrap();
        let dup = store
            .create_connection_request(&ConnectionRequest::new("bob", RequestStatus::AwaitingDecision, ""))
            .unwrap_err();
        assert!(matches!(dup, StoreError::Duplicate(_)));

        // Sent -> accepted carries the remote profile.
        let mut req = store
            .find_connection_request("bob", RequestStatus::Sent)
            .unwrap()
            .unwrap();
        req.status = RequestStatus::Accepted;
        req.username = "bob".into();
        req.updated_at = Utc::now();
        store.update_connection_request(RequestStatus::Sent, &req).unwrap();

        assert!(store.find_connection_request("bob", RequestStatus::Sent).unwrap().is_none());
        let accepted = store.list_connection_requests(RequestStatus::Accepted).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].username, "bob");
        assert_eq!(accepted[0].address, "/ip4/10.0.0.2/tcp/3000");

        // Pending slot is free again once the request is terminal.
        store
            .create_connection_request(&ConnectionRequest::new("bob", RequestStatus::AwaitingDecision, ""))
            .unwrap();
        assert_eq!(store.connection_requests_for_peer("bob").unwrap().len(), 2);

        assert!(matches!(
            store
                .update_connection_request(RequestStatus::Sent, &ConnectionRequest::new("nobody", RequestStatus::Rejected, ""))
                .unwrap_err(),
            StoreError::NotFound
        ));

        // Terminal rows never move again.
        assert!(matches!(
            store
                .update_connection_request(RequestStatus::Accepted, &ConnectionRequest::new("bob", RequestStatus::Rejected, ""))
                .unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));

        // A withdrawn sent request leaves no trace and frees the slot.
        store
            .create_connection_request(&ConnectionRequest::new("dave", RequestStatus::Sent, ""))
            .unwrap();
        store.withdraw_sent_request("dave").unwrap();
        assert!(store.connection_requests_for_peer("dave").unwrap().is_empty());
        assert!(matches!(store.withdraw_sent_request("dave").unwrap_err(), StoreError::NotFound));
        store
            .create_connection_request(&ConnectionRequest::new("dave", RequestStatus::AwaitingDecision, ""))
            .unwrap();

        // Contacts are unique by peer id.
        let info = PeerInfo::from_request(&accepted[0]);
        store.create_peer_info(&info).unwrap();
        assert!(matches!(store.create_peer_info(&info).unwrap_err(), StoreError::Duplicate(_)));
        assert_eq!(store.find_peer_info("bob").unwrap().unwrap().status, ConnectionState::Inactive);
        assert_eq!(store.list_peer_info().unwrap().len(), 1);

        store.create_chat_message(&ChatMessage::new("me", "bob", "hi")).unwrap();
        store.create_chat_message(&ChatMessage::new("carol", "me", "yo")).unwrap();
        let history = store.list_chat_messages("bob", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hi");

        assert!(store.first_user_metadata().unwrap().is_none());
        store
            .save_user_metadata(&UserMetadata {
                peer_id: "me".into(),
                username: "alice".into(),
                avatar_url: "http://img/a.png".into(),
                created_at: Utc::now(),
                last_login_at: None,
            })
            .unwrap();
        assert_eq!(store.first_user_metadata().unwrap().unwrap().username, "alice");
    }
}
