//! [`Storage`] backed by a SQLite [`Database`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ChatMessage, ConnectionRequest, PeerInfo, RequestStatus, UserMetadata};
use crate::storage::Storage;

/// A single connection guarded by a mutex; SQLite serializes writers anyway.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Storage for SqliteStore {
    fn create_connection_request(&self, request: &ConnectionRequest) -> Result<()> {
        self.db()?.insert_connection_request(request)
    }

    fn find_connection_request(
        &self,
        peer_id: &str,
        status: RequestStatus,
    ) -> Result<Option<ConnectionRequest>> {
        self.db()?.get_connection_request(peer_id, status)
    }

    fn update_connection_request(
        &self,
        current: RequestStatus,
        request: &ConnectionRequest,
    ) -> Result<()> {
        self.db()?.update_connection_request(current, request)
    }

    fn withdraw_sent_request(&self, peer_id: &str) -> Result<()> {
        self.db()?.delete_sent_connection_request(peer_id)
    }

    fn list_connection_requests(&self, status: RequestStatus) -> Result<Vec<ConnectionRequest>> {
        self.db()?.get_connection_requests_by_status(status)
    }

    fn connection_requests_for_peer(&self, peer_id: &str) -> Result<Vec<ConnectionRequest>> {
        self.db()?.get_connection_requests_for_peer(peer_id)
    }

    fn create_peer_info(&self, info: &PeerInfo) -> Result<()> {
        self.db()?.insert_peer_info(info)
    }

    fn find_peer_info(&self, peer_id: &str) -> Result<Option<PeerInfo>> {
        self.db()?.get_peer_info(peer_id)
    }

    fn list_peer_info(&self) -> Result<Vec<PeerInfo>> {
        self.db()?.get_all_peer_info()
    }

    fn create_chat_message(&self, message: &ChatMessage) -> Result<()> {
        self.db()?.insert_chat_message(message)
    }

    fn list_chat_messages(&self, peer_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        self.db()?.get_chat_messages_with(peer_id, limit)
    }

    fn first_user_metadata(&self) -> Result<Option<UserMetadata>> {
        self.db()?.get_first_user_metadata()
    }

    fn save_user_metadata(&self, metadata: &UserMetadata) -> Result<()> {
        self.db()?.upsert_user_metadata(metadata)
    }
}
