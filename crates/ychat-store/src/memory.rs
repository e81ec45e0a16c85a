//! In-process [`Storage`] implementation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, StoreError};
use crate::models::{ChatMessage, ConnectionRequest, PeerInfo, RequestStatus, UserMetadata};
use crate::storage::Storage;

#[derive(Default)]
struct Tables {
    requests: Vec<ConnectionRequest>,
    peers: BTreeMap<String, PeerInfo>,
    messages: Vec<ChatMessage>,
    profiles: Vec<UserMetadata>,
}

/// Vec/map backed store with the same uniqueness rules as [`SqliteStore`](crate::SqliteStore).
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Storage for MemoryStore {
    fn create_connection_request(&self, request: &ConnectionRequest) -> Result<()> {
        let mut t = self.tables()?;
        if request.status.is_pending()
            && t.requests
                .iter()
                .any(|r| r.peer_id == request.peer_id && r.status.is_pending())
        {
            return Err(StoreError::Duplicate("pending connection request".into()));
        }
        t.requests.push(request.clone());
        Ok(())
    }

    fn find_connection_request(
        &self,
        peer_id: &str,
        status: RequestStatus,
    ) -> Result<Option<ConnectionRequest>> {
        let t = self.tables()?;
        Ok(t.requests
            .iter()
            .rev()
            .find(|r| r.peer_id == peer_id && r.status == status)
            .cloned())
    }

    fn update_connection_request(
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

        let mut t = self.tables()?;
        let row = t
            .requests
            .iter_mut()
            .rev()
            .find(|r| r.peer_id == request.peer_id && r.status == current)
            .ok_or(StoreError::NotFound)?;

        row.status = request.status;
        row.username.clone_from(&request.username);
        row.avatar_url.clone_from(&request.avatar_url);
        row.address.clone_from(&request.address);
        row.updated_at = request.updated_at;
        Ok(())
    }

    fn withdraw_sent_request(&self, peer_id: &str) -> Result<()> {
        let mut t = self.tables()?;
        let idx = t
            .requests
            .iter()
            .rposition(|r| r.peer_id == peer_id && r.status == RequestStatus::Sent)
            .ok_or(StoreError::NotFound)?;
        t.requests.remove(idx);
        Ok(())
    }

    fn list_connection_requests(&self, status: RequestStatus) -> Result<Vec<ConnectionRequest>> {
        let t = self.tables()?;
        Ok(t.requests.iter().filter(|r| r.status == status).cloned().collect())
    }

    fn connection_requests_for_peer(&self, peer_id: &str) -> Result<Vec<ConnectionRequest>> {
        let t = self.tables()?;
        Ok(t.requests.iter().filter(|r| r.peer_id == peer_id).cloned().collect())
    }

    fn create_peer_info(&self, info: &PeerInfo) -> Result<()> {
        let mut t = self.tables()?;
        if t.peers.contains_key(&info.peer_id) {
            return Err(StoreError::Duplicate("peer info".into()));
        }
        t.peers.insert(info.peer_id.clone(), info.clone());
        Ok(())
    }

    fn find_peer_info(&self, peer_id: &str) -> Result<Option<PeerInfo>> {
        Ok(self.tables()?.peers.get(peer_id).cloned())
    }

    fn list_peer_info(&self) -> Result<Vec<PeerInfo>> {
        let mut peers: Vec<_> = self.tables()?.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.created_at);
        Ok(peers)
    }

    fn create_chat_message(&self, message: &ChatMessage) -> Result<()> {
        self.tables()?.messages.push(message.clone());
        Ok(())
    }

    fn list_chat_messages(&self, peer_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        let t = self.tables()?;
        let mut out: Vec<_> = t
            .messages
            .iter()
            .filter(|m| m.from == peer_id || m.to == peer_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps; reverse after.
        out.sort_by_key(|m| m.timestamp);
        out.reverse();
        out.truncate(limit as usize);
        Ok(out)
    }

    fn first_user_metadata(&self) -> Result<Option<UserMetadata>> {
        let t = self.tables()?;
        Ok(t.profiles.iter().min_by_key(|m| m.created_at).cloned())
    }

    fn save_user_metadata(&self, metadata: &UserMetadata) -> Result<()> {
        let mut t = self.tables()?;
        match t.profiles.iter_mut().find(|m| m.peer_id == metadata.peer_id) {
            Some(existing) => {
                existing.username.clone_from(&metadata.username);
                existing.avatar_url.clone_from(&metadata.avatar_url);
                existing.last_login_at = metadata.last_login_at;
            }
            None => t.profiles.push(metadata.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;

    #[test]
    fn memory_store_honours_contract() {
        contract::exercise(&MemoryStore::new());
    }
}
