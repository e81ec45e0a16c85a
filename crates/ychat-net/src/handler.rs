//! Envelope dispatch and the connection-request state machine.
//!
//! ```text
//! sent ──handshake_ack──▶ accepted        (none) ──handshake──▶ awaiting_decision
//! sent ──handshake_reject──▶ rejected     awaiting_decision ──local decision──▶ accepted | rejected
//! ```
//!
//! The handler runs inside the coordination loop, so check-then-act on the
//! store is never interleaved with another envelope or decision.
//!
//! When both nodes dial each other at once, each holds a `sent` request when
//! the other's handshake arrives. The node with the lower peer id keeps its
//! request; the other withdraws its own and treats the handshake as a new
//! request.

use std::sync::Arc;

use chrono::Utc;
use libp2p::PeerId;
use thiserror::Error;
use tracing::{debug, info, warn};

use ychat_shared::protocol::ProtocolError;
use ychat_shared::{ChatPayload, Envelope, HandShake, Message, UserInfo};
use ychat_store::{ConnectionRequest, PeerInfo, RequestStatus, Storage, StoreError};

use crate::config::NodeConfig;
use crate::eventbus::{Event, EventBus, NewConnectionRequestEvent, NewMessageEvent};
use crate::handshake;
use crate::peer::PeerStatus;
use crate::registry::PeerRegistry;

/// Why a single envelope was not applied. Never fatal to the loop.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Envelope has no sender")]
    MissingSender,

    #[error("No live stream for peer {0}")]
    UnknownPeer(String),

    #[error("Version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    #[error("No {status} connection request for {peer_id}")]
    NoPendingRequest {
        peer_id: String,
        status: RequestStatus,
    },

    #[error("Undecodable envelope: {0}")]
    Decode(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

type Result<T> = std::result::Result<T, HandlerError>;

pub struct MessageHandler {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    local_peer_id: PeerId,
    node_name: String,
    version: String,
}

impl MessageHandler {
    pub fn new(
        storage: Arc<dyn Storage>,
        events: Arc<EventBus>,
        config: &NodeConfig,
        local_peer_id: PeerId,
    ) -> Self {
        Self {
            storage,
            events,
            local_peer_id,
            node_name: config.node_name.clone(),
            version: config.version.clone(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn local_handshake(&self) -> HandShake {
        handshake::local_handshake(self.storage.as_ref(), &self.node_name, &self.version)
    }

    /// Route one inbound envelope by its type tag.
    pub fn handle(&self, registry: &mut PeerRegistry, envelope: Envelope) -> Result<()> {
        let from = envelope.from.clone().ok_or(HandlerError::MissingSender)?;

        match envelope.decode()? {
            Message::Handshake(hs) => self.on_handshake(registry, &from, hs),
            Message::HandshakeAck(hs) => self.on_handshake_ack(registry, &from, hs),
            Message::HandshakeReject => self.on_handshake_reject(registry, &from),
            Message::Chat(chat) => {
                self.on_chat(from, chat);
                Ok(())
            }
        }
    }

    fn on_handshake(&self, registry: &mut PeerRegistry, from: &str, hs: HandShake) -> Result<()> {
        let peer_id = parse_peer_id(from)?;
        let peer = registry
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| HandlerError::UnknownPeer(from.to_string()))?;

        if hs.version != self.version {
            info!(peer = %from, remote_version = %hs.version, "Version mismatch, rejecting handshake");
            peer.send_detached(Envelope::handshake_reject());
            return Err(HandlerError::VersionMismatch {
                local: self.version.clone(),
                remote: hs.version,
            });
        }

        if self.storage.find_peer_info(from)?.is_some() {
            info!(peer = %from, "Known contact reconnected, acknowledging");
            peer.send_detached(Envelope::handshake_ack(&self.local_handshake()));
            registry.set_status(&peer_id, PeerStatus::Active);
            return Ok(());
        }

        if self.storage.find_connection_request(from, RequestStatus::Sent)?.is_some() {
            if self.local_peer_id < peer_id {
                debug!(peer = %from, "Crossed handshake, keeping our request");
                peer.send_detached(Envelope::handshake(&self.local_handshake()));
                return Ok(());
            }
            info!(peer = %from, "Crossed handshake, withdrawing our request");
            match self.storage.withdraw_sent_request(from) {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self
            .storage
            .find_connection_request(from, RequestStatus::AwaitingDecision)?
            .is_some()
        {
            debug!(peer = %from, "Duplicate handshake ignored");
            return Ok(());
        }

        let address = peer.address().map(ToString::to_string).unwrap_or_default();
        let request = ConnectionRequest::new(from, RequestStatus::AwaitingDecision, address)
            .with_profile(&hs.user_info.username, &hs.user_info.avatar_url);

        match self.storage.create_connection_request(&request) {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                debug!(peer = %from, "Pending request already stored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        info!(peer = %from, username = %hs.user_info.username, "New connection request");
        self.events
            .publish(Event::NewConnectionRequest(NewConnectionRequestEvent {
                peer_id: from.to_string(),
                username: hs.user_info.username,
                avatar_url: hs.user_info.avatar_url,
            }));
        Ok(())
    }

    fn on_handshake_ack(&self, registry: &mut PeerRegistry, from: &str, hs: HandShake) -> Result<()> {
        if hs.version != self.version {
            warn!(peer = %from, remote_version = %hs.version, "Ignoring handshake ack with mismatched version");
            return Ok(());
        }

        let Some(request) = self.storage.find_connection_request(from, RequestStatus::Sent)? else {
            if self.storage.find_peer_info(from)?.is_some() {
                debug!(peer = %from, "Ack from existing contact");
                mark(registry, from, PeerStatus::Active);
                return Ok(());
            }
            return Err(HandlerError::NoPendingRequest {
                peer_id: from.to_string(),
                status: RequestStatus::Sent,
            });
        };

        self.complete_acceptance(request, RequestStatus::Sent, Some(&hs.user_info))?;

        mark(registry, from, PeerStatus::Active);
        info!(peer = %from, "Connection request accepted by remote");
        Ok(())
    }

    fn on_handshake_reject(&self, registry: &mut PeerRegistry, from: &str) -> Result<()> {
        let request = self
            .storage
            .find_connection_request(from, RequestStatus::Sent)?
            .ok_or_else(|| HandlerError::NoPendingRequest {
                peer_id: from.to_string(),
                status: RequestStatus::Sent,
            })?;

        self.complete_rejection(request, RequestStatus::Sent)?;

        mark(registry, from, PeerStatus::Inactive);
        info!(peer = %from, "Connection request rejected by remote");
        Ok(())
    }

    fn on_chat(&self, from: String, chat: ChatPayload) {
        debug!(peer = %from, len = chat.message.len(), "Chat message received");
        self.events.publish(Event::NewMessage(NewMessageEvent {
            from,
            message: chat.message,
        }));
    }

    /// Move `request` from `current` to `accepted`, create the contact once
    /// and announce the new thread. The contact is written first so a failed
    /// status update still leaves a peer that is acknowledged on reconnect.
    pub(crate) fn complete_acceptance(
        &self,
        mut request: ConnectionRequest,
        current: RequestStatus,
        profile: Option<&UserInfo>,
    ) -> std::result::Result<(), StoreError> {
        check_transition(&request.peer_id, current, RequestStatus::Accepted)?;

        request.status = RequestStatus::Accepted;
        if let Some(info) = profile {
            request.username.clone_from(&info.username);
            request.avatar_url.clone_from(&info.avatar_url);
        }
        request.updated_at = Utc::now();

        match self.storage.create_peer_info(&PeerInfo::from_request(&request)) {
            Ok(()) => info!(peer = %request.peer_id, "Contact created"),
            Err(StoreError::Duplicate(_)) => {
                debug!(peer = %request.peer_id, "Contact already exists")
            }
            Err(e) => return Err(e),
        }
        self.storage.update_connection_request(current, &request)?;

        self.events.publish(Event::ThreadListUpdated);
        Ok(())
    }

    /// Move `request` from `current` to `rejected`.
    pub(crate) fn complete_rejection(
        &self,
        mut request: ConnectionRequest,
        current: RequestStatus,
    ) -> std::result::Result<(), StoreError> {
        check_transition(&request.peer_id, current, RequestStatus::Rejected)?;

        request.status = RequestStatus::Rejected;
        request.updated_at = Utc::now();
        self.storage.update_connection_request(current, &request)
    }
}

fn check_transition(
    peer_id: &str,
    from: RequestStatus,
    to: RequestStatus,
) -> std::result::Result<(), StoreError> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    warn!(peer = %peer_id, from = %from, to = %to, "Dropping illegal request transition");
    Err(StoreError::InvalidTransition { from, to })
}

fn mark(registry: &mut PeerRegistry, from: &str, status: PeerStatus) {
    if let Ok(peer_id) = from.parse::<PeerId>() {
        registry.set_status(&peer_id, status);
    }
}

fn parse_peer_id(from: &str) -> Result<PeerId> {
    from.parse::<PeerId>()
        .map_err(|_| HandlerError::UnknownPeer(from.to_string()))
}
