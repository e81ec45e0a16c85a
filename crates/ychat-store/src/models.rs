//! Records persisted on behalf of the chat core.
//!
//! Peer IDs are stored in their string (base58) form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

// ---------------------------------------------------------------------------
// ConnectionRequest
// ---------------------------------------------------------------------------

/// Lifecycle of a connection request.
///
/// ```text
/// sent ──ack──▶ accepted        awaiting_decision ──accept──▶ accepted
/// sent ──reject──▶ rejected     awaiting_decision ──reject──▶ rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// We dialled the peer and sent our handshake.
    Sent,
    /// The peer sent us a handshake; the local user has to decide.
    AwaitingDecision,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::AwaitingDecision => "awaiting_decision",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    /// `sent` and `awaiting_decision`; at most one per peer at a time.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Sent | Self::AwaitingDecision)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        self.is_pending() && next.is_terminal()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "awaiting_decision" => Ok(Self::AwaitingDecision),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Approval record for a peer relationship. Never deleted; terminal rows
/// form the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub peer_id: String,
    pub status: RequestStatus,
    pub username: String,
    pub avatar_url: String,
    /// Multiaddr the peer was reached at (empty if unknown).
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRequest {
    pub fn new(peer_id: impl Into<String>, status: RequestStatus, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            peer_id: peer_id.into(),
            status,
            username: String::new(),
            avatar_url: String::new(),
            address: address.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_profile(mut self, username: impl Into<String>, avatar_url: impl Into<String>) -> Self {
        self.username = username.into();
        self.avatar_url = avatar_url.into();
        self
    }
}

// ---------------------------------------------------------------------------
// PeerInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Inactive,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for ConnectionState {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Durable contact, created once a connection request is accepted.
/// Primary key is `peer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub username: String,
    pub avatar_url: String,
    pub status: ConnectionState,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

impl PeerInfo {
    /// Contact record for an accepted request.
    pub fn from_request(request: &ConnectionRequest) -> Self {
        Self {
            peer_id: request.peer_id.clone(),
            username: request.username.clone(),
            avatar_url: request.avatar_url.clone(),
            status: ConnectionState::Inactive,
            address: request.address.clone(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// One chat history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: String,
    pub to: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// UserMetadata
// ---------------------------------------------------------------------------

/// The local user's profile, sent to peers inside the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMetadata {
    pub peer_id: String,
    pub username: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}
