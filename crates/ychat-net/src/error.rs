use std::time::Duration;

use libp2p::PeerId;
use thiserror::Error;

use ychat_shared::KeystoreError;
use ychat_store::StoreError;

use crate::codec::FrameError;

/// Errors surfaced by the transport, peers and server.
#[derive(Error, Debug)]
pub enum NetError {
    /// The identity file could not be loaded or decrypted.
    #[error("Identity error: {0}")]
    Identity(#[from] KeystoreError),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Dial failed: {0}")]
    Dial(String),

    /// The remote did not accept the application stream protocol.
    #[error("Stream negotiation failed: {0}")]
    Protocol(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Peer {0} stream is closed")]
    PeerClosed(PeerId),

    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("No pending connection request from {0}")]
    NoPendingRequest(PeerId),

    /// The transport has not been started.
    #[error("Node is not listening")]
    NotListening,

    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// The coordination loop is gone.
    #[error("Server is shut down")]
    Shutdown,
}

impl From<FrameError> for NetError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => NetError::Io(io),
            other => NetError::Encode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
