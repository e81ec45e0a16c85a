//! Composed libp2p `NetworkBehaviour` for ychat nodes.
//!
//! Streams for the chat protocol are handed out by `libp2p_stream`; the
//! swarm itself only carries Identify alongside it.

use libp2p::{identify, swarm::NetworkBehaviour};

/// Driven by the single swarm task in [`crate::transport`]. The derive
/// generates `ChatBehaviourEvent` with one variant per field.
#[derive(NetworkBehaviour)]
pub struct ChatBehaviour {
    /// Raw application streams (`/ychat/1.0.0`).
    pub stream: libp2p_stream::Behaviour,
    /// Protocol identification and listen-address exchange.
    pub identify: identify::Behaviour,
}
