// Connection and session layer: transport, peers, coordination loop,
// message dispatch and event fan-out.

pub mod behaviour;
pub mod codec;
pub mod config;
pub mod error;
pub mod eventbus;
pub mod handler;
pub mod handshake;
pub mod peer;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::NodeConfig;
pub use error::{NetError, Result};
pub use eventbus::{Event, EventBus, EventKind, NewConnectionRequestEvent, NewMessageEvent};
pub use handler::{HandlerError, MessageHandler};
pub use peer::{BoxedStream, Direction, Peer, PeerRemoval, PeerStatus};
pub use registry::PeerRegistry;
pub use server::{Server, ServerHandle};
pub use transport::{identity_keypair, listen_and_accept, InboundStream, Transport};

pub use libp2p::{Multiaddr, PeerId};
