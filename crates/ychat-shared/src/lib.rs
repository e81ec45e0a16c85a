//! Primitives shared by every ychat crate: the node identity and its
//! encrypted key file, session-encryption helpers, and the wire envelope.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod protocol;

pub use error::{CryptoError, KeystoreError};
pub use identity::Identity;
pub use protocol::{ChatPayload, Envelope, HandShake, Message, MessageType, UserInfo};
