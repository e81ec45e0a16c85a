/// Default application protocol version exchanged in handshakes
pub const DEFAULT_APP_VERSION: &str = "ychat v0.1-alpha";

/// libp2p stream protocol the chat runs over
pub const STREAM_PROTOCOL: &str = "/ychat/1.0.0";

/// Protocol version string for libp2p identify
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/ychat/id/1.0.0";

/// Application name
pub const APP_NAME: &str = "ychat";

/// Default node name used when no profile is stored
pub const DEFAULT_NODE_NAME: &str = "ychat";

/// Default TCP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/3000";

/// Application data directory (relative to the working directory)
pub const DEFAULT_DATA_DIR: &str = ".ychat";

/// Identity key file name inside the data directory
pub const IDENTITY_FILE_NAME: &str = "identity.key";

/// SQLite database file name inside the data directory
pub const DATABASE_FILE_NAME: &str = "ychat.db";

/// Salt length for passphrase key derivation
pub const SALT_SIZE: usize = 16;

/// ChaCha20-Poly1305 nonce size used by the identity key file
pub const KEYFILE_NONCE_SIZE: usize = 12;

/// XChaCha20-Poly1305 nonce size used by session encryption
pub const NONCE_SIZE: usize = 24;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum encoded envelope size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Key derivation context (BLAKE3) for session keys
pub const KDF_CONTEXT_SESSION_KEY: &str = "ychat-session-key-v1";
