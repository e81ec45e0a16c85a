//! Node configuration loaded from environment variables.
//!
//! All settings have defaults so a node can start with zero configuration
//! for local development.

use std::path::PathBuf;
use std::time::Duration;

use libp2p::Multiaddr;

use ychat_shared::constants::{
    DATABASE_FILE_NAME, DEFAULT_APP_VERSION, DEFAULT_DATA_DIR, DEFAULT_LISTEN_ADDR,
    DEFAULT_NODE_NAME, IDENTITY_FILE_NAME,
};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// libp2p multiaddr to listen on.
    /// Env: `YCHAT_LISTEN_ADDR`
    /// Default: `/ip4/0.0.0.0/tcp/3000`
    pub listen_addr: Multiaddr,

    /// Name used in logs and as the handshake username when no local
    /// profile exists.
    /// Env: `YCHAT_NODE_NAME`
    pub node_name: String,

    /// Protocol version compared during the handshake.
    /// Env: `YCHAT_VERSION`
    /// Default: `ychat v0.1-alpha`
    pub version: String,

    /// Env: `YCHAT_DATA_DIR`
    /// Default: `./.ychat`
    pub data_dir: PathBuf,

    /// Encrypted identity file.
    /// Env: `YCHAT_IDENTITY_PATH`
    /// Default: `<data_dir>/identity.key`
    pub identity_path: PathBuf,

    /// Env: `YCHAT_DATABASE_PATH`
    /// Default: `<data_dir>/ychat.db`
    pub database_path: PathBuf,

    /// Upper bound on dial + stream negotiation.
    /// Env: `YCHAT_DIAL_TIMEOUT_SECS`
    /// Default: 30 seconds.
    pub dial_timeout: Duration,

    /// Capacity of every hand-off channel feeding the coordination loop.
    /// Env: `YCHAT_CHANNEL_CAPACITY`
    /// Default: 64.
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(".").join(DEFAULT_DATA_DIR);
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.parse().expect("valid multiaddr"),
            node_name: DEFAULT_NODE_NAME.to_string(),
            version: DEFAULT_APP_VERSION.to_string(),
            identity_path: data_dir.join(IDENTITY_FILE_NAME),
            database_path: data_dir.join(DATABASE_FILE_NAME),
            data_dir,
            dial_timeout: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("YCHAT_LISTEN_ADDR") {
            match addr.parse::<Multiaddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(e) => tracing::warn!(
                    value = %addr,
                    error = %e,
                    "Invalid YCHAT_LISTEN_ADDR, using default"
                ),
            }
        }

        if let Some(name) = lookup("YCHAT_NODE_NAME").filter(|s| !s.trim().is_empty()) {
            config.node_name = name;
        }

        if let Some(version) = lookup("YCHAT_VERSION").filter(|s| !s.trim().is_empty()) {
            config.version = version;
        }

        if let Some(dir) = lookup("YCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.identity_path = config.data_dir.join(IDENTITY_FILE_NAME);
            config.database_path = config.data_dir.join(DATABASE_FILE_NAME);
        }

        if let Some(path) = lookup("YCHAT_IDENTITY_PATH") {
            config.identity_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("YCHAT_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("YCHAT_DIAL_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.dial_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid YCHAT_DIAL_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("YCHAT_CHANNEL_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.channel_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid YCHAT_CHANNEL_CAPACITY, using default"),
            }
        }

        config
    }
}
