//! Process-level settings that do not belong in [`NodeConfig`](ychat_net::NodeConfig).

use anyhow::{bail, Result};

#[derive(Clone)]
pub struct NodeOptions {
    /// Env: `YCHAT_PASSPHRASE` (required)
    pub passphrase: String,
    /// Env: `YCHAT_USERNAME`
    pub username: Option<String>,
    /// Env: `YCHAT_AVATAR_URL`
    pub avatar_url: String,
    /// Env: `YCHAT_DIAL`, comma separated full multiaddrs.
    pub dial: Vec<String>,
    /// Env: `YCHAT_AUTO_ACCEPT` (true/false)
    pub auto_accept: bool,
}

impl NodeOptions {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let passphrase = match lookup("YCHAT_PASSPHRASE") {
            Some(p) if !p.is_empty() => p,
            _ => bail!("YCHAT_PASSPHRASE must be set"),
        };

        Ok(Self {
            passphrase,
            username: lookup("YCHAT_USERNAME").filter(|s| !s.trim().is_empty()),
            avatar_url: lookup("YCHAT_AVATAR_URL").unwrap_or_default(),
            dial: lookup("YCHAT_DIAL").map(|v| parse_dial_list(&v)).unwrap_or_default(),
            auto_accept: lookup("YCHAT_AUTO_ACCEPT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }
}

// Passphrase stays out of logs.
impl std::fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("username", &self.username)
            .field("avatar_url", &self.avatar_url)
            .field("dial", &self.dial)
            .field("auto_accept", &self.auto_accept)
            .finish_non_exhaustive()
    }
}

fn parse_dial_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
