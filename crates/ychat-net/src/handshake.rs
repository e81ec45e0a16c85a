//! The introduction this node sends on first contact.

use tracing::warn;

use ychat_shared::{HandShake, UserInfo};
use ychat_store::Storage;

/// Build the local handshake from the stored profile. Without a profile
/// (or when the store fails) the node name stands in for the username.
pub fn local_handshake(storage: &dyn Storage, node_name: &str, version: &str) -> HandShake {
    let user_info = match storage.first_user_metadata() {
        Ok(Some(meta)) => UserInfo {
            username: meta.username,
            avatar_url: meta.avatar_url,
        },
        Ok(None) => UserInfo {
            username: node_name.to_string(),
            avatar_url: String::new(),
        },
        Err(e) => {
            warn!(error = %e, "Could not load local profile, using node name");
            UserInfo {
                username: node_name.to_string(),
                avatar_url: String::new(),
            }
        }
    };

    HandShake {
        version: version.to_string(),
        user_info,
    }
}
