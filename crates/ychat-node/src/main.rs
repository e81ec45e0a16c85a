//! # ychat-node
//!
//! Runs one chat node: loads (or creates) the encrypted identity, opens the
//! database, starts the server and logs what happens on the event bus.

mod options;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ychat_net::{identity_keypair, Event, EventBus, EventKind, NodeConfig, PeerId, Server};
use ychat_shared::keystore::ensure_identity;
use ychat_store::{SqliteStore, Storage, UserMetadata};

use crate::options::NodeOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing (respects RUST_LOG)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ychat_net=debug,ychat_store=info")),
        )
        .init();

    info!("Starting ychat node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    let options = NodeOptions::from_env()?;
    info!(?config, ?options, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Identity and storage
    // -----------------------------------------------------------------------
    let identity = ensure_identity(&options.passphrase, &config.identity_path)
        .with_context(|| format!("loading identity from {}", config.identity_path.display()))?;
    let keypair = identity_keypair(&identity).context("converting identity key")?;
    drop(identity);
    let local_peer_id = keypair.public().to_peer_id();

    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    record_login(storage.as_ref(), &local_peer_id, &options)?;

    // -----------------------------------------------------------------------
    // 4. Event bus subscribers
    // -----------------------------------------------------------------------
    let events = Arc::new(EventBus::new());
    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel::<String>();
    let auto_accept = options.auto_accept;

    events.subscribe(EventKind::NewConnectionRequest, move |event| {
        if let Event::NewConnectionRequest(req) = event {
            info!(peer = %req.peer_id, username = %req.username, "Connection request received");
            if auto_accept {
                let _ = accept_tx.send(req.peer_id);
            }
        }
    });
    events.subscribe(EventKind::NewMessage, |event| {
        if let Event::NewMessage(msg) = event {
            info!(from = %msg.from, message = %msg.message, "Chat message");
        }
    });
    events.subscribe(EventKind::ThreadListUpdated, |_| info!("Contact list changed"));

    // -----------------------------------------------------------------------
    // 5. Server
    // -----------------------------------------------------------------------
    let server = Server::new(config, Arc::clone(&storage), events)
        .start(keypair)
        .await
        .context("starting server")?;

    for addr in server.full_addresses() {
        info!(addr = %addr, "Share this address to be reached");
    }

    let handle = server.clone();
    tokio::spawn(async move {
        while let Some(peer) = accept_rx.recv().await {
            let result = match peer.parse::<PeerId>() {
                Ok(peer_id) => handle.accept_request(&peer_id).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Unparseable peer id");
                    continue;
                }
            };
            if let Err(e) = result {
                warn!(peer = %peer, error = %e, "Auto-accept failed");
            }
        }
    });

    for addr in &options.dial {
        match server.connect(addr).await {
            Ok(peer) => info!(peer = %peer.peer_id(), "Connection request sent"),
            Err(e) => warn!(addr = %addr, error = %e, "Could not connect"),
        }
    }

    // -----------------------------------------------------------------------
    // 6. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    server.shutdown().await;

    Ok(())
}

/// Create or refresh the local profile used in outgoing handshakes.
fn record_login(storage: &dyn Storage, peer_id: &PeerId, options: &NodeOptions) -> anyhow::Result<()> {
    let now = Utc::now();
    let existing = storage.first_user_metadata()?;

    let profile = match (existing, &options.username) {
        (Some(mut meta), username) => {
            if let Some(name) = username {
                meta.username.clone_from(name);
                meta.avatar_url.clone_from(&options.avatar_url);
            }
            meta.last_login_at = Some(now);
            meta
        }
        (None, Some(name)) => UserMetadata {
            peer_id: peer_id.to_string(),
            username: name.clone(),
            avatar_url: options.avatar_url.clone(),
            created_at: now,
            last_login_at: Some(now),
        },
        (None, None) => return Ok(()),
    };

    storage.save_user_metadata(&profile)?;
    info!(username = %profile.username, "Local profile ready");
    Ok(())
}
