//! The coordination loop and the handle callers use to drive it.
//!
//! One task owns the [`PeerRegistry`] and multiplexes four sources: new
//! streams, inbound envelopes, peer removals and caller commands. Every
//! registry mutation and every connection-request transition happens on
//! that task, so none of them can race. Writes to a peer that may block
//! (handshakes on connect, acks on accept) run outside the loop.
//!
//! When two streams to the same peer cross (each side dialed the other),
//! both nodes keep the stream dialed by the lower peer id.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use libp2p::{identity::Keypair, Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ychat_shared::Envelope;
use ychat_store::{ChatMessage, ConnectionRequest, PeerInfo, RequestStatus, Storage, StoreError};

use crate::config::NodeConfig;
use crate::error::{NetError, Result};
use crate::eventbus::EventBus;
use crate::handler::{HandlerError, MessageHandler};
use crate::handshake::local_handshake;
use crate::peer::{BoxedStream, Direction, Peer, PeerRemoval, PeerStatus};
use crate::registry::PeerRegistry;
use crate::transport::{listen_and_accept, InboundStream, Transport};

/// Requests sent *into* the coordination loop.
enum ServerCommand {
    /// An outbound stream we opened; the loop records the `sent` request.
    Register {
        peer_id: PeerId,
        address: Option<Multiaddr>,
        stream: BoxedStream,
        reply: oneshot::Sender<(Peer, Outreach)>,
    },
    /// Our handshake never left; drop the `sent` request recorded for it.
    Withdraw {
        peer_id: PeerId,
        reply: oneshot::Sender<()>,
    },
    GetPeers(oneshot::Sender<Vec<Peer>>),
    GetPeer {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<Peer>>,
    },
    /// Local user's answer to an `awaiting_decision` request.
    Decide {
        peer_id: PeerId,
        accept: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// What a new outbound registration means for the connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outreach {
    /// A `sent` request was recorded now and must be withdrawn if our
    /// handshake cannot be delivered.
    Recorded,
    /// A `sent` request already existed; the handshake is repeated.
    Repeated,
    /// The peer is waiting for our decision; no handshake is sent.
    AwaitingUs,
}

pub struct Server {
    config: NodeConfig,
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
}

impl Server {
    pub fn new(config: NodeConfig, storage: Arc<dyn Storage>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            storage,
            events,
        }
    }

    /// Launch the coordination loop, then bring up the transport under
    /// `keypair`. A bind failure stops the loop and is returned.
    pub async fn start(self, keypair: Keypair) -> Result<ServerHandle> {
        let config = self.config.clone();
        let handle = self.start_loop(keypair.public().to_peer_id());

        match listen_and_accept(&config, keypair, handle.streams_tx.clone()).await {
            Ok(transport) => {
                let _ = handle.transport.set(transport);
                Ok(handle)
            }
            Err(e) => {
                error!(error = %e, "Transport failed to start");
                handle.shutdown().await;
                Err(e)
            }
        }
    }

    /// Launch only the coordination loop for the node `local_peer_id`.
    /// Streams are then supplied through [`ServerHandle::attach_inbound`]
    /// and [`ServerHandle::connect_stream`].
    pub fn start_loop(self, local_peer_id: PeerId) -> ServerHandle {
        let capacity = self.config.channel_capacity;
        let (streams_tx, streams_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (removal_tx, removal_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);

        let coordinator = Coordinator {
            handler: MessageHandler::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.events),
                &self.config,
                local_peer_id,
            ),
            local_peer_id,
            config: self.config.clone(),
            storage: Arc::clone(&self.storage),
            registry: PeerRegistry::new(),
            inbound_tx,
            removal_tx,
        };
        tokio::spawn(coordinator.run(streams_rx, inbound_rx, removal_rx, cmd_rx));

        ServerHandle {
            local_peer_id,
            cmd_tx,
            streams_tx,
            transport: Arc::new(OnceLock::new()),
            storage: self.storage,
            events: self.events,
            config: Arc::new(self.config),
        }
    }
}

/// Cloneable entry point for everything outside the loop.
#[derive(Clone)]
pub struct ServerHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<ServerCommand>,
    streams_tx: mpsc::Sender<InboundStream>,
    transport: Arc<OnceLock<Transport>>,
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    config: Arc<NodeConfig>,
}

impl ServerHandle {
    /// Dial `remote` (a multiaddr ending in `/p2p/<peer id>`), register the
    /// stream and send our handshake.
    pub async fn connect(&self, remote: &str) -> Result<Peer> {
        self.connect_with_cancel(remote, &CancellationToken::new()).await
    }

    pub async fn connect_with_cancel(&self, remote: &str, cancel: &CancellationToken) -> Result<Peer> {
        let address: Multiaddr = remote.parse().map_err(|e| NetError::InvalidAddress {
            addr: remote.to_string(),
            reason: format!("{e}"),
        })?;
        let transport = self.transport()?;

        let (peer_id, stream) = transport
            .open_stream(&address, cancel)
            .await
            .map_err(|e| {
                warn!(addr = %remote, error = %e, "Connect failed");
                e
            })?;

        self.connect_stream(peer_id, Some(address), stream).await
    }

    /// Register an already authenticated outbound stream, record the `sent`
    /// request and introduce ourselves. When the handshake cannot be
    /// delivered the `sent` request recorded for it is withdrawn.
    pub async fn connect_stream(
        &self,
        peer_id: PeerId,
        address: Option<Multiaddr>,
        stream: BoxedStream,
    ) -> Result<Peer> {
        let (reply, rx) = oneshot::channel();
        self.command(ServerCommand::Register {
            peer_id,
            address,
            stream,
            reply,
        })
        .await?;
        let (peer, outreach) = rx.await.map_err(|_| NetError::Shutdown)?;

        if outreach == Outreach::AwaitingUs {
            info!(peer = %peer_id, "Peer already asked to connect, its request awaits our decision");
            return Ok(peer);
        }

        let hs = Envelope::handshake(&local_handshake(
            self.storage.as_ref(),
            &self.config.node_name,
            &self.config.version,
        ));
        match self.deliver_handshake(peer, &hs).await {
            Ok(peer) => {
                info!(peer = %peer_id, "Handshake sent");
                Ok(peer)
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Handshake not delivered");
                if outreach == Outreach::Recorded {
                    self.withdraw(peer_id).await;
                }
                Err(e)
            }
        }
    }

    /// Send `hs` on `peer`, or on the stream that replaced it if a crossing
    /// dial won the tie-break in the meantime.
    async fn deliver_handshake(&self, peer: Peer, hs: &Envelope) -> Result<Peer> {
        let timeout = self.config.dial_timeout;
        let first = match tokio::time::timeout(timeout, peer.send(hs)).await {
            Ok(res) => res,
            Err(_) => Err(NetError::Timeout(timeout)),
        };
        let Err(e) = first else {
            return Ok(peer);
        };

        match self.get_peer(&peer.peer_id()).await? {
            Some(live) if live.conn_id() != peer.conn_id() && !live.is_closed() => {
                debug!(peer = %live.peer_id(), conn = live.conn_id(), "Retrying handshake on replacement stream");
                tokio::time::timeout(timeout, live.send(hs))
                    .await
                    .map_err(|_| NetError::Timeout(timeout))??;
                Ok(live)
            }
            _ => Err(e),
        }
    }

    async fn withdraw(&self, peer_id: PeerId) {
        let (reply, rx) = oneshot::channel();
        if self
            .command(ServerCommand::Withdraw { peer_id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Hand an inbound stream to the loop (what the transport does for
    /// every accepted stream).
    pub async fn attach_inbound(&self, inbound: InboundStream) -> Result<()> {
        self.streams_tx
            .send(inbound)
            .await
            .map_err(|_| NetError::Shutdown)
    }

    /// Snapshot of the registry; it does not stay live.
    pub async fn get_peers(&self) -> Result<Vec<Peer>> {
        let (reply, rx) = oneshot::channel();
        self.command(ServerCommand::GetPeers(reply)).await?;
        rx.await.map_err(|_| NetError::Shutdown)
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Result<Option<Peer>> {
        let (reply, rx) = oneshot::channel();
        self.command(ServerCommand::GetPeer {
            peer_id: *peer_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NetError::Shutdown)
    }

    /// Accept an `awaiting_decision` request. The peer must be connected so
    /// the ack can reach it. The request is accepted before the ack is
    /// written; an ack that cannot be delivered is reported as an error and
    /// repeated when the peer reconnects.
    pub async fn accept_request(&self, peer_id: &PeerId) -> Result<()> {
        self.decide(*peer_id, true).await
    }

    pub async fn reject_request(&self, peer_id: &PeerId) -> Result<()> {
        self.decide(*peer_id, false).await
    }

    async fn decide(&self, peer_id: PeerId, accept: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(ServerCommand::Decide {
            peer_id,
            accept,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NetError::Shutdown)?
    }

    /// Requests waiting for a local decision, oldest first.
    pub fn pending_requests(&self) -> Result<Vec<ConnectionRequest>> {
        Ok(self
            .storage
            .list_connection_requests(RequestStatus::AwaitingDecision)?)
    }

    pub fn contacts(&self) -> Result<Vec<PeerInfo>> {
        Ok(self.storage.list_peer_info()?)
    }

    pub fn chat_history(&self, peer_id: &PeerId, limit: u32) -> Result<Vec<ChatMessage>> {
        Ok(self.storage.list_chat_messages(&peer_id.to_string(), limit)?)
    }

    /// Send a chat line to a connected peer and record it in the history.
    /// The history write is best effort.
    pub async fn send_chat(&self, peer_id: &PeerId, text: &str) -> Result<()> {
        let peer = self
            .get_peer(peer_id)
            .await?
            .ok_or(NetError::PeerNotConnected(*peer_id))?;

        peer.send(&Envelope::chat(text)).await?;

        let entry = ChatMessage::new(self.local_peer_id.to_string(), peer_id.to_string(), text);
        if let Err(e) = self.storage.create_chat_message(&entry) {
            warn!(peer = %peer_id, error = %e, "Failed to persist chat message");
        }
        Ok(())
    }

    pub fn node_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn full_addresses(&self) -> Vec<String> {
        self.transport
            .get()
            .map(Transport::full_addresses)
            .unwrap_or_default()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stop the transport and the loop, closing every peer.
    pub async fn shutdown(&self) {
        if let Some(transport) = self.transport.get() {
            transport.shutdown().await;
        }
        let (reply, rx) = oneshot::channel();
        if self.command(ServerCommand::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn transport(&self) -> Result<&Transport> {
        self.transport.get().ok_or(NetError::NotListening)
    }

    async fn command(&self, cmd: ServerCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| NetError::Shutdown)
    }
}

struct Coordinator {
    local_peer_id: PeerId,
    config: NodeConfig,
    storage: Arc<dyn Storage>,
    handler: MessageHandler,
    registry: PeerRegistry,
    inbound_tx: mpsc::Sender<Envelope>,
    removal_tx: mpsc::Sender<PeerRemoval>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut streams_rx: mpsc::Receiver<InboundStream>,
        mut inbound_rx: mpsc::Receiver<Envelope>,
        mut removal_rx: mpsc::Receiver<PeerRemoval>,
        mut cmd_rx: mpsc::Receiver<ServerCommand>,
    ) {
        info!(node = %self.config.node_name, version = %self.config.version, "Coordination loop started");

        loop {
            tokio::select! {
                Some(inbound) = streams_rx.recv() => {
                    self.register(inbound.peer_id, inbound.address, Direction::Inbound, inbound.stream);
                }

                Some(envelope) = inbound_rx.recv() => self.dispatch(envelope),

                Some(removal) = removal_rx.recv() => self.remove(removal),

                cmd = cmd_rx.recv() => match cmd {
                    Some(ServerCommand::Shutdown(reply)) => {
                        self.registry.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
            }
        }

        self.registry.close_all();
        info!(node = %self.config.node_name, "Coordination loop stopped");
    }

    /// Wrap `stream` in a Peer and start its read loop. An older stream for
    /// the same id is replaced, unless the two were dialed from opposite
    /// ends while the peer is still pending: then the stream dialed by the
    /// lower peer id stays and the other is closed. Returns the peer that is
    /// registered afterwards.
    fn register(
        &mut self,
        peer_id: PeerId,
        address: Option<Multiaddr>,
        direction: Direction,
        stream: BoxedStream,
    ) -> Peer {
        let (peer, reader) = Peer::new(peer_id, address, direction, stream);
        tokio::spawn(reader.read_loop(self.inbound_tx.clone(), self.removal_tx.clone()));

        if let Some(existing) = self.registry.get(&peer_id) {
            let crossing = !existing.is_closed()
                && existing.status() == PeerStatus::Pending
                && existing.direction() != direction;
            if crossing && self.dialer(peer_id, existing.direction()) < self.dialer(peer_id, direction) {
                info!(peer = %peer_id, kept = existing.conn_id(), dropped = peer.conn_id(), "Crossing stream lost the tie-break");
                peer.close();
                return existing.clone();
            }
        }

        if let Some(old) = self.registry.insert(peer.clone()) {
            info!(peer = %peer_id, old_conn = old.conn_id(), "Replacing existing stream");
            old.close();
        }

        info!(peer = %peer_id, direction = ?direction, peers = self.registry.len(), "Peer registered");
        peer
    }

    fn dialer(&self, remote: PeerId, direction: Direction) -> PeerId {
        match direction {
            Direction::Outbound => self.local_peer_id,
            Direction::Inbound => remote,
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let from = envelope.from.clone().unwrap_or_default();
        let kind = envelope.kind;

        if let Err(e) = self.handler.handle(&mut self.registry, envelope) {
            match e {
                HandlerError::VersionMismatch { .. } => {
                    info!(peer = %from, kind = %kind, error = %e, "Handshake refused")
                }
                HandlerError::Decode(_) => {
                    warn!(peer = %from, kind = %kind, error = %e, "Dropping undecodable envelope")
                }
                _ => warn!(peer = %from, kind = %kind, error = %e, "Envelope not applied"),
            }
        }
    }

    fn remove(&mut self, removal: PeerRemoval) {
        match self.registry.remove(&removal.peer_id, removal.conn_id) {
            Some(_) => info!(peer = %removal.peer_id, peers = self.registry.len(), "Peer disconnected"),
            None => debug!(peer = %removal.peer_id, conn = removal.conn_id, "Ignoring removal of replaced stream"),
        }
    }

    fn on_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Register {
                peer_id,
                address,
                stream,
                reply,
            } => {
                let peer = self.register(peer_id, address, Direction::Outbound, stream);
                let outreach = self.record_sent(&peer);
                let _ = reply.send((peer, outreach));
            }
            ServerCommand::Withdraw { peer_id, reply } => {
                match self.storage.withdraw_sent_request(&peer_id.to_string()) {
                    Ok(()) => info!(peer = %peer_id, "Withdrew undelivered connection request"),
                    Err(StoreError::NotFound) => debug!(peer = %peer_id, "No sent request to withdraw"),
                    Err(e) => warn!(peer = %peer_id, error = %e, "Failed to withdraw sent request"),
                }
                let _ = reply.send(());
            }
            ServerCommand::GetPeers(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            ServerCommand::GetPeer { peer_id, reply } => {
                let _ = reply.send(self.registry.get(&peer_id).cloned());
            }
            ServerCommand::Decide {
                peer_id,
                accept,
                reply,
            } => match self.decide(peer_id, accept) {
                Ok(Some((peer, ack))) => deliver_ack(peer, ack, self.config.dial_timeout, reply),
                Ok(None) => {
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ServerCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Persist `sent` for an outbound peer unless a request is already pending.
    fn record_sent(&self, peer: &Peer) -> Outreach {
        let key = peer.peer_id().to_string();

        match self.storage.find_connection_request(&key, RequestStatus::AwaitingDecision) {
            Ok(Some(_)) => return Outreach::AwaitingUs,
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %key, error = %e, "Failed to look up connection request");
                return Outreach::Repeated;
            }
        }
        match self.storage.find_connection_request(&key, RequestStatus::Sent) {
            Ok(Some(_)) => {
                debug!(peer = %key, "Sent request already recorded");
                return Outreach::Repeated;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %key, error = %e, "Failed to look up connection request");
                return Outreach::Repeated;
            }
        }

        let address = peer.address().map(ToString::to_string).unwrap_or_default();
        match self
            .storage
            .create_connection_request(&ConnectionRequest::new(&key, RequestStatus::Sent, address))
        {
            Ok(()) => {
                debug!(peer = %key, "Recorded sent connection request");
                Outreach::Recorded
            }
            Err(StoreError::Duplicate(_)) => {
                debug!(peer = %key, "Sent request already recorded");
                Outreach::Repeated
            }
            Err(e) => {
                warn!(peer = %key, error = %e, "Failed to record sent connection request");
                Outreach::Repeated
            }
        }
    }

    /// Apply the local decision. On accept, returns the peer and the ack to
    /// write to it once the loop has moved on.
    fn decide(&mut self, peer_id: PeerId, accept: bool) -> Result<Option<(Peer, Envelope)>> {
        let key = peer_id.to_string();
        let request = self
            .storage
            .find_connection_request(&key, RequestStatus::AwaitingDecision)?
            .ok_or(NetError::NoPendingRequest(peer_id))?;
        let peer = self.registry.get(&peer_id).filter(|p| !p.is_closed()).cloned();

        if accept {
            let peer = peer.ok_or(NetError::PeerNotConnected(peer_id))?;
            let ack = Envelope::handshake_ack(&self.handler.local_handshake());

            self.handler
                .complete_acceptance(request, RequestStatus::AwaitingDecision, None)?;
            self.registry.set_status(&peer_id, PeerStatus::Active);
            info!(peer = %peer_id, "Connection request accepted");
            Ok(Some((peer, ack)))
        } else {
            self.handler
                .complete_rejection(request, RequestStatus::AwaitingDecision)?;

            if let Some(peer) = peer {
                peer.send_detached(Envelope::handshake_reject());
                self.registry.set_status(&peer_id, PeerStatus::Inactive);
            }
            info!(peer = %peer_id, "Connection request rejected");
            Ok(None)
        }
    }
}

/// Write the acceptance ack off the loop and report the outcome on `reply`.
/// A peer that cannot take the ack is closed; the ack is repeated when it
/// reconnects as a known contact.
fn deliver_ack(peer: Peer, ack: Envelope, timeout: Duration, reply: oneshot::Sender<Result<()>>) {
    tokio::spawn(async move {
        let res = match tokio::time::timeout(timeout, peer.send(&ack)).await {
            Ok(res) => res,
            Err(_) => Err(NetError::Timeout(timeout)),
        };
        if let Err(e) = &res {
            warn!(peer = %peer.peer_id(), error = %e, "Handshake ack not delivered, closing stream");
            peer.close();
        }
        let _ = reply.send(res);
    });
}
