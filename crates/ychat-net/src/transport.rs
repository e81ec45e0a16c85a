//! libp2p transport: listening, dialing and the hand-off of every application stream to the server.
//!
//! The swarm runs in its own task and is driven through [`SwarmCommand`]s;
//! a second task accepts inbound `/ychat/1.0.0` streams and pushes them onto
//! the bounded channel the coordination loop drains.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    identify,
    identity::Keypair,
    multiaddr::Protocol,
    noise,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ychat_shared::constants::{IDENTIFY_PROTOCOL_VERSION, STREAM_PROTOCOL};
use ychat_shared::{Identity, KeystoreError};

use crate::behaviour::{ChatBehaviour, ChatBehaviourEvent};
use crate::config::NodeConfig;
use crate::error::{NetError, Result};
use crate::peer::BoxedStream;

/// An authenticated inbound stream, ready to become a [`Peer`](crate::Peer).
pub struct InboundStream {
    pub peer_id: PeerId,
    pub address: Option<Multiaddr>,
    pub stream: BoxedStream,
}

/// Commands sent *into* the swarm task.
enum SwarmCommand {
    Dial {
        peer_id: PeerId,
        address: Multiaddr,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoteAddress {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<Multiaddr>>,
    },
    Shutdown,
}

/// Cloneable handle to a running transport.
#[derive(Clone)]
pub struct Transport {
    local_peer_id: PeerId,
    control: libp2p_stream::Control,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    dial_timeout: Duration,
}

/// The libp2p keypair for a decrypted node identity.
pub fn identity_keypair(identity: &Identity) -> Result<Keypair> {
    Keypair::ed25519_from_bytes(*identity.secret_bytes())
        .map_err(|e| NetError::Identity(KeystoreError::Format(e.to_string())))
}

/// Bind `config.listen_addr` under `keypair` and start accepting streams.
///
/// Returns once the first listen address is up; a bind failure is returned
/// immediately. Accepted streams are pushed onto `streams` until the
/// receiver is dropped or the transport is shut down.
pub async fn listen_and_accept(
    config: &NodeConfig,
    keypair: Keypair,
    streams: mpsc::Sender<InboundStream>,
) -> Result<Transport> {
    let mut swarm = build_swarm(keypair, &config.listen_addr)?;
    let local_peer_id = *swarm.local_peer_id();

    swarm
        .listen_on(config.listen_addr.clone())
        .map_err(|e| bind_error(&config.listen_addr, e))?;

    let first_addr = wait_for_listen_addr(&mut swarm, &config.listen_addr).await?;
    let listen_addrs = Arc::new(RwLock::new(vec![first_addr]));

    let mut control = swarm.behaviour().stream.new_control();
    let incoming = control
        .accept(StreamProtocol::new(STREAM_PROTOCOL))
        .map_err(|e| bind_error(&config.listen_addr, e))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);

    tokio::spawn(run_swarm(swarm, cmd_rx, Arc::clone(&listen_addrs)));
    tokio::spawn(accept_streams(incoming, cmd_tx.clone(), streams));

    info!(
        node = %config.node_name,
        peer_id = %local_peer_id,
        addr = %config.listen_addr,
        "Listening for chat streams"
    );

    Ok(Transport {
        local_peer_id,
        control,
        cmd_tx,
        listen_addrs,
        dial_timeout: config.dial_timeout,
    })
}

impl Transport {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dialable addresses with `/p2p/<local id>` appended, for sharing out
    /// of band.
    pub fn full_addresses(&self) -> Vec<String> {
        let addrs = self.listen_addrs.read().unwrap_or_else(|e| e.into_inner());
        addrs
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.local_peer_id)).to_string())
            .collect()
    }

    /// Connect to `address` (which must end in `/p2p/<peer id>`) and open a
    /// chat stream, bounded by the dial timeout and `cancel`.
    pub async fn open_stream(
        &self,
        address: &Multiaddr,
        cancel: &CancellationToken,
    ) -> Result<(PeerId, BoxedStream)> {
        let peer_id = peer_id_from_addr(address)?;
        if peer_id == self.local_peer_id {
            return Err(NetError::InvalidAddress {
                addr: address.to_string(),
                reason: "address points at this node".into(),
            });
        }

        let dial = async {
            let (reply, rx) = oneshot::channel();
            self.cmd_tx
                .send(SwarmCommand::Dial {
                    peer_id,
                    address: address.clone(),
                    reply,
                })
                .await
                .map_err(|_| NetError::Shutdown)?;
            rx.await.map_err(|_| NetError::Shutdown)??;

            let stream = self
                .control
                .clone()
                .open_stream(peer_id, StreamProtocol::new(STREAM_PROTOCOL))
                .await
                .map_err(|e| NetError::Protocol(e.to_string()))?;

            Ok::<_, NetError>((peer_id, Box::new(stream.compat()) as BoxedStream))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NetError::Cancelled),
            res = tokio::time::timeout(self.dial_timeout, dial) => {
                res.map_err(|_| NetError::Timeout(self.dial_timeout))?
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SwarmCommand::Shutdown).await;
    }
}

fn build_swarm(keypair: Keypair, listen_addr: &Multiaddr) -> Result<Swarm<ChatBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| bind_error(listen_addr, e))?
        .with_quic()
        .with_behaviour(|key| ChatBehaviour {
            stream: libp2p_stream::Behaviour::new(),
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL_VERSION.to_string(),
                key.public(),
            )),
        })
        .map_err(|e| bind_error(listen_addr, e))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(3600)))
        .build();

    debug!(peer_id = %swarm.local_peer_id(), "Built swarm with TCP + QUIC transport");
    Ok(swarm)
}

async fn wait_for_listen_addr(
    swarm: &mut Swarm<ChatBehaviour>,
    listen_addr: &Multiaddr,
) -> Result<Multiaddr> {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on new address");
                return Ok(address);
            }
            SwarmEvent::ListenerError { error, .. } => {
                return Err(bind_error(listen_addr, error));
            }
            SwarmEvent::ListenerClosed { reason, .. } => {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(NetError::Bind {
                    addr: listen_addr.to_string(),
                    reason,
                });
            }
            other => debug!(event = ?other, "Swarm event before listening"),
        }
    }
}

async fn run_swarm(
    mut swarm: Swarm<ChatBehaviour>,
    mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
) {
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>> = HashMap::new();
    let mut remote_addrs: HashMap<PeerId, Multiaddr> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SwarmCommand::Dial { peer_id, address, reply }) => {
                        if swarm.is_connected(&peer_id) {
                            let _ = reply.send(Ok(()));
                            continue;
                        }
                        let opts = DialOpts::peer_id(peer_id).addresses(vec![address.clone()]).build();
                        match swarm.dial(opts) {
                            Ok(()) => {
                                debug!(peer = %peer_id, addr = %address, "Dialing peer");
                                pending_dials.entry(peer_id).or_default().push(reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(NetError::Dial(e.to_string())));
                            }
                        }
                    }
                    Some(SwarmCommand::RemoteAddress { peer_id, reply }) => {
                        let _ = reply.send(remote_addrs.get(&peer_id).cloned());
                    }
                    Some(SwarmCommand::Shutdown) | None => {
                        info!("Swarm shutdown requested");
                        break;
                    }
                }
            }

            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        let addr = endpoint.get_remote_address().clone();
                        info!(peer = %peer_id, addr = %addr, "Peer connected");
                        remote_addrs.insert(peer_id, addr);
                        for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                            let _ = reply.send(Ok(()));
                        }
                    }

                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        if num_established == 0 {
                            remote_addrs.remove(&peer_id);
                            info!(peer = %peer_id, "Peer disconnected");
                        }
                    }

                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        if let Some(peer_id) = peer_id {
                            for reply in pending_dials.remove(&peer_id).unwrap_or_default() {
                                let _ = reply.send(Err(NetError::Dial(error.to_string())));
                            }
                        }
                    }

                    SwarmEvent::IncomingConnectionError { error, .. } => {
                        warn!(error = %error, "Incoming connection error");
                    }

                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(addr = %address, "Listening on new address");
                        let mut addrs = listen_addrs.write().unwrap_or_else(|e| e.into_inner());
                        if !addrs.contains(&address) {
                            addrs.push(address);
                        }
                    }

                    SwarmEvent::ExpiredListenAddr { address, .. } => {
                        listen_addrs
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .retain(|a| a != &address);
                    }

                    SwarmEvent::Behaviour(ChatBehaviourEvent::Identify(
                        identify::Event::Received { peer_id, info, .. },
                    )) => {
                        debug!(
                            peer = %peer_id,
                            protocol = %info.protocol_version,
                            agent = %info.agent_version,
                            "Identify: received info from peer"
                        );
                    }

                    _ => {}
                }
            }
        }
    }

    info!("Swarm event loop terminated");
}

async fn accept_streams(
    mut incoming: libp2p_stream::IncomingStreams,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    streams: mpsc::Sender<InboundStream>,
) {
    while let Some((peer_id, stream)) = incoming.next().await {
        let (reply, rx) = oneshot::channel();
        let address = match cmd_tx
            .send(SwarmCommand::RemoteAddress { peer_id, reply })
            .await
        {
            Ok(()) => rx.await.ok().flatten(),
            Err(_) => None,
        };

        debug!(peer = %peer_id, addr = ?address, "Accepted inbound stream");
        let inbound = InboundStream {
            peer_id,
            address,
            stream: Box::new(stream.compat()),
        };
        if streams.send(inbound).await.is_err() {
            debug!("Stream receiver dropped, stopping accept loop");
            break;
        }
    }
}

/// Extract the `/p2p/<peer id>` component of a multiaddr.
pub fn peer_id_from_addr(addr: &Multiaddr) -> Result<PeerId> {
    addr.iter()
        .find_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .ok_or_else(|| NetError::InvalidAddress {
            addr: addr.to_string(),
            reason: "missing /p2p/<peer id> component".into(),
        })
}

fn bind_error(addr: &Multiaddr, e: impl std::fmt::Display) -> NetError {
    NetError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ychat_shared::keystore::generate_identity_key;

    #[test]
    fn test_peer_id_from_addr() {
        let id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/3000/p2p/{id}").parse().unwrap();
        assert_eq!(peer_id_from_addr(&addr).unwrap(), id);

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/3000".parse().unwrap();
        assert!(matches!(
            peer_id_from_addr(&bare),
            Err(NetError::InvalidAddress { .. })
        ));
    }

    fn node_config() -> NodeConfig {
        NodeConfig {
            listen_addr: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            dial_timeout: Duration::from_secs(10),
            ..NodeConfig::default()
        }
    }

    fn keypair() -> Keypair {
        identity_keypair(&generate_identity_key().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_listens_under_the_identity_key() {
        let identity = generate_identity_key().unwrap();
        let expected = identity_keypair(&identity).unwrap().public().to_peer_id();
        assert_eq!(identity_keypair(&identity).unwrap().public().to_peer_id(), expected);

        let (tx, _rx) = mpsc::channel(4);
        let t = listen_and_accept(&node_config(), identity_keypair(&identity).unwrap(), tx)
            .await
            .unwrap();
        assert_eq!(t.local_peer_id(), expected);
        assert!(t.full_addresses()[0].ends_with(&format!("/p2p/{expected}")));
        t.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let mut config = node_config();
        config.listen_addr = "/ip4/203.0.113.1/tcp/1".parse().unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let err = listen_and_accept(&config, keypair(), tx).await.err().unwrap();
        assert!(matches!(err, NetError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_two_nodes_open_a_stream() {
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);

        let a = listen_and_accept(&node_config(), keypair(), tx_a).await.unwrap();
        let b = listen_and_accept(&node_config(), keypair(), tx_b).await.unwrap();

        let b_addr: Multiaddr = b.full_addresses()[0].parse().unwrap();
        let (remote, _stream) = a.open_stream(&b_addr, &CancellationToken::new()).await.unwrap();
        assert_eq!(remote, b.local_peer_id());

        let inbound = tokio::time::timeout(Duration::from_secs(10), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.peer_id, a.local_peer_id());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_dial() {
        let (tx, _rx) = mpsc::channel(4);
        let t = listen_and_accept(&node_config(), keypair(), tx).await.unwrap();

        let target: Multiaddr = format!("/ip4/203.0.113.1/tcp/3000/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = t.open_stream(&target, &cancel).await.err().unwrap();
        assert!(matches!(err, NetError::Cancelled));
    }
}
