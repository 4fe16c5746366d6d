use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use libp2p::futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, identify, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::transport::{SignalingTransport, TopicReceiver};
use crate::connection::NetworkSource;
use crate::error::SessionError;

const IDENTIFY_PROTOCOL: &str = "shuttr/0.1.0";

#[derive(NetworkBehaviour)]
pub struct SessionBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
}

enum SwarmCommand {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<TopicReceiver, SessionError>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
    },
    Unsubscribe {
        topic: String,
    },
}

/// Signaling transport backed by a libp2p gossipsub swarm with mDNS LAN
/// discovery. One swarm serves the whole process; each session subscribes
/// its own topic.
///
/// Subscription confirmation is a command/ack round-trip through the swarm
/// task, which serializes any later publish behind the registered
/// subscription. Cross-peer mesh readiness is not awaited; loss at that
/// level is covered by the negotiation re-send loops.
#[derive(Clone)]
pub struct GossipTransport {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    reachable_rx: watch::Receiver<bool>,
}

impl GossipTransport {
    /// Build the swarm and spawn its event loop.
    pub fn spawn(keypair: Keypair) -> Result<Self, SessionError> {
        let swarm = build_swarm(&keypair).map_err(|e| SessionError::Transport(e.to_string()))?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (reachable_tx, reachable_rx) = watch::channel(false);
        tokio::spawn(run_event_loop(swarm, cmd_rx, reachable_tx));
        Ok(Self {
            cmd_tx,
            reachable_rx,
        })
    }

    /// Reachability watch: true while at least one peer is connected.
    pub fn reachability(&self) -> watch::Receiver<bool> {
        self.reachable_rx.clone()
    }
}

impl NetworkSource for GossipTransport {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.reachability()
    }
}

#[async_trait]
impl SignalingTransport for GossipTransport {
    async fn subscribe(&self, topic: &str) -> Result<TopicReceiver, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Subscribe {
                topic: topic.to_string(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Transport("signaling swarm task is gone".into()))?;
        rx.await
            .map_err(|_| SessionError::Transport("signaling swarm task is gone".into()))?
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        self.cmd_tx
            .send(SwarmCommand::Publish {
                topic: topic.to_string(),
                payload,
            })
            .await
            .map_err(|_| SessionError::Transport("signaling swarm task is gone".into()))
    }

    async fn unsubscribe(&self, topic: &str) {
        let _ = self
            .cmd_tx
            .send(SwarmCommand::Unsubscribe {
                topic: topic.to_string(),
            })
            .await;
    }
}

fn build_swarm(keypair: &Keypair) -> Result<Swarm<SessionBehaviour>, Box<dyn std::error::Error>> {
    let peer_id = PeerId::from(keypair.public());

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(10))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .mesh_n(2)
        .mesh_n_low(1)
        .mesh_n_high(4)
        .mesh_outbound_min(1)
        .flood_publish(true)
        .build()
        .map_err(|e| format!("gossipsub config error: {e}"))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| format!("gossipsub behaviour error: {e}"))?;

    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?;

    let identify = identify::Behaviour::new(identify::Config::new(
        IDENTIFY_PROTOCOL.to_string(),
        keypair.public(),
    ));

    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_behaviour(|_key| {
            Ok(SessionBehaviour {
                gossipsub,
                mdns,
                identify,
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

async fn run_event_loop(
    mut swarm: Swarm<SessionBehaviour>,
    mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    reachable_tx: watch::Sender<bool>,
) {
    let listen_tcp: Multiaddr = "/ip4/0.0.0.0/tcp/0".parse().expect("static multiaddr");
    let listen_quic: Multiaddr = "/ip4/0.0.0.0/udp/0/quic-v1"
        .parse()
        .expect("static multiaddr");
    if let Err(e) = swarm.listen_on(listen_tcp) {
        warn!("failed to listen on tcp: {e}");
    }
    if let Err(e) = swarm.listen_on(listen_quic) {
        warn!("failed to listen on quic: {e}");
    }

    let mut subscribers: HashMap<String, Vec<mpsc::Sender<Bytes>>> = HashMap::new();
    let mut connected_peers: usize = 0;

    loop {
        tokio::select! {
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(SessionBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                    for (peer_id, addr) in peers {
                        info!("mDNS discovered peer: {peer_id} at {addr}");
                        swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                    }
                }
                SwarmEvent::Behaviour(SessionBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                    for (peer_id, _addr) in peers {
                        info!("mDNS peer expired: {peer_id}");
                        swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                    }
                }
                SwarmEvent::Behaviour(SessionBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                    message,
                    propagation_source,
                    ..
                })) => {
                    debug!("gossip message from {propagation_source}");
                    let topic = message.topic.to_string();
                    if let Some(subs) = subscribers.get_mut(&topic) {
                        let payload = Bytes::from(message.data);
                        subs.retain(|tx| {
                            let _ = tx.try_send(payload.clone());
                            !tx.is_closed()
                        });
                    }
                }
                SwarmEvent::Behaviour(SessionBehaviourEvent::Identify(identify::Event::Received {
                    peer_id,
                    info,
                    ..
                })) => {
                    debug!("identified peer {peer_id} running {}", info.protocol_version);
                }
                SwarmEvent::NewListenAddr { address, .. } => {
                    info!("listening on {address}");
                }
                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    info!("connected to {peer_id}");
                    connected_peers += 1;
                    let _ = reachable_tx.send(connected_peers > 0);
                }
                SwarmEvent::ConnectionClosed { peer_id, .. } => {
                    info!("disconnected from {peer_id}");
                    connected_peers = connected_peers.saturating_sub(1);
                    let _ = reachable_tx.send(connected_peers > 0);
                }
                _ => {}
            },
            Some(cmd) = cmd_rx.recv() => match cmd {
                SwarmCommand::Subscribe { topic, reply } => {
                    let ident = gossipsub::IdentTopic::new(&topic);
                    let result = match swarm.behaviour_mut().gossipsub.subscribe(&ident) {
                        Ok(_) => {
                            let (tx, rx) = mpsc::channel(64);
                            subscribers.entry(topic.clone()).or_default().push(tx);
                            info!("subscribed to topic: {topic}");
                            Ok(rx)
                        }
                        Err(e) => Err(SessionError::ChannelUnavailable(e.to_string())),
                    };
                    let _ = reply.send(result);
                }
                SwarmCommand::Publish { topic, payload } => {
                    let ident = gossipsub::IdentTopic::new(&topic);
                    if let Err(e) = swarm.behaviour_mut().gossipsub.publish(ident, payload.to_vec()) {
                        // Loss is tolerated here; negotiation re-sends cover it.
                        debug!("publish to {topic} failed: {e}");
                    }
                }
                SwarmCommand::Unsubscribe { topic } => {
                    subscribers.remove(&topic);
                    let ident = gossipsub::IdentTopic::new(&topic);
                    let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&ident);
                }
            },
            else => break,
        }
    }
}
