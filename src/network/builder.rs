//! One-shot host construction, the implementation behind `configure`.
//!
//! Builds the swarm over a pre-shared-key TCP transport (noise + mplex on
//! top), opens the two datastores, seeds and bootstraps the DHT, and wires
//! the driver up to the shared tables. Construction happens exactly once per
//! process lifetime.

use std::path::PathBuf;
use std::sync::Arc;

use libp2p::identity::Keypair;
use libp2p::pnet::{PnetConfig, PreSharedKey};
use libp2p::{
    core::upgrade, noise, tcp, Multiaddr, PeerId, StreamProtocol, SwarmBuilder, Transport,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::behaviour::HelperBehaviour;
use super::connmgr::ConnectionTracker;
use super::discovery::{rendezvous_key, rendezvous_string};
use super::gating::{GatingPolicy, GatingState};
use super::node::{NodeCommand, NodeDriver, NodeHandle};
use super::pubsub::{SubscriptionTable, Validators};
use crate::crypto::preshared_key;
use crate::rpc::{HelperError, OutboundQueue};
use crate::seq::SeqSource;
use crate::storage::{DhtStore, PeerBook, DHT_DIR, PEERSTORE_DIR};

/// Stream multiplexer protocol id, fixed across the network.
const MPLEX_PROTOCOL_STR: &str = "/coda/mplex/1.0.0";
pub const MPLEX_PROTOCOL: StreamProtocol = StreamProtocol::new(MPLEX_PROTOCOL_STR);

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Everything `configure` hands over.
pub struct NodeConfig {
    pub statedir: PathBuf,
    pub keypair: Keypair,
    pub network_id: String,
    pub listen_on: Vec<Multiaddr>,
    pub external: Multiaddr,
    pub unsafe_no_trust_ip: bool,
    pub flood: bool,
    pub peer_exchange: bool,
    pub direct_peers: Vec<(PeerId, Multiaddr)>,
    pub seed_peers: Vec<(PeerId, Multiaddr)>,
    pub gating: GatingPolicy,
}

pub struct BuiltNode {
    pub handle: NodeHandle,
    pub driver: NodeDriver,
}

/// Constructs the host. The returned driver must be spawned by the caller;
/// the handle is live as soon as it runs.
pub fn build_node(
    config: NodeConfig,
    out: OutboundQueue,
    seq: SeqSource,
    validators: Arc<Validators>,
    subscriptions: Arc<SubscriptionTable>,
) -> Result<BuiltNode, HelperError> {
    let local_peer_id = config.keypair.public().to_peer_id();
    let rendezvous = rendezvous_string(&config.network_id);
    let psk = PreSharedKey::new(preshared_key(&rendezvous));

    let peer_book =
        PeerBook::open(config.statedir.join(PEERSTORE_DIR)).map_err(HelperError::helper)?;
    let dht_store = DhtStore::open(config.statedir.join(DHT_DIR), local_peer_id)
        .map_err(HelperError::helper)?;

    let gating = GatingState::new(config.gating);
    let behaviour_gating = gating.clone();

    let mut swarm = SwarmBuilder::with_existing_identity(config.keypair.clone())
        .with_tokio()
        .with_other_transport(|key| {
            let noise = noise::Config::new(key)?;
            let mut mplex = libp2p_mplex::MplexConfig::new();
            mplex.set_protocol_name(MPLEX_PROTOCOL_STR);
            let tcp = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
            Ok(tcp
                .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
                .upgrade(upgrade::Version::V1Lazy)
                .authenticate(noise)
                .multiplex(mplex))
        })
        .map_err(HelperError::helper)?
        .with_behaviour(|key| {
            HelperBehaviour::new(
                key,
                behaviour_gating,
                dht_store,
                config.flood,
                config.peer_exchange,
            )
        })
        .map_err(HelperError::helper)?
        .with_swarm_config(|c| {
            c.with_idle_connection_timeout(std::time::Duration::from_secs(60))
        })
        .build();

    for addr in &config.listen_on {
        swarm
            .listen_on(addr.clone())
            .map_err(HelperError::helper)?;
    }
    swarm.add_external_address(config.external.clone());

    // Pre-warm the routing table: seeds first, then everything the peerstore
    // remembers from earlier runs.
    for (peer, addr) in &config.seed_peers {
        swarm
            .behaviour_mut()
            .kademlia
            .add_address(peer, addr.clone());
    }
    for (peer, addrs) in peer_book.peers() {
        for addr in addrs {
            swarm.behaviour_mut().kademlia.add_address(&peer, addr);
        }
    }

    let mut tracker = ConnectionTracker::new();
    for (peer, addr) in &config.direct_peers {
        swarm.behaviour_mut().gossipsub.add_explicit_peer(peer);
        swarm
            .behaviour_mut()
            .kademlia
            .add_address(peer, addr.clone());
        tracker.protect(*peer);
    }

    match swarm.behaviour_mut().kademlia.bootstrap() {
        Ok(_) => info!(seeds = config.seed_peers.len(), "bootstrapping the DHT"),
        Err(e) => warn!(error = %e, "DHT bootstrap skipped"),
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(COMMAND_CHANNEL_CAPACITY);
    let stream_control = swarm.behaviour_mut().stream.new_control();

    let handle = NodeHandle {
        cmd_tx: cmd_tx.clone(),
        stream_control,
        local_peer_id,
        rendezvous: rendezvous.clone(),
        gating,
    };

    let driver = NodeDriver {
        swarm,
        cmd_rx,
        cmd_tx,
        out,
        seq,
        validators,
        subscriptions,
        tracker,
        peer_book,
        rendezvous_key: rendezvous_key(&rendezvous),
        advertising: false,
        unsafe_no_trust_ip: config.unsafe_no_trust_ip,
        local_peer_id,
    };

    info!(peer_id = %local_peer_id, %rendezvous, "helper host constructed");
    Ok(BuiltNode { handle, driver })
}
